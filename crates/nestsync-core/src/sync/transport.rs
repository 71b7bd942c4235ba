//! Transport abstraction
//!
//! The replicator talks to a peer through [`Transport`]: it pushes batches of
//! change records and pulls pages of the peer's change feed. Delivery is
//! at-least-once; the receiving store makes re-delivery a no-op.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Ack, ChangeBatch};
use crate::store::DocumentStore;

/// Errors raised while talking to a peer
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not reach the peer or the connection broke
    #[error("Connection error: {0}")]
    Connection(String),

    /// The peer did not answer before the deadline
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// A frame could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// The peer answered with an error
    #[error("Peer error: {0}")]
    Peer(String),

    /// The peer closed the connection
    #[error("Connection closed by peer")]
    Closed,
}

/// A replication peer
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier of the peer; checkpoints are keyed by it
    fn peer_id(&self) -> &str;

    /// Deliver a batch of local changes; resolves once the peer has
    /// durably applied it
    async fn send(&self, batch: ChangeBatch) -> Result<Ack, TransportError>;

    /// Fetch up to `limit` entries of the peer's change feed after `since`
    async fn receive(&self, since: u64, limit: usize) -> Result<ChangeBatch, TransportError>;
}

/// Transport to another store in the same process
///
/// Used to sync two data directories on one machine, and in tests.
pub struct LocalTransport {
    peer_id: String,
    store: Arc<DocumentStore>,
    /// Our peer id as the other store knows it
    client_id: Option<String>,
}

impl LocalTransport {
    pub fn new(peer_id: impl Into<String>, store: Arc<DocumentStore>) -> Self {
        Self {
            peer_id: peer_id.into(),
            store,
            client_id: None,
        }
    }

    /// Identify this side to the other store
    ///
    /// Pushed revisions are recorded as coming from `client_id`, and are not
    /// handed back on pull.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// The store on the other end
    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn send(&self, batch: ChangeBatch) -> Result<Ack, TransportError> {
        self.store
            .import_changes_from(self.client_id.as_deref(), &batch.records)
            .map_err(|e| TransportError::Peer(e.to_string()))
    }

    async fn receive(&self, since: u64, limit: usize) -> Result<ChangeBatch, TransportError> {
        self.store
            .export_changes_for(self.client_id.as_deref(), since, limit)
            .map_err(|e| TransportError::Peer(e.to_string()))
    }
}
