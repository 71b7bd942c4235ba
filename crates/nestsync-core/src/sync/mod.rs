//! Replication
//!
//! Moves revisions between replicas of a collection.
//!
//! ## Pieces
//!
//! - [`Replicator`]: the push/pull state machine with durable checkpoints
//! - [`Transport`]: how the replicator reaches a peer
//! - [`LocalTransport`]: a peer store in the same process
//! - [`WebSocketTransport`] / [`serve_peer`]: client and server over WebSocket
//!
//! ## Usage
//!
//! ```ignore
//! let transport = WebSocketTransport::connect(url, "expenses", &peer_id, timeout).await?;
//! let replicator = Replicator::new(store, Arc::new(transport), ReplicatorConfig::from(&config));
//! replicator.sync().await?;
//! ```

mod message;
mod replicator;
mod state;
mod transport;
mod websocket;

pub use message::{PeerId, PeerRequest, PeerResponse, WireRecord};
pub use replicator::{CancelHandle, DirectionReport, Replicator, ReplicatorConfig, SyncReport};
pub use state::{ReplicationState, SyncEvent, SyncStatus};
pub use transport::{LocalTransport, Transport, TransportError};
pub use websocket::{serve_peer, WebSocketTransport};
