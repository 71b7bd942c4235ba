//! Replicator
//!
//! Moves changes between a local [`DocumentStore`] and a peer reached through
//! a [`Transport`]. Push and pull are independent directions, each driven by
//! the same state machine and each with its own durable checkpoint.
//!
//! ## Protocol
//!
//! Push:
//! 1. Read the local feed after the push checkpoint (one batch)
//! 2. Send it to the peer
//! 3. On ack, persist the last sequence as the new push checkpoint
//!
//! Pull:
//! 1. Ask the peer for its feed after the pull checkpoint (one batch)
//! 2. Graft every record into the local revision trees
//! 3. Persist the peer's last sequence as the new pull checkpoint
//!
//! Both loop until the feed is exhausted. A failure leaves the checkpoint
//! at the last committed batch, so the next session resumes from there.
//! Retries are up to the caller.
//!
//! ## Usage
//!
//! ```ignore
//! let transport = Arc::new(LocalTransport::new("laptop", other_store));
//! let mut replicator = Replicator::new(store, transport, ReplicatorConfig::default());
//! let events = replicator.take_events();
//! let report = replicator.sync().await?;
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::state::{ReplicationState, SyncEvent, SyncStatus};
use super::transport::{Transport, TransportError};
use crate::config::Config;
use crate::models::Direction;
use crate::storage::{StoreError, StoreResult};
use crate::store::DocumentStore;

/// Replication tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorConfig {
    /// Maximum records per batch
    pub batch_size: usize,
    /// Deadline for each transport call
    pub timeout: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for ReplicatorConfig {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            timeout: config.transport_timeout(),
        }
    }
}

/// What one direction of a session did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectionReport {
    /// Batches committed
    pub batches: usize,
    /// Records that were new to the receiving side
    pub applied: usize,
    /// Records the receiving side already had
    pub duplicates: usize,
    /// Checkpoint after the session
    pub checkpoint: u64,
    /// The session stopped early on request
    pub cancelled: bool,
}

/// What a bidirectional session did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub push: DirectionReport,
    pub pull: DirectionReport,
}

/// Requests cancellation of a running session from another task
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Stop at the next batch boundary
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Push/pull replication between a local store and one peer
pub struct Replicator {
    store: Arc<DocumentStore>,
    transport: Arc<dyn Transport>,
    config: ReplicatorConfig,
    /// Push direction state
    push_state: watch::Sender<ReplicationState>,
    push_state_rx: watch::Receiver<ReplicationState>,
    /// Pull direction state
    pull_state: watch::Sender<ReplicationState>,
    pull_state_rx: watch::Receiver<ReplicationState>,
    /// Cancellation flag, checked between batches
    cancel: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    /// Event channel
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    /// Event receiver
    event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    last_error: Mutex<Option<String>>,
}

impl Replicator {
    /// Create a replicator for `store` and the peer behind `transport`
    pub fn new(
        store: Arc<DocumentStore>,
        transport: Arc<dyn Transport>,
        config: ReplicatorConfig,
    ) -> Self {
        let (push_state, push_state_rx) = watch::channel(ReplicationState::Idle);
        let (pull_state, pull_state_rx) = watch::channel(ReplicationState::Idle);
        let (cancel, cancel_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            store,
            transport,
            config,
            push_state,
            push_state_rx,
            pull_state,
            pull_state_rx,
            cancel: Arc::new(cancel),
            cancel_rx,
            event_tx,
            event_rx: Some(event_rx),
            last_error: Mutex::new(None),
        }
    }

    /// Identifier of the peer
    pub fn peer_id(&self) -> &str {
        self.transport.peer_id()
    }

    /// Current state of one direction
    pub fn state(&self, direction: Direction) -> ReplicationState {
        self.state_rx(direction).borrow().clone()
    }

    /// Subscribe to state changes of one direction
    pub fn subscribe_state(&self, direction: Direction) -> watch::Receiver<ReplicationState> {
        self.state_rx(direction).clone()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Handle for cancelling a session from another task
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            tx: Arc::clone(&self.cancel),
        }
    }

    /// Stop the running session at the next batch boundary
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Forget all progress with this peer; the next session starts from
    /// the beginning of both feeds
    pub fn reset_checkpoints(&self) -> StoreResult<()> {
        info!(peer = %self.peer_id(), "resetting checkpoints");
        self.store.reset_checkpoints(self.peer_id())
    }

    /// Aggregate status with this peer
    pub fn status(&self) -> StoreResult<SyncStatus> {
        let push = self.store.checkpoint(self.peer_id(), Direction::Push)?;
        let pull = self.store.checkpoint(self.peer_id(), Direction::Pull)?;

        let last_sync_at = push
            .iter()
            .chain(pull.iter())
            .map(|c| c.updated_at)
            .max();

        Ok(SyncStatus {
            last_sync_at,
            pending_changes: self.store.pending_changes(self.peer_id())?,
            in_progress: self.state(Direction::Push).is_active()
                || self.state(Direction::Pull).is_active(),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        })
    }

    /// Push local changes to the peer
    pub async fn push(&self) -> StoreResult<DirectionReport> {
        self.begin_session();
        let report = self.run(Direction::Push).await;
        self.finish_session(report.as_ref().err());
        report
    }

    /// Pull the peer's changes
    pub async fn pull(&self) -> StoreResult<DirectionReport> {
        self.begin_session();
        let report = self.run(Direction::Pull).await;
        self.finish_session(report.as_ref().err());
        report
    }

    /// Push and pull concurrently
    ///
    /// Both directions run to completion or failure; the first failure is
    /// returned after both have stopped.
    pub async fn sync(&self) -> StoreResult<SyncReport> {
        info!(
            peer = %self.peer_id(),
            collection = %self.store.name(),
            "Starting sync"
        );
        self.begin_session();

        let (push, pull) = tokio::join!(self.run(Direction::Push), self.run(Direction::Pull));
        let result = match (push, pull) {
            (Ok(push), Ok(pull)) => Ok(SyncReport { push, pull }),
            (Err(e), _) | (_, Err(e)) => Err(e),
        };

        self.finish_session(result.as_ref().err());
        match &result {
            Ok(report) => info!(
                pushed = report.push.applied,
                pulled = report.pull.applied,
                "Sync complete"
            ),
            Err(e) => warn!("Sync failed: {}", e),
        }
        result
    }

    // ==================== Session ====================

    fn begin_session(&self) {
        self.cancel.send_replace(false);
    }

    fn finish_session(&self, error: Option<&StoreError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            error.map(|e| e.to_string());
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Run one direction until its feed is exhausted, cancelled or failed
    async fn run(&self, direction: Direction) -> StoreResult<DirectionReport> {
        let result = match direction {
            Direction::Push => self.run_push().await,
            Direction::Pull => self.run_pull().await,
        };

        match &result {
            Ok(_) => self.set_state(direction, ReplicationState::Idle),
            Err(e) => {
                let reason = e.to_string();
                warn!(%direction, peer = %self.peer_id(), "replication failed: {}", reason);
                self.set_state(
                    direction,
                    ReplicationState::Failed {
                        reason: reason.clone(),
                    },
                );
                self.emit(SyncEvent::Error { direction, reason });
            }
        }
        result
    }

    async fn run_push(&self) -> StoreResult<DirectionReport> {
        let peer = self.peer_id();
        let mut report = DirectionReport {
            checkpoint: self.checkpoint(Direction::Push)?,
            ..DirectionReport::default()
        };

        loop {
            if self.is_cancelled() {
                debug!(%peer, "push cancelled");
                report.cancelled = true;
                break;
            }

            let checkpoint = self.checkpoint(Direction::Push)?;
            self.set_state(Direction::Push, ReplicationState::Reading { checkpoint });
            let batch =
                self.store
                    .export_changes_for(Some(peer), checkpoint, self.config.batch_size)?;
            if batch.last_seq <= checkpoint {
                break;
            }
            if batch.records.is_empty() {
                // Everything in this range came from the peer itself
                self.store.save_checkpoint(peer, Direction::Push, batch.last_seq)?;
                report.checkpoint = batch.last_seq;
                continue;
            }

            let records = batch.records.len();
            let last_seq = batch.last_seq;
            self.set_state(Direction::Push, ReplicationState::Transmitting);
            let ack = self.call(self.transport.send(batch)).await?;

            self.set_state(
                Direction::Push,
                ReplicationState::Committing {
                    checkpoint: last_seq,
                },
            );
            self.store.save_checkpoint(peer, Direction::Push, last_seq)?;
            debug!(%peer, checkpoint = last_seq, records, "push batch committed");

            report.batches += 1;
            report.applied += ack.applied;
            report.duplicates += ack.duplicates;
            report.checkpoint = last_seq;
            self.emit(SyncEvent::BatchCommitted {
                direction: Direction::Push,
                checkpoint: last_seq,
                records,
            });
        }

        Ok(report)
    }

    async fn run_pull(&self) -> StoreResult<DirectionReport> {
        let peer = self.peer_id();
        let mut report = DirectionReport {
            checkpoint: self.checkpoint(Direction::Pull)?,
            ..DirectionReport::default()
        };

        loop {
            if self.is_cancelled() {
                debug!(%peer, "pull cancelled");
                report.cancelled = true;
                break;
            }

            let checkpoint = self.checkpoint(Direction::Pull)?;
            self.set_state(Direction::Pull, ReplicationState::Reading { checkpoint });
            self.set_state(Direction::Pull, ReplicationState::Transmitting);
            let batch = self
                .call(self.transport.receive(checkpoint, self.config.batch_size))
                .await?;
            if batch.last_seq <= checkpoint {
                if batch.records.is_empty() {
                    break;
                }
                return Err(TransportError::Peer(format!(
                    "feed did not advance past {}",
                    checkpoint
                ))
                .into());
            }
            if batch.records.is_empty() {
                // The peer skipped entries that originated here
                self.store.save_checkpoint(peer, Direction::Pull, batch.last_seq)?;
                report.checkpoint = batch.last_seq;
                continue;
            }

            let records = batch.records.len();
            self.set_state(
                Direction::Pull,
                ReplicationState::Committing {
                    checkpoint: batch.last_seq,
                },
            );
            let ack = self.store.import_changes_from(Some(peer), &batch.records)?;
            self.store.save_checkpoint(peer, Direction::Pull, batch.last_seq)?;
            debug!(%peer, checkpoint = batch.last_seq, records, "pull batch committed");

            report.batches += 1;
            report.applied += ack.applied;
            report.duplicates += ack.duplicates;
            report.checkpoint = batch.last_seq;
            self.emit(SyncEvent::BatchCommitted {
                direction: Direction::Pull,
                checkpoint: batch.last_seq,
                records,
            });
            if ack.applied > 0 {
                self.emit(SyncEvent::DocumentsUpdated {
                    count: ack.applied,
                });
            }
        }

        Ok(report)
    }

    /// Await a transport call under the configured deadline
    async fn call<T>(
        &self,
        request: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        match tokio::time::timeout(self.config.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.timeout)),
        }
    }

    fn checkpoint(&self, direction: Direction) -> StoreResult<u64> {
        Ok(self
            .store
            .checkpoint(self.peer_id(), direction)?
            .map_or(0, |c| c.seq))
    }

    fn state_rx(&self, direction: Direction) -> &watch::Receiver<ReplicationState> {
        match direction {
            Direction::Push => &self.push_state_rx,
            Direction::Pull => &self.pull_state_rx,
        }
    }

    fn set_state(&self, direction: Direction, state: ReplicationState) {
        let sender = match direction {
            Direction::Push => &self.push_state,
            Direction::Pull => &self.pull_state,
        };
        sender.send_replace(state.clone());
        self.emit(SyncEvent::StateChanged { direction, state });
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.event_tx.send(event);
    }
}
