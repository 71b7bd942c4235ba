//! Replication state
//!
//! Observable state of a replication session: the per-direction state
//! machine, the aggregate status shown to users, and the events emitted
//! while syncing.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::Direction;

/// State of one replication direction
///
/// `Idle -> Reading -> Transmitting -> Committing -> Idle`, or `Failed`
/// from any state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReplicationState {
    /// Nothing in flight
    Idle,
    /// Reading the feed from the stored checkpoint
    Reading { checkpoint: u64 },
    /// Waiting on the transport
    Transmitting,
    /// Applying a batch and advancing the checkpoint
    Committing { checkpoint: u64 },
    /// The session stopped on an error
    Failed { reason: String },
}

impl ReplicationState {
    /// Whether a session is running in this direction
    pub fn is_active(&self) -> bool {
        !matches!(self, ReplicationState::Idle | ReplicationState::Failed { .. })
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationState::Idle => write!(f, "idle"),
            ReplicationState::Reading { checkpoint } => write!(f, "reading from {}", checkpoint),
            ReplicationState::Transmitting => write!(f, "transmitting"),
            ReplicationState::Committing { checkpoint } => write!(f, "committing {}", checkpoint),
            ReplicationState::Failed { reason } => write!(f, "failed: {}", reason),
        }
    }
}

/// Aggregate sync status with one peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// When a checkpoint with this peer last advanced
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Local changes not yet acknowledged by the peer
    pub pending_changes: u64,
    /// Whether a session is running
    pub in_progress: bool,
    /// Reason the last session failed, cleared by the next success
    pub last_error: Option<String>,
}

/// Events emitted by the replicator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A direction changed state
    StateChanged {
        direction: Direction,
        state: ReplicationState,
    },
    /// A batch was applied and its checkpoint persisted
    BatchCommitted {
        direction: Direction,
        checkpoint: u64,
        records: usize,
    },
    /// Pulled changes added new revisions locally
    DocumentsUpdated { count: usize },
    /// A direction failed
    Error { direction: Direction, reason: String },
}
