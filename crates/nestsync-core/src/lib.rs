//! nestsync core library
//!
//! This crate provides the core functionality for nestsync, a local-first
//! document store for household data (expenses, tasks, notes) that
//! replicates between devices.
//!
//! # Architecture
//!
//! - **Revision trees**: every document keeps its full edit history; the
//!   current revision is the winning leaf under a deterministic rule
//! - **Change feed**: every committed revision gets a sequence number
//! - **Replicator**: pushes and pulls feed entries with durable checkpoints
//!
//! Each collection is an independent SQLite database.
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let expenses = DocumentStore::open(&config, "expenses")?;
//!
//! let rev = expenses.put("e1", body, None)?;
//! let doc = expenses.get("e1")?;
//! expenses.delete("e1", &doc.revision)?;
//! ```
//!
//! # Modules
//!
//! - `store`: per-collection storage API (main entry point)
//! - `revision`: revision trees and conflict resolution
//! - `models`: documents, revisions and feed entries
//! - `storage`: SQLite persistence and the change feed
//! - `sync`: replicator and transports
//! - `collections`: the set of collections of one data directory
//! - `identity`: stable peer ID of this replica
//! - `config`: application configuration

pub mod collections;
pub mod config;
pub mod identity;
pub mod models;
pub mod revision;
pub mod storage;
pub mod store;
pub mod sync;

pub use collections::Collections;
pub use config::Config;
pub use identity::Identity;
pub use models::{Ack, Body, ChangeBatch, ChangeEntry, ChangeRecord, Checkpoint, Direction, Document, Revision};
pub use revision::{ConflictResolver, DeterministicResolver, LiveFirstResolver, RevisionNode, RevisionTree};
pub use storage::{StoreError, StoreResult};
pub use store::{ApplyOutcome, DocumentStore};
pub use sync::{
    LocalTransport, Replicator, ReplicatorConfig, SyncEvent, SyncStatus, Transport, TransportError,
    WebSocketTransport,
};
