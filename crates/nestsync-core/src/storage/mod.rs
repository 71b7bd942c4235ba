//! Storage layer
//!
//! Handles durable state for one collection.
//!
//! ## Architecture
//!
//! - **revisions**: every node of every document's revision tree
//! - **changes**: the append-only change feed
//! - **meta**: the sequence high-water mark
//! - **checkpoints**: replication progress per peer and direction
//!
//! All of it lives in one SQLite database per collection, so a revision and
//! its feed entry commit in a single transaction.

pub mod error;
pub mod feed;
pub mod persistence;
pub mod schema;

pub use error::{StoreError, StoreResult};
pub use feed::{ChangeFeed, Changes};
pub use persistence::SqlitePersistence;
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
