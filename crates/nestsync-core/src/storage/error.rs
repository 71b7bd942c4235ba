//! Store error handling
//!
//! Provides typed errors for document, revision and replication operations
//! with descriptive messages and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::sync::TransportError;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    /// Unknown document id (or the document's winning revision is a tombstone)
    #[error("Document '{id}' not found")]
    NotFound { id: String },

    /// Optimistic-concurrency mismatch on put/delete
    #[error("Conflict on document '{id}': expected revision {expected}, current is {actual}")]
    Conflict {
        id: String,
        expected: String,
        actual: String,
    },

    /// Network or peer error during replication
    #[error("Transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// Revision tree invariant violated on load
    #[error("Document '{id}' is corrupt: {details}. Writes to it are refused until it is repaired.")]
    Corrupt { id: String, details: String },

    /// A remote revision references a parent this store has never seen
    #[error("Revision {revision} of '{id}' references unknown parent {parent}")]
    MissingAncestor {
        id: String,
        revision: String,
        parent: String,
    },

    /// Malformed revision string or a revision whose hash does not match its content
    #[error("Invalid revision '{revision}': {details}")]
    InvalidRevision { revision: String, details: String },

    /// Document ids must be non-empty
    #[error("Invalid document id: {0:?}")]
    InvalidId(String),

    /// Failed to create data directory
    #[error("Failed to create data directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Body (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if the caller can recover by retrying or re-reading
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound { .. }
                | StoreError::Conflict { .. }
                | StoreError::TransportFailure(_)
                | StoreError::MissingAncestor { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StoreError::Conflict { .. } => {
                Some("Re-read the document to get its current revision and retry the write.")
            }
            StoreError::TransportFailure(_) => {
                Some("The local store is unaffected. Sync again later; it resumes from the last checkpoint.")
            }
            StoreError::Corrupt { .. } => {
                Some("Inspect the document's revisions in the collection database and repair them manually.")
            }
            StoreError::MissingAncestor { .. } => {
                Some("Resync from scratch so the peer resends the full history.")
            }
            StoreError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            _ => None,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_conflict_is_recoverable() {
        let err = StoreError::Conflict {
            id: "e1".to_string(),
            expected: "1-aa".to_string(),
            actual: "2-bb".to_string(),
        };

        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
        let msg = err.to_string();
        assert!(msg.contains("e1"));
        assert!(msg.contains("1-aa"));
        assert!(msg.contains("2-bb"));
    }

    #[test]
    fn test_corrupt_is_not_recoverable() {
        let err = StoreError::Corrupt {
            id: "t7".to_string(),
            details: "orphan revision".to_string(),
        };

        assert!(!err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn test_transport_failure_wraps_transport_error() {
        let err: StoreError = TransportError::Timeout(Duration::from_secs(1)).into();

        assert!(matches!(err, StoreError::TransportFailure(_)));
        assert!(err.is_recoverable());
        assert!(err.to_string().starts_with("Transport failure"));
    }

    #[test]
    fn test_database_error_display() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(err.to_string().contains("Database error"));
        assert!(err.recovery_suggestion().is_none());
    }
}
