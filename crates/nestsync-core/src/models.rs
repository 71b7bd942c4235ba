//! Data models for nestsync
//!
//! Defines the document, revision and change feed types shared by the
//! store, the revision tree and the replicator. Document bodies are opaque
//! JSON objects; expenses, tasks and notes define their own fields.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StoreError;

/// Opaque document body: field name to value
pub type Body = serde_json::Map<String, serde_json::Value>;

/// Identity of one edit in a document's revision tree
///
/// Ordered by generation, then by hash. Hashes are lowercase hex digests,
/// so string order is digest-byte order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    /// Distance from the root along the branch (root is 1)
    pub generation: u64,
    /// Content-derived identifier
    pub hash: String,
}

impl Revision {
    pub fn new(generation: u64, hash: impl Into<String>) -> Self {
        Self {
            generation,
            hash: hash.into(),
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.hash)
    }
}

impl FromStr for Revision {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |details: &str| StoreError::InvalidRevision {
            revision: s.to_string(),
            details: details.to_string(),
        };

        let (generation, hash) = s
            .split_once('-')
            .ok_or_else(|| invalid("expected <generation>-<hash>"))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| invalid("generation is not a number"))?;
        if generation == 0 {
            return Err(invalid("generation starts at 1"));
        }
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid("hash must be hex"));
        }

        Ok(Revision::new(generation, hash.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for Revision {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

/// A document as seen through one revision of its tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Immutable document id
    pub id: String,
    /// The revision this view was read from (the winner for `get`)
    pub revision: Revision,
    /// Tombstone flag
    pub deleted: bool,
    /// Document fields (empty for tombstones)
    pub body: Body,
}

/// One entry of the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Monotonic sequence number, never reused
    pub seq: u64,
    /// Document that changed
    pub id: String,
    /// Revision added by the mutation
    pub revision: Revision,
    /// Whether that revision is a tombstone
    pub deleted: bool,
    /// When the mutation was committed locally
    pub committed_at: DateTime<Utc>,
    /// Peer the revision was replicated from; `None` for local writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// A change as shipped between replicas: the feed entry plus everything
/// needed to graft the revision into the receiving tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Sequence in the sender's change feed
    pub seq: u64,
    pub id: String,
    pub revision: Revision,
    pub parent: Option<Revision>,
    pub deleted: bool,
    /// `None` for tombstones
    pub body: Option<Body>,
}

/// A page of a peer's change feed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// Feed position to resume from after this batch
    pub last_seq: u64,
}

/// One direction of replication with a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Local feed to the peer
    Push,
    /// Peer feed to the local store
    Pull,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable replication progress for one peer and direction
///
/// For `Push` the sequence is in the local feed, for `Pull` in the peer's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub peer_id: String,
    pub direction: Direction,
    pub seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// Acknowledgment of a pushed batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Records that were new to the receiver
    pub applied: usize,
    /// Records the receiver already had
    pub duplicates: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_display_and_parse() {
        let rev = Revision::new(3, "0af9");
        assert_eq!(rev.to_string(), "3-0af9");

        let parsed: Revision = "3-0af9".parse().unwrap();
        assert_eq!(parsed, rev);
    }

    #[test]
    fn test_revision_parse_normalizes_case() {
        let parsed: Revision = "2-ABCD".parse().unwrap();
        assert_eq!(parsed.hash, "abcd");
    }

    #[test]
    fn test_revision_parse_rejects_garbage() {
        assert!("nope".parse::<Revision>().is_err());
        assert!("x-abcd".parse::<Revision>().is_err());
        assert!("0-abcd".parse::<Revision>().is_err());
        assert!("1-".parse::<Revision>().is_err());
        assert!("1-xyz".parse::<Revision>().is_err());
    }

    #[test]
    fn test_revision_ordering() {
        let low = Revision::new(2, "ff");
        let high_gen = Revision::new(3, "00");
        let high_hash = Revision::new(2, "fff0");

        assert!(high_gen > low);
        assert!(high_hash > low);
        assert!(high_gen > high_hash);
    }

    #[test]
    fn test_revision_serializes_as_string() {
        let rev = Revision::new(1, "beef");
        let json = serde_json::to_string(&rev).unwrap();
        assert_eq!(json, "\"1-beef\"");

        let back: Revision = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rev);
        assert!(serde_json::from_str::<Revision>("\"broken\"").is_err());
    }
}
