//! Peer protocol message types
//!
//! Request/response frames exchanged over a WebSocket using CBOR encoding.
//! Document bodies travel as canonical JSON bytes so the receiver hashes
//! exactly what the sender hashed.

use serde::{Deserialize, Serialize};

use super::transport::TransportError;
use crate::models::{Ack, ChangeBatch, ChangeRecord, Revision};
use crate::revision::canonical_body;

/// Peer ID for identifying a replica
pub type PeerId = String;

/// A change record in wire form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireRecord {
    pub seq: u64,
    pub id: String,
    pub revision: Revision,
    pub parent: Option<Revision>,
    pub deleted: bool,
    /// Canonical JSON body; empty for tombstones
    #[serde(with = "serde_bytes")]
    pub body: Vec<u8>,
}

impl WireRecord {
    pub fn from_record(record: &ChangeRecord) -> Result<Self, TransportError> {
        let body = match &record.body {
            Some(body) => canonical_body(body)
                .map_err(|e| TransportError::Codec(e.to_string()))?
                .into_bytes(),
            None => Vec::new(),
        };

        Ok(Self {
            seq: record.seq,
            id: record.id.clone(),
            revision: record.revision.clone(),
            parent: record.parent.clone(),
            deleted: record.deleted,
            body,
        })
    }

    pub fn into_record(self) -> Result<ChangeRecord, TransportError> {
        let body = if self.deleted {
            None
        } else {
            Some(
                serde_json::from_slice(&self.body)
                    .map_err(|e| TransportError::Codec(format!("body of {}: {}", self.id, e)))?,
            )
        };

        Ok(ChangeRecord {
            seq: self.seq,
            id: self.id,
            revision: self.revision,
            parent: self.parent,
            deleted: self.deleted,
            body,
        })
    }
}

/// Convert a batch to wire records
pub fn encode_records(batch: &ChangeBatch) -> Result<Vec<WireRecord>, TransportError> {
    batch.records.iter().map(WireRecord::from_record).collect()
}

/// Convert wire records back into a batch
pub fn decode_records(records: Vec<WireRecord>, last_seq: u64) -> Result<ChangeBatch, TransportError> {
    Ok(ChangeBatch {
        records: records
            .into_iter()
            .map(WireRecord::into_record)
            .collect::<Result<_, _>>()?,
        last_seq,
    })
}

/// Messages sent by the replicating side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerRequest {
    /// Handshake: who we are and which collection we replicate
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        collection: String,
    },

    /// Apply these changes
    #[serde(rename = "push")]
    Push {
        records: Vec<WireRecord>,
        #[serde(rename = "lastSeq")]
        last_seq: u64,
    },

    /// Send feed entries after `since`
    #[serde(rename = "pull")]
    Pull { since: u64, limit: u64 },
}

/// Messages sent by the serving side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerResponse {
    /// Handshake accepted
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },

    /// A pushed batch was applied
    #[serde(rename = "ack")]
    Ack { applied: u64, duplicates: u64 },

    /// A page of the feed
    #[serde(rename = "changes")]
    Changes {
        records: Vec<WireRecord>,
        #[serde(rename = "lastSeq")]
        last_seq: u64,
    },

    /// The request failed
    #[serde(rename = "error")]
    Error { message: String },
}

impl PeerResponse {
    pub fn ack(ack: Ack) -> Self {
        PeerResponse::Ack {
            applied: ack.applied as u64,
            duplicates: ack.duplicates as u64,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        PeerResponse::Error {
            message: message.into(),
        }
    }
}

/// Encode a frame to CBOR bytes
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, TransportError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(message, &mut bytes)
        .map_err(|e| TransportError::Codec(e.to_string()))?;
    Ok(bytes)
}

/// Decode a frame from CBOR bytes
pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, TransportError> {
    ciborium::from_reader(bytes).map_err(|e| TransportError::Codec(e.to_string()))
}
