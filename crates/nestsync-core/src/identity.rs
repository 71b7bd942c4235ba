//! Replica identity
//!
//! Every data directory is one replica with a stable peer ID. The ID is
//! generated on first use and stored in `<data_dir>/peer_id`; it is what
//! this replica announces in the peer handshake and what a server reports
//! back as its own ID.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

use crate::config::Config;

/// File holding the peer ID inside the data directory
const PEER_ID_FILE: &str = "peer_id";

/// Stable identity of one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    peer_id: String,
    /// Whether the ID was generated by this call
    is_new: bool,
}

impl Identity {
    /// Load the replica's peer ID, generating it on first run
    pub fn load_or_create(config: &Config) -> Result<Self> {
        let path = Self::path(config);

        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read peer ID: {:?}", path))?;
            let peer_id = content.trim();
            if peer_id.is_empty() {
                anyhow::bail!("Peer ID file {:?} is empty. Delete it to generate a new one.", path);
            }
            return Ok(Self {
                peer_id: peer_id.to_string(),
                is_new: false,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {:?}", parent))?;
        }

        let peer_id = format!("nestsync-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        fs::write(&path, format!("{}\n", peer_id))
            .with_context(|| format!("Failed to write peer ID: {:?}", path))?;

        Ok(Self {
            peer_id,
            is_new: true,
        })
    }

    /// Path of the peer ID file
    pub fn path(config: &Config) -> PathBuf {
        config.data_dir.join(PEER_ID_FILE)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }
}
