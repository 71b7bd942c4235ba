//! Status command handler

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;

use nestsync_core::{Checkpoint, Collections, Config, Direction, DocumentStore, Identity};

use crate::output::{Output, OutputFormat};

/// Replication status of one collection
#[derive(Debug, Serialize)]
pub struct CollectionStatus {
    pub name: String,
    pub documents: u64,
    pub last_seq: u64,
    pub quarantined: Vec<String>,
    pub checkpoints: Vec<Checkpoint>,
    /// Changes not yet pushed, per peer pushed to before
    pub pending: BTreeMap<String, u64>,
}

impl CollectionStatus {
    pub fn collect(store: &DocumentStore) -> Result<Self> {
        let checkpoints = store.checkpoints()?;
        let mut pending = BTreeMap::new();
        for cp in checkpoints.iter().filter(|cp| cp.direction == Direction::Push) {
            pending.insert(cp.peer_id.clone(), store.pending_changes(&cp.peer_id)?);
        }

        Ok(Self {
            name: store.name().to_string(),
            documents: store.document_count()?,
            last_seq: store.last_sequence()?,
            quarantined: store.quarantined(),
            checkpoints,
            pending,
        })
    }
}

/// Show status information
pub fn show(config: &Config, collections: &Collections, output: &Output) -> Result<()> {
    let identity = Identity::load_or_create(config)?;
    let statuses = collections
        .iter()
        .map(|(_, store)| CollectionStatus::collect(store))
        .collect::<Result<Vec<_>>>()?;

    match output.format {
        OutputFormat::Json => {
            output.print_json(&serde_json::json!({
                "peer_id": identity.peer_id(),
                "data_dir": config.data_dir,
                "sync_enabled": config.sync_enabled,
                "sync_url": config.sync_url,
                "collections": statuses,
            }));
        }
        OutputFormat::Quiet => {
            println!("{}", identity.peer_id());
        }
        OutputFormat::Human => {
            println!("nestsync Status");
            println!("===============");
            println!();
            println!("Replica: {}", identity.peer_id());
            println!("Data:    {}", config.data_dir.display());
            println!();
            println!("Sync:");
            println!(
                "  Status: {}",
                if config.sync_enabled {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if let Some(ref url) = config.sync_url {
                println!("  Server: {}", url);
            }

            for status in &statuses {
                println!();
                println!("{}:", status.name);
                println!("  Documents: {}", status.documents);
                println!("  Last seq:  {}", status.last_seq);
                if !status.quarantined.is_empty() {
                    println!("  Corrupt:   {}", status.quarantined.join(", "));
                }
                if status.checkpoints.is_empty() {
                    println!("  Never synced");
                }
                for cp in &status.checkpoints {
                    println!(
                        "  {} {} @ {} ({})",
                        cp.direction,
                        cp.peer_id,
                        cp.seq,
                        cp.updated_at.format("%Y-%m-%d %H:%M:%S")
                    );
                }
                for (peer, &pending) in &status.pending {
                    if pending > 0 {
                        println!("  {} change(s) not yet pushed to {}", pending, peer);
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_counts_unpushed_changes() {
        let store = DocumentStore::open_in_memory("tasks").unwrap();
        for id in ["t1", "t2", "t3"] {
            let body = json!({"done": false}).as_object().cloned().unwrap();
            store.put(id, body, None).unwrap();
        }
        store.save_checkpoint("laptop", Direction::Push, 1).unwrap();
        store.save_checkpoint("laptop", Direction::Pull, 8).unwrap();

        let status = CollectionStatus::collect(&store).unwrap();
        assert_eq!(status.documents, 3);
        assert_eq!(status.last_seq, 3);
        assert_eq!(status.checkpoints.len(), 2);
        assert_eq!(status.pending, BTreeMap::from([("laptop".to_string(), 2)]));
    }

    #[test]
    fn test_pending_leaves_out_changes_pulled_from_the_peer() {
        let laptop = DocumentStore::open_in_memory("tasks").unwrap();
        let body = json!({"done": true}).as_object().cloned().unwrap();
        laptop.put("t1", body.clone(), None).unwrap();

        let store = DocumentStore::open_in_memory("tasks").unwrap();
        store
            .import_changes_from(Some("laptop"), &laptop.export_changes(0, 10).unwrap().records)
            .unwrap();
        store.put("t2", body, None).unwrap();
        store.save_checkpoint("laptop", Direction::Push, 0).unwrap();

        let status = CollectionStatus::collect(&store).unwrap();
        assert_eq!(status.last_seq, 2);
        assert_eq!(status.pending, BTreeMap::from([("laptop".to_string(), 1)]));
    }

    #[test]
    fn test_never_synced_has_nothing_pending() {
        let store = DocumentStore::open_in_memory("notes").unwrap();
        let status = CollectionStatus::collect(&store).unwrap();
        assert!(status.checkpoints.is_empty());
        assert!(status.pending.is_empty());
    }
}
