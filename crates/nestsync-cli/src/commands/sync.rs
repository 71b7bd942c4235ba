//! Sync command handler

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use nestsync_core::sync::SyncReport;
use nestsync_core::{
    Collections, Config, DocumentStore, Identity, LocalTransport, Replicator, ReplicatorConfig,
    Transport, WebSocketTransport,
};

use super::with_hint;
use crate::output::Output;

/// Where the other replica lives
pub enum Peer {
    /// Another data directory on this machine
    Directory(PathBuf),
    /// A `nestsync serve` instance
    Remote(String),
}

impl Peer {
    /// Pick the peer from `--peer-dir`, falling back to the configured server
    pub fn resolve(config: &Config, peer_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = peer_dir {
            return Ok(Peer::Directory(dir));
        }

        if !config.sync_enabled {
            bail!(
                "Sync is not enabled. Enable it with:\n  \
                 nestsync config set sync_enabled true\n  \
                 nestsync config set sync_url ws://your-server:3030\n\
                 or sync with another data directory using --peer-dir."
            );
        }

        let Some(ref sync_url) = config.sync_url else {
            bail!(
                "Sync URL not configured. Set it with:\n  \
                 nestsync config set sync_url ws://your-server:3030"
            );
        };

        Ok(Peer::Remote(sync_url.clone()))
    }
}

/// Sync one collection, or every configured collection, with a peer
pub async fn sync(
    config: &Config,
    collections: &Collections,
    only: Option<String>,
    peer_dir: Option<PathBuf>,
    resync: bool,
    output: &Output,
) -> Result<()> {
    let peer = Peer::resolve(config, peer_dir)?;
    let identity = Identity::load_or_create(config)?;

    let names: Vec<String> = match only {
        Some(name) => vec![name],
        None => collections.names().map(str::to_string).collect(),
    };

    for name in names {
        let store = collections.get(&name)?;
        let transport = connect(config, &peer, &name, identity.peer_id()).await?;
        let peer_id = transport.peer_id().to_string();

        output.message(&format!("Syncing {} with {}...", name, peer_id));
        let report = run(store, transport, config, resync).await?;
        output.print_sync_report(&name, &peer_id, &report);
    }

    Ok(())
}

/// Sync a collection with the configured server without printing progress
///
/// Used after writes; does nothing when sync is not configured.
pub async fn sync_quiet(config: &Config, store: Arc<DocumentStore>) -> Result<()> {
    if !config.sync_enabled {
        return Ok(());
    }
    let Some(ref sync_url) = config.sync_url else {
        return Ok(());
    };

    let identity = Identity::load_or_create(config)?;
    let transport = connect(
        config,
        &Peer::Remote(sync_url.clone()),
        store.name(),
        identity.peer_id(),
    )
    .await?;
    run(store, transport, config, false).await?;

    Ok(())
}

/// Open a transport to `collection` on the peer
async fn connect(
    config: &Config,
    peer: &Peer,
    collection: &str,
    local_peer_id: &str,
) -> Result<Arc<dyn Transport>> {
    match peer {
        Peer::Directory(dir) => {
            let peer_config = Config {
                data_dir: dir.clone(),
                ..config.clone()
            };
            let peer_identity = Identity::load_or_create(&peer_config)
                .with_context(|| format!("Failed to open peer directory {:?}", dir))?;
            if peer_identity.peer_id() == local_peer_id {
                bail!("{:?} is this replica's own data directory", dir);
            }
            let peer_store = DocumentStore::open(&peer_config, collection)?;
            Ok(Arc::new(
                LocalTransport::new(peer_identity.peer_id(), Arc::new(peer_store))
                    .with_client_id(local_peer_id),
            ))
        }
        Peer::Remote(url) => {
            let transport = WebSocketTransport::connect(
                url,
                collection,
                local_peer_id,
                config.transport_timeout(),
            )
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;
            Ok(Arc::new(transport))
        }
    }
}

/// Run one push/pull session; Ctrl-C stops it at the next batch boundary
async fn run(
    store: Arc<DocumentStore>,
    transport: Arc<dyn Transport>,
    config: &Config,
    resync: bool,
) -> Result<SyncReport> {
    let mut replicator = Replicator::new(store, transport, ReplicatorConfig::from(config));
    if resync {
        replicator.reset_checkpoints()?;
    }

    if let Some(mut events) = replicator.take_events() {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "Sync event");
            }
        });
    }

    let cancel = replicator.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = replicator.sync().await;
    interrupt.abort();

    result.map_err(with_hint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;
    use serde_json::json;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        Config {
            data_dir: dir.path().to_path_buf(),
            collections: vec!["expenses".to_string()],
            ..Config::default()
        }
    }

    fn body(value: serde_json::Value) -> nestsync_core::Body {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_resolve_requires_configured_server() {
        let config = Config::default();
        assert!(Peer::resolve(&config, None).is_err());

        let enabled = Config {
            sync_enabled: true,
            ..Config::default()
        };
        assert!(Peer::resolve(&enabled, None).is_err());

        let remote = Config {
            sync_enabled: true,
            sync_url: Some("ws://localhost:3030".to_string()),
            ..Config::default()
        };
        assert!(matches!(
            Peer::resolve(&remote, None).unwrap(),
            Peer::Remote(url) if url == "ws://localhost:3030"
        ));

        // An explicit directory wins over the config
        assert!(matches!(
            Peer::resolve(&config, Some(PathBuf::from("/tmp/peer"))).unwrap(),
            Peer::Directory(_)
        ));
    }

    #[tokio::test]
    async fn test_sync_two_data_directories() {
        let local_dir = TempDir::new().unwrap();
        let peer_dir = TempDir::new().unwrap();
        let local_config = config_in(&local_dir);
        let peer_config = config_in(&peer_dir);

        let local = Collections::open(&local_config).unwrap();
        local
            .get("expenses")
            .unwrap()
            .put("e1", body(json!({"amount": 4})), None)
            .unwrap();
        {
            let peer = Collections::open(&peer_config).unwrap();
            peer.get("expenses")
                .unwrap()
                .put("e2", body(json!({"amount": 9})), None)
                .unwrap();
        }

        let output = Output::new(OutputFormat::Quiet);
        sync(
            &local_config,
            &local,
            None,
            Some(peer_dir.path().to_path_buf()),
            false,
            &output,
        )
        .await
        .unwrap();

        let expenses = local.get("expenses").unwrap();
        assert_eq!(expenses.get("e2").unwrap().body["amount"], 9);

        let peer = Collections::open(&peer_config).unwrap();
        assert_eq!(peer.get("expenses").unwrap().get("e1").unwrap().body["amount"], 4);
    }

    #[tokio::test]
    async fn test_sync_refuses_own_directory() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        let collections = Collections::open(&config).unwrap();
        let output = Output::new(OutputFormat::Quiet);

        let result = sync(
            &config,
            &collections,
            None,
            Some(dir.path().to_path_buf()),
            false,
            &output,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_sync_quiet_without_server_is_noop() {
        let store = Arc::new(DocumentStore::open_in_memory("expenses").unwrap());
        sync_quiet(&Config::default(), store).await.unwrap();
    }
}
