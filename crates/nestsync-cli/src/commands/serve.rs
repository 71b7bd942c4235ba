//! Serve command handler

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use nestsync_core::sync::serve_peer;
use nestsync_core::{Collections, Config, Identity};

use crate::output::Output;

/// Default listen address for `nestsync serve`
pub const DEFAULT_BIND: &str = "127.0.0.1:3030";

/// Answer peers until Ctrl-C
pub async fn serve(config: &Config, collections: Collections, bind: &str, output: &Output) -> Result<()> {
    let identity = Identity::load_or_create(config)?;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    let addr = listener.local_addr()?;

    let names: Vec<&str> = collections.names().collect();
    output.message(&format!(
        "Serving {} as {} on ws://{}",
        names.join(", "),
        identity.peer_id(),
        addr
    ));

    let collections = Arc::new(collections);
    tokio::select! {
        result = serve_peer(listener, collections, identity.peer_id().to_string()) => {
            result.context("Peer server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            output.success("Stopped");
        }
    }

    Ok(())
}
