//! Daemon command: run the reminder service until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use miette::Result;
use nudge::{Service, ServiceConfig, system_clock};
use nudge_todo::{GraphClient, GraphConfig, TokenStore};
use tokio::sync::watch;
use tracing::info;

/// Account tokens file inside the data directory.
const ACCOUNTS_FILE: &str = "accounts.json";

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub graph_url: String,
    pub auth_url: String,
    pub client_id: String,
    pub refresh_minutes: Option<u32>,
}

/// Data directory used when none is given.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("nudge")
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    // The only startup failure that stops the daemon.
    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
        miette::miette!(
            "failed to create data directory {}: {}",
            config.data_dir.display(),
            e
        )
    })?;

    let tokens = TokenStore::load(config.data_dir.join(ACCOUNTS_FILE));
    let graph = GraphClient::new(
        GraphConfig {
            graph_url: config.graph_url,
            auth_url: config.auth_url,
            client_id: config.client_id,
        },
        tokens,
    );

    let mut service_config = ServiceConfig::new(&config.data_dir);
    if let Some(minutes) = config.refresh_minutes {
        service_config = service_config.with_refresh_minutes(minutes);
    }
    let (service, handle) = Service::new(&service_config, Arc::new(graph), Local, system_clock());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(data_dir = %config.data_dir.display(), "starting nudge daemon");
    let task = service.spawn(shutdown_rx);
    // Held so the loop keeps running until a signal arrives.
    let _handle = handle;
    task.await
        .map_err(|e| miette::miette!("service task failed: {}", e))?;

    info!("nudge daemon stopped");
    Ok(())
}
