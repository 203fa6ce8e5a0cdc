//! Mirror daemon: owns the sync coordinator and serves the query surface
//! over a Unix domain socket.

mod connection;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use markmirror_config::AppConfig;
use markmirror_sync::{FileTreeProvider, SyncCoordinator, SyncHandle};

use crate::DaemonStatus;

struct DaemonState {
    config: AppConfig,
    provider: Arc<FileTreeProvider>,
    sync: SyncHandle,
    started_at: Instant,
}

impl DaemonState {
    fn status(&self) -> DaemonStatus {
        let store = self.sync.store().ok();
        DaemonStatus {
            pid: std::process::id(),
            provider: self.provider.path().display().to_string(),
            store_path: self.config.store.path.clone(),
            schema_version: store
                .as_ref()
                .and_then(|store| store.get_cursor().ok().flatten())
                .map(|cursor| cursor.schema_version),
            uptime_secs: self.started_at.elapsed().as_secs(),
            node_count: store.as_ref().and_then(|store| store.node_count().ok()),
            sync: self.sync.status(),
        }
    }
}

/// Run the daemon until a client sends `Shutdown`.
pub async fn run_daemon(config: AppConfig) -> Result<()> {
    let socket_path = PathBuf::from(&config.daemon.socket_path);
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }

    let store_path = PathBuf::from(&config.store.path);
    if let Some(parent) = store_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating store directory {}", parent.display()))?;
    }

    let provider = Arc::new(FileTreeProvider::new(&config.provider.tree_path));
    if !Path::new(&config.provider.tree_path).exists() {
        warn!(
            path = %config.provider.tree_path,
            "bookmark tree not found; the mirror stays empty until it appears"
        );
    }
    let (sync, coordinator) =
        SyncCoordinator::spawn(store_path, provider.clone(), config.sync.clone());

    let state = Arc::new(DaemonState {
        config,
        provider,
        sync,
        started_at: Instant::now(),
    });

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            state.sync.shutdown();
            let _ = coordinator.await;
            return Err(err)
                .with_context(|| format!("binding daemon socket {}", socket_path.display()));
        }
    };
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    info!(path = %socket_path.display(), "mirror daemon listening");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let (stream, _) = match accept {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(?err, "accepting daemon connection failed");
                        continue;
                    }
                };
                let state = state.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = connection::handle_connection(stream, state, shutdown_tx).await {
                        error!(?err, "daemon connection handler failed");
                    }
                });
            }
        }
    }

    info!("daemon shutting down gracefully");
    state.sync.shutdown();
    if let Err(err) = coordinator.await {
        error!(?err, "sync coordinator task ended abnormally");
    }
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
