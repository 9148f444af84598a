use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod auth;
pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod models;
pub mod network;
pub mod remote;
pub mod status;
pub mod sync;

pub use crate::config::AppConfig;
pub use crate::database::{Database, StoreOptions};
pub use crate::error::{AppError, ConfigError, RemoteError, StoreError};
pub use crate::models::{QueuedRecord, RecordType};
pub use crate::network::{check_online_status, Connectivity};
pub use crate::remote::{HttpRemoteStore, RemoteStore};
pub use crate::status::{StatusObserver, SyncState, SyncStatus};
pub use crate::sync::{DrainOutcome, SkipReason, SyncConfig, SyncEngine, SyncEvent, SyncReport};


/// Логирование: по умолчанию info (если RUST_LOG не задан), чтобы [SYNC]/[DB] были видны
pub fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // try_init: a host application may have installed its own subscriber already
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Open the store; a corrupted file is moved aside and a fresh one created.
pub fn open_database(db_path: &Path, options: &StoreOptions) -> Result<Database, AppError> {
    if let Some(dir) = db_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| {
            std::io::Error::new(
                e.kind(),
                format!("Failed to create data directory {}: {}", dir.display(), e),
            )
        })?;
    }

    let path_str = db_path.to_str().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Database path contains invalid UTF-8: {}", db_path.display()),
        )
    })?;

    match Database::with_options(path_str, options) {
        Ok(db) => Ok(db),
        Err(StoreError::Corrupt(reason)) if db_path.exists() => {
            let backup_path = db_path.with_extension(format!(
                "corrupted.{}",
                chrono::Utc::now().timestamp()
            ));
            std::fs::rename(db_path, &backup_path)?;
            warn!(
                "[DB] Corrupted store ({}) backed up to {:?}, starting fresh",
                reason, backup_path
            );
            Ok(Database::with_options(path_str, options)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// Composition root: owns the store, the engine, the observer and the probe,
/// and their start/stop lifecycle.
pub struct App {
    pub db: Arc<Database>,
    pub connectivity: Connectivity,
    pub engine: SyncEngine,
    pub status: StatusObserver,
    config: AppConfig,
    probe: Option<JoinHandle<()>>,
}

impl App {
    /// Wire the default HTTP remote store from config.
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        let auth = Arc::new(auth::AuthManager::new(config.auth_base_url.clone()));
        auth.set_tokens(config.access_token.clone(), config.refresh_token.clone())
            .await;
        let remote: Arc<dyn RemoteStore> =
            Arc::new(HttpRemoteStore::new(config.remote_config(), auth));
        Self::with_remote(config, remote)
    }

    pub fn with_remote(config: AppConfig, remote: Arc<dyn RemoteStore>) -> Result<Self, AppError> {
        let db = Arc::new(open_database(&config.db_path, &config.store_options())?);
        // Offline until the first probe says otherwise
        let connectivity = Connectivity::new(false);
        let engine = SyncEngine::new(
            db.clone(),
            remote,
            connectivity.clone(),
            config.sync_config(),
        );
        let status = StatusObserver::new(
            db.clone(),
            connectivity.clone(),
            engine.clone(),
            config.status_config(),
        );
        Ok(Self {
            db,
            connectivity,
            engine,
            status,
            config,
            probe: None,
        })
    }

    pub fn start(&mut self) {
        if self.probe.is_none() && !self.config.probe_urls.is_empty() {
            self.probe = Some(
                self.connectivity
                    .spawn_probe(self.config.probe_urls.clone(), self.config.probe_interval),
            );
        }
        self.engine.start();
        self.status.start();
    }

    /// Stops timers and probes; an in-flight drain finishes first.
    pub async fn stop(&mut self) {
        if let Some(probe) = self.probe.take() {
            probe.abort();
        }
        self.status.stop().await;
        self.engine.stop().await;
    }
}

/// Headless service entry point: run until Ctrl-C, logging status changes.
pub async fn run() -> Result<(), AppError> {
    init_logging();

    let config = AppConfig::from_env()?;
    info!(
        "[APP] fieldsync {} starting (db: {})",
        config.app_version,
        config.db_path.display()
    );
    let mut app = App::build(config).await?;
    app.start();

    let mut status_rx = app.status.subscribe();
    loop {
        tokio::select! {
            changed = status_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status_rx.borrow_and_update().clone();
                info!(
                    "[STATUS] {:?}: online={} pending={} failed={} syncing={}",
                    status.state(),
                    status.is_online,
                    status.pending_count,
                    status.failed_count,
                    status.is_syncing
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("[APP] Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
        }
    }

    info!("[APP] Shutting down");
    app.stop().await;
    Ok(())
}
