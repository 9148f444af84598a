//! Read-only status view for presentation code: connectivity, pending count and
//! whether a drain is in flight. Never mutates the store or the engine.

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::database::Database;
use crate::network::Connectivity;
use crate::sync::{SyncEngine, SyncEvent};

#[derive(Debug, Clone)]
pub struct StatusConfig {
    /// How often the pending count is re-queried from the store.
    pub poll_interval: Duration,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending_count: i64,
    /// Dead-lettered records awaiting operator action.
    pub failed_count: i64,
    pub is_syncing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<i64>,
}

/// The states shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Offline,
    Syncing,
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn state(&self) -> SyncState {
        if !self.is_online {
            SyncState::Offline
        } else if self.is_syncing {
            SyncState::Syncing
        } else if self.pending_count > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct StatusObserver {
    db: Arc<Database>,
    connectivity: Connectivity,
    engine: SyncEngine,
    config: StatusConfig,
    tx: Arc<watch::Sender<SyncStatus>>,
    worker: Mutex<Option<Worker>>,
}

impl StatusObserver {
    pub fn new(
        db: Arc<Database>,
        connectivity: Connectivity,
        engine: SyncEngine,
        config: StatusConfig,
    ) -> Self {
        let initial = SyncStatus {
            is_online: connectivity.is_online(),
            is_syncing: engine.is_syncing(),
            last_sync_at: engine.last_sync_at(),
            ..Default::default()
        };
        let (tx, _rx) = watch::channel(initial);
        let observer = Self {
            db,
            connectivity,
            engine,
            config,
            tx: Arc::new(tx),
            worker: Mutex::new(None),
        };
        observer.refresh_counts();
        observer
    }

    pub fn current(&self) -> SyncStatus {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.tx.subscribe()
    }

    /// Re-query pending/failed counts from the store.
    pub fn refresh_counts(&self) {
        refresh_counts(&self.db, &self.tx);
    }

    pub fn start(&self) -> bool {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        // Subscribed before spawning so no cycle event can slip past
        let handle = tokio::spawn(run_loop(
            self.db.clone(),
            self.connectivity.subscribe(),
            self.engine.subscribe(),
            self.engine.clone(),
            self.config.poll_interval,
            self.tx.clone(),
            shutdown_rx,
        ));
        *slot = Some(Worker { shutdown, handle });
        true
    }

    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            let _ = worker.handle.await;
        }
    }
}

fn refresh_counts(db: &Database, tx: &watch::Sender<SyncStatus>) {
    let pending = db.pending_count();
    let failed = db.failed_count();
    let (pending, failed) = match (pending, failed) {
        (Ok(p), Ok(f)) => (p, f),
        (Err(e), _) | (_, Err(e)) => {
            warn!("[STATUS] Failed to refresh queue counts: {}", e);
            return;
        }
    };
    tx.send_if_modified(|status| {
        if status.pending_count == pending && status.failed_count == failed {
            return false;
        }
        status.pending_count = pending;
        status.failed_count = failed;
        true
    });
}

async fn run_loop(
    db: Arc<Database>,
    mut online_rx: watch::Receiver<bool>,
    mut events: broadcast::Receiver<SyncEvent>,
    engine: SyncEngine,
    poll_interval: Duration,
    tx: Arc<watch::Sender<SyncStatus>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => refresh_counts(&db, &tx),
            changed = online_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let online = *online_rx.borrow_and_update();
                tx.send_if_modified(|status| {
                    let changed = status.is_online != online;
                    status.is_online = online;
                    changed
                });
                refresh_counts(&db, &tx);
            }
            event = events.recv() => match event {
                Ok(SyncEvent::CycleStarted) => {
                    tx.send_modify(|status| status.is_syncing = true);
                }
                Ok(SyncEvent::CycleFinished(report)) => {
                    debug!("[STATUS] Cycle finished: {} synced, {} failed", report.synced, report.failed);
                    let last_sync_at = engine.last_sync_at();
                    tx.send_modify(|status| {
                        status.is_syncing = false;
                        status.last_sync_at = last_sync_at;
                    });
                    refresh_counts(&db, &tx);
                }
                Err(RecvError::Lagged(skipped)) => {
                    info!("[STATUS] Missed {} sync events, resynchronizing", skipped);
                    let syncing = engine.is_syncing();
                    tx.send_modify(|status| status.is_syncing = syncing);
                    refresh_counts(&db, &tx);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}
