use scopeguard::guard;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::database::Database;
use crate::error::StoreError;
use crate::models::{QueuedRecord, RecordType};
use crate::network::Connectivity;
use crate::remote::{document_for, RemoteStore};

/// app_meta key holding the last completed drain (ms since epoch)
pub const LAST_SYNC_AT_KEY: &str = "last_sync_at";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Fixed drain interval, independent of record age.
    pub interval: Duration,
    /// Failed attempts before a record is dead-lettered. 0 = retry forever.
    pub max_attempts: u32,
    /// Synced records older than this are trimmed after each cycle.
    pub retention: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_attempts: 10,
            retention: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another cycle is in flight; the request is dropped, not queued.
    AlreadyRunning,
    Offline,
    /// Remote store cannot accept writes yet (no credentials).
    NotReady,
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    /// Set when the cycle could not read the queue at all.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(SyncReport),
    Skipped(SkipReason),
}

/// Emitted at the true start and end of every drain cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    CycleStarted,
    CycleFinished(SyncReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Timer,
    Reconnect,
    Flush,
}

struct Worker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Drains the local queue into the remote store.
///
/// Owned by the composition root; `start()` arms the timer / reconnect / flush
/// loop and `stop()` disarms it. Single-flight: a drain requested while another
/// is running is dropped.
#[derive(Clone)]
pub struct SyncEngine {
    pub(crate) db: Arc<Database>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Connectivity,
    config: SyncConfig,
    is_syncing: Arc<AtomicBool>,
    events: broadcast::Sender<SyncEvent>,
    flush_requested: Arc<Notify>,
    worker: Arc<Mutex<Option<Worker>>>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Connectivity,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(32);
        Self {
            db,
            remote,
            connectivity,
            config,
            is_syncing: Arc::new(AtomicBool::new(false)),
            events,
            flush_requested: Arc::new(Notify::new()),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.is_syncing.load(Ordering::Acquire)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Queue an action; when online, nudge the background loop to drain soon.
    pub fn enqueue(
        &self,
        record_type: RecordType,
        payload: &serde_json::Value,
    ) -> Result<String, StoreError> {
        let id = self.db.save(record_type, payload)?;
        if self.connectivity.is_online() {
            self.request_flush();
        }
        Ok(id)
    }

    /// Ask the background loop for a drain without waiting for it.
    pub fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    /// Re-arm dead-lettered records and request a drain.
    pub fn retry_failed(&self, limit: i64) -> Result<usize, StoreError> {
        let count = self.db.retry_failed(limit)?;
        if count > 0 {
            info!("[SYNC] Re-armed {} dead-lettered records", count);
            self.request_flush();
        }
        Ok(count)
    }

    pub fn last_sync_at(&self) -> Option<i64> {
        self.db
            .get_app_meta(LAST_SYNC_AT_KEY)
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok())
    }

    /// Run one drain cycle now (explicit flush).
    /// Panic guard: is_syncing is always reset via scopeguard.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .is_syncing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            debug!("[SYNC] Another drain already in progress, skipping");
            return DrainOutcome::Skipped(SkipReason::AlreadyRunning);
        }

        let report = {
            let _guard = guard((), |_| {
                self.is_syncing.store(false, Ordering::Release);
            });

            // Connectivity is checked once, at cycle start
            if !self.connectivity.is_online() {
                debug!("[SYNC] Offline, skipping drain");
                return DrainOutcome::Skipped(SkipReason::Offline);
            }
            if !self.remote.ready().await {
                warn!("[SYNC] Skipping drain (remote store not ready)");
                return DrainOutcome::Skipped(SkipReason::NotReady);
            }

            let _ = self.events.send(SyncEvent::CycleStarted);
            self.run_drain_cycle().await
        };

        let _ = self.events.send(SyncEvent::CycleFinished(report.clone()));
        DrainOutcome::Completed(report)
    }

    /// One pass over every record unsynced at cycle start, each attempted once.
    async fn run_drain_cycle(&self) -> SyncReport {
        let mut report = SyncReport::default();

        let records = match self.db.get_unsynced() {
            Ok(records) => records,
            Err(e) => {
                error!("[SYNC] Failed to read queue: {}", e);
                report.error = Some(e.to_string());
                return report;
            }
        };

        if records.is_empty() {
            debug!("[SYNC] No pending records");
        } else {
            info!(
                "[SYNC] Starting drain: {} pending records{}",
                records.len(),
                format_by_type(count_by_type(&records))
            );
        }

        let mut by_type_synced: HashMap<RecordType, usize> = HashMap::new();
        let mut by_type_failed: HashMap<RecordType, usize> = HashMap::new();

        // Network I/O happens outside the store lock; each DB op locks briefly
        for record in records {
            report.attempted += 1;
            let collection = record.record_type.collection();
            let document = document_for(&record);

            match self.remote.write(collection, &record.id, document).await {
                Ok(()) => {
                    if self.mark_synced_with_retry(&record.id).await {
                        report.synced += 1;
                        *by_type_synced.entry(record.record_type).or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    *by_type_failed.entry(record.record_type).or_insert(0) += 1;
                    let error_msg = e.to_string();
                    match self
                        .db
                        .record_failure(&record.id, &error_msg, self.config.max_attempts)
                    {
                        Ok(true) => {
                            report.dead_lettered += 1;
                            warn!(
                                "[SYNC] Record {} dead-lettered after {} attempts: {}",
                                record.id,
                                record.attempts + 1,
                                error_msg
                            );
                        }
                        Ok(false) => {
                            info!(
                                "[SYNC] Record {} will retry next cycle (attempt {}): {}",
                                record.id,
                                record.attempts + 1,
                                error_msg
                            );
                        }
                        Err(db_err) => {
                            error!(
                                "[SYNC] Failed to record failure for {}: {} (remote error: {})",
                                record.id, db_err, error_msg
                            );
                        }
                    }
                }
            }
        }

        let now_ms = chrono::Utc::now().timestamp_millis();
        if let Err(e) = self.db.set_app_meta(LAST_SYNC_AT_KEY, &now_ms.to_string()) {
            warn!("[SYNC] Failed to update last_sync_at: {}", e);
        }

        if let Some(retention) = self.config.retention {
            let cutoff = now_ms - retention.as_millis() as i64;
            match self.db.trim_synced(cutoff) {
                Ok(0) => {}
                Ok(n) => info!("[SYNC] Trimmed {} synced records past retention", n),
                Err(e) => warn!("[SYNC] Retention trim failed: {}", e),
            }
        }

        if report.attempted > 0 {
            let mut log_parts = vec![format!("Synced: {}", report.synced)];
            if !by_type_synced.is_empty() {
                log_parts.push(format_by_type(by_type_synced));
            }
            if report.failed > 0 {
                log_parts.push(format!("Failed: {}", report.failed));
                log_parts.push(format_by_type(by_type_failed));
            }
            info!("[SYNC] Drain completed: {}", log_parts.join(", "));
        }

        report
    }

    /// The remote write succeeded, so the local mark must land too.
    /// Retries with 100/200/400ms backoff; on exhaustion the record stays pending
    /// and the next cycle re-sends it (upsert by id keeps that harmless).
    async fn mark_synced_with_retry(&self, id: &str) -> bool {
        const MAX_RETRIES: u32 = 3;
        let mut retries = 0;
        loop {
            match self.db.mark_synced(id) {
                Ok(true) => return true,
                Ok(false) => {
                    // Cleared concurrently; the remote write still happened
                    debug!("[SYNC] Record {} vanished before mark_synced", id);
                    return true;
                }
                Err(e) => {
                    retries += 1;
                    if retries >= MAX_RETRIES {
                        error!(
                            "[SYNC] CRITICAL: Failed to mark {} synced after {} retries: {}. It will be re-sent.",
                            id, MAX_RETRIES, e
                        );
                        return false;
                    }
                    let delay_ms = 100 * (1u64 << (retries - 1));
                    warn!(
                        "[SYNC] Failed to mark {} synced (attempt {}): {}. Retrying in {}ms...",
                        id, retries, e, delay_ms
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    /// Arm the background loop. Must be called inside a Tokio runtime.
    /// Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut slot = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("[SYNC] start() called twice, ignoring");
            return false;
        }
        let (shutdown, shutdown_rx) = oneshot::channel();
        let online_rx = self.connectivity.subscribe();
        let handle = tokio::spawn(self.clone().run_loop(online_rx, shutdown_rx));
        *slot = Some(Worker { shutdown, handle });
        info!(
            "[SYNC] Background sync started (interval {}s)",
            self.config.interval.as_secs()
        );
        true
    }

    /// Disarm the loop. An in-flight cycle is allowed to finish; this waits for it.
    pub async fn stop(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            let _ = worker.shutdown.send(());
            if let Err(e) = worker.handle.await {
                error!("[SYNC] Background sync task ended abnormally: {}", e);
            }
            info!("[SYNC] Background sync stopped");
        }
    }

    async fn run_loop(
        self,
        mut online_rx: watch::Receiver<bool>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut was_online = *online_rx.borrow_and_update();

        loop {
            let trigger = tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => Trigger::Timer,
                _ = self.flush_requested.notified() => Trigger::Flush,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        warn!("[SYNC] Connectivity signal closed, stopping loop");
                        break;
                    }
                    let now_online = *online_rx.borrow_and_update();
                    let reconnected = now_online && !was_online;
                    was_online = now_online;
                    if !reconnected {
                        continue;
                    }
                    Trigger::Reconnect
                }
            };

            debug!("[SYNC] Drain triggered by {:?}", trigger);
            match self.drain().await {
                DrainOutcome::Completed(report) => {
                    if report.synced > 0 {
                        info!("[SYNC] {:?} drain: synced {} records", trigger, report.synced);
                    }
                }
                DrainOutcome::Skipped(reason) => {
                    debug!("[SYNC] {:?} drain skipped: {:?}", trigger, reason);
                }
            }
        }
    }
}

fn count_by_type(records: &[QueuedRecord]) -> HashMap<RecordType, usize> {
    let mut counts = HashMap::new();
    for record in records {
        *counts.entry(record.record_type).or_insert(0) += 1;
    }
    counts
}

fn format_by_type(counts: HashMap<RecordType, usize>) -> String {
    if counts.is_empty() {
        return String::new();
    }
    let mut parts: Vec<String> = counts
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v))
        .collect();
    parts.sort();
    format!(" ({})", parts.join(", "))
}
