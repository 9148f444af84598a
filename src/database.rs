use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::crypto::PayloadEncryption;
use crate::error::StoreError;
use crate::models::{FailedRecordInfo, QueueStats, QueuedRecord, RecordType};
use chrono::Utc;

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            _ => {}
        }
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi_err, _)
            if ffi_err.code == rusqlite::ffi::ErrorCode::ConstraintViolation
    )
}

/// Options for opening the local store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Hex-encoded 32-byte AES key for payloads at rest.
    pub encryption_key: Option<String>,
    /// Max number of unsynced records (pending + dead-lettered) before `save` refuses.
    pub queue_limit: i64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            queue_limit: 10_000,
        }
    }
}

/// Raw row before payload decryption (lock is released before decrypting).
struct RawRow {
    id: String,
    record_type: String,
    payload: String,
    created_at: i64,
    synced: bool,
    attempts: u32,
    last_error: Option<String>,
    failed: bool,
    synced_at: Option<i64>,
}

const RECORD_COLUMNS: &str =
    "id, record_type, payload, created_at, synced, attempts, last_error, failed, synced_at";

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        record_type: row.get(1)?,
        payload: row.get(2)?,
        created_at: row.get(3)?,
        synced: row.get(4)?,
        attempts: row.get(5)?,
        last_error: row.get(6)?,
        failed: row.get(7)?,
        synced_at: row.get(8)?,
    })
}

/// Local durable store for queued records (SQLite).
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
    encryption: PayloadEncryption,
    /// Per-instance sequence for record ids; keeps same-millisecond saves distinct.
    seq: AtomicU64,
    queue_limit: i64,
}

impl Database {
    /// Poisoned mutex (panic while holding the lock) is surfaced as an error.
    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::LockPoisoned(e.to_string()))
    }

    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        Self::with_options(db_path, &StoreOptions::default())
    }

    pub fn with_options(db_path: &str, options: &StoreOptions) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path).map_err(|e| {
            log_io_error_if_any("open", &e);
            StoreError::from_write("open", e)
        })?;

        // GUARD: detect corruption before touching the schema
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| StoreError::Corrupt(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(StoreError::Corrupt(integrity));
        }

        // WAL survives crashes mid-write without torn records
        if let Err(e) =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get::<_, String>(0))
        {
            warn!(
                "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                e
            );
        }
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");

        let encryption = PayloadEncryption::new(options.encryption_key.as_deref())
            .map_err(StoreError::Encryption)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            encryption,
            seq: AtomicU64::new(0),
            queue_limit: options.queue_limit,
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 2;

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS queued_records (
                id TEXT PRIMARY KEY,
                record_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                synced_at INTEGER,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                last_error TEXT,
                failed INTEGER NOT NULL DEFAULT 0
            )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS app_meta (key TEXT PRIMARY KEY, value TEXT)",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_queued_records_synced ON queued_records(synced, failed)",
                [],
            )?;
        }

        // Migration 2: dead-letter bookkeeping (idempotent ALTER, columns may already exist)
        if current < 2 {
            for stmt in [
                "ALTER TABLE queued_records ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0",
                "ALTER TABLE queued_records ADD COLUMN last_attempt_at INTEGER",
                "ALTER TABLE queued_records ADD COLUMN last_error TEXT",
                "ALTER TABLE queued_records ADD COLUMN failed INTEGER NOT NULL DEFAULT 0",
            ] {
                let _ = conn.execute(stmt, []);
            }
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Queue a record for remote persistence. Returns the generated id.
    /// Errors mean the action was NOT queued.
    pub fn save(
        &self,
        record_type: RecordType,
        payload: &serde_json::Value,
    ) -> Result<String, StoreError> {
        if !payload.is_object() {
            return Err(StoreError::Serialization(
                "payload must be a JSON object".to_string(),
            ));
        }
        let plaintext = serde_json::to_string(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let encrypted = self.encryption.encrypt(&plaintext).map_err(|e| {
            error!("[DB] Encryption failed for {} payload: {}", record_type, e);
            StoreError::Encryption(e)
        })?;
        let now = Utc::now().timestamp_millis();

        let conn = self.lock_conn()?;
        // BEGIN IMMEDIATE: limit check and insert see the same queue
        conn.execute("BEGIN IMMEDIATE TRANSACTION", []).map_err(|e| {
            log_io_error_if_any("save begin", &e);
            StoreError::from_write("save begin", e)
        })?;

        match self.insert_in_tx(&conn, record_type, &encrypted, now) {
            Ok(id) => {
                conn.execute("COMMIT", []).map_err(|e| {
                    log_io_error_if_any("save commit", &e);
                    error!("[DB] Failed to commit save: {}", e);
                    let _ = conn.execute("ROLLBACK", []);
                    StoreError::from_write("save commit", e)
                })?;
                debug!("[DB] Queued {}", id);
                Ok(id)
            }
            Err(e) => {
                error!("[DB] Failed to queue {} record: {}. Rolling back.", record_type, e);
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    fn insert_in_tx(
        &self,
        conn: &Connection,
        record_type: RecordType,
        encrypted_payload: &str,
        now: i64,
    ) -> Result<String, StoreError> {
        let queue_size: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queued_records WHERE synced = 0",
            [],
            |row| row.get(0),
        )?;
        if queue_size >= self.queue_limit {
            warn!(
                "[DB] Queue limit reached ({} records), refusing {} record",
                queue_size, record_type
            );
            return Err(StoreError::StorageUnavailable(format!(
                "queue limit reached ({} records)",
                queue_size
            )));
        }

        // PK rejects a clash (another instance on the same file); move to the next seq
        const MAX_ID_ATTEMPTS: usize = 3;
        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let id = format!("{}-{}-{}", record_type.as_str(), now, seq);
            match conn.execute(
                "INSERT INTO queued_records (id, record_type, payload, created_at, synced)
                 VALUES (?1, ?2, ?3, ?4, 0)",
                params![id, record_type.as_str(), encrypted_payload, now],
            ) {
                Ok(_) => return Ok(id),
                Err(e) if is_constraint_violation(&e) => {
                    warn!("[DB] Record id {} already taken, retrying", id);
                    last_err = Some(e);
                }
                Err(e) => {
                    log_io_error_if_any("save insert", &e);
                    return Err(StoreError::from_write("save insert", e));
                }
            }
        }
        Err(last_err
            .map(StoreError::Sqlite)
            .unwrap_or_else(|| StoreError::StorageUnavailable("id allocation failed".into())))
    }

    fn decode(&self, raw: RawRow) -> Result<QueuedRecord, String> {
        let record_type: RecordType = raw.record_type.parse()?;
        let plaintext = self.encryption.decrypt(&raw.payload)?;
        let payload: serde_json::Value =
            serde_json::from_str(&plaintext).map_err(|e| format!("Parse payload: {}", e))?;
        Ok(QueuedRecord {
            id: raw.id,
            record_type,
            payload,
            created_at: raw.created_at,
            synced: raw.synced,
            attempts: raw.attempts,
            last_error: raw.last_error,
            failed: raw.failed,
            synced_at: raw.synced_at,
        })
    }

    /// Every record still awaiting remote persistence (not dead-lettered).
    /// Order is not part of the contract.
    pub fn get_unsynced(&self) -> Result<Vec<QueuedRecord>, StoreError> {
        let raw_rows: Vec<RawRow> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM queued_records
                 WHERE synced = 0 AND failed = 0
                 ORDER BY created_at ASC, rowid ASC",
                RECORD_COLUMNS
            ))?;
            let rows = stmt.query_map([], raw_row)?;
            rows.collect::<Result<_, _>>()?
        };

        let mut result = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let id = raw.id.clone();
            match self.decode(raw) {
                Ok(record) => result.push(record),
                Err(e) => {
                    warn!(
                        "[DB] Skipping record {}: {}. One broken record won't block the queue.",
                        id, e
                    );
                }
            }
        }
        Ok(result)
    }

    pub fn get(&self, id: &str) -> Result<Option<QueuedRecord>, StoreError> {
        let raw = {
            let conn = self.lock_conn()?;
            conn.query_row(
                &format!("SELECT {} FROM queued_records WHERE id = ?1", RECORD_COLUMNS),
                params![id],
                raw_row,
            )
            .optional()?
        };
        match raw {
            Some(raw) => self.decode(raw).map(Some).map_err(StoreError::Encryption),
            None => Ok(None),
        }
    }

    /// Flip `synced` to true. Unknown or already-synced ids are a no-op (`Ok(false)`).
    pub fn mark_synced(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp_millis();
        let changed = conn
            .execute(
                "UPDATE queued_records SET synced = 1, synced_at = ?1 WHERE id = ?2 AND synced = 0",
                params![now, id],
            )
            .map_err(|e| {
                log_io_error_if_any("mark_synced", &e);
                StoreError::from_write("mark_synced", e)
            })?;
        if changed == 0 {
            debug!("[DB] mark_synced: {} not pending (cleared or already synced)", id);
        }
        Ok(changed > 0)
    }

    /// Record a failed remote write. With `max_attempts > 0` the record is
    /// dead-lettered once it reaches the ceiling. Returns whether it was dead-lettered.
    pub fn record_failure(
        &self,
        id: &str,
        error_message: &str,
        max_attempts: u32,
    ) -> Result<bool, StoreError> {
        let conn = self.lock_conn()?;
        let now = Utc::now().timestamp_millis();
        let changed = conn.execute(
            "UPDATE queued_records
             SET attempts = attempts + 1,
                 last_attempt_at = ?1,
                 last_error = ?2,
                 failed = CASE WHEN ?3 > 0 AND attempts + 1 >= ?3 THEN 1 ELSE failed END
             WHERE id = ?4 AND synced = 0",
            params![now, error_message, max_attempts, id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        let failed: bool = conn.query_row(
            "SELECT failed FROM queued_records WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(failed)
    }

    /// Remove every record, synced or not (logout / reset).
    pub fn clear(&self) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn.execute("DELETE FROM queued_records", [])?)
    }

    /// Delete synced records whose `synced_at` is older than `older_than_ms`.
    pub fn trim_synced(&self, older_than_ms: i64) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn.execute(
            "DELETE FROM queued_records WHERE synced = 1 AND synced_at < ?1",
            params![older_than_ms],
        )?)
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM queued_records WHERE synced = 0 AND failed = 0",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn failed_count(&self) -> Result<i64, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM queued_records WHERE synced = 0 AND failed = 1",
            [],
            |row| row.get(0),
        )?)
    }

    pub fn queue_stats(&self) -> Result<QueueStats, StoreError> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare(
            "SELECT record_type, COUNT(*) FROM queued_records
             WHERE synced = 0 AND failed = 0
             GROUP BY record_type",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut pending_by_type = HashMap::new();
        for row in rows {
            let (record_type, count) = row?;
            pending_by_type.insert(record_type, count);
        }

        let (pending_count, failed_count, synced_count) = conn.query_row(
            "SELECT
                COALESCE(SUM(CASE WHEN synced = 0 AND failed = 0 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN synced = 0 AND failed = 1 THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN synced = 1 THEN 1 ELSE 0 END), 0)
             FROM queued_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(QueueStats {
            pending_count,
            failed_count,
            synced_count,
            pending_by_type,
        })
    }

    /// Dead-lettered records, newest first.
    pub fn get_failed(&self, limit: i64) -> Result<Vec<FailedRecordInfo>, StoreError> {
        let raw_rows: Vec<(String, String, String, u32, i64, Option<i64>, Option<String>)> = {
            let conn = self.lock_conn()?;
            let mut stmt = conn.prepare(
                "SELECT id, record_type, payload, attempts, created_at, last_attempt_at, last_error
                 FROM queued_records
                 WHERE synced = 0 AND failed = 1
                 ORDER BY created_at DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?;
            rows.collect::<Result<_, _>>()?
        };

        Ok(raw_rows
            .into_iter()
            .map(
                |(id, record_type, payload, attempts, created_at, last_attempt_at, error_message)| {
                    let payload = self.encryption.decrypt(&payload).unwrap_or_else(|e| {
                        warn!("[DB] Failed record {} has unreadable payload: {}", id, e);
                        String::new()
                    });
                    FailedRecordInfo {
                        id,
                        record_type,
                        payload,
                        attempts,
                        created_at,
                        last_attempt_at,
                        error_message,
                    }
                },
            )
            .collect())
    }

    /// Re-arm dead-lettered records (oldest first) for automatic drains.
    pub fn retry_failed(&self, limit: i64) -> Result<usize, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn.execute(
            "UPDATE queued_records
             SET failed = 0, attempts = 0
             WHERE synced = 0 AND failed = 1
             AND id IN (
                 SELECT id FROM queued_records
                 WHERE synced = 0 AND failed = 1
                 ORDER BY created_at ASC
                 LIMIT ?1
             )",
            params![limit],
        )?)
    }

    pub fn get_app_meta(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.lock_conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM app_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_app_meta(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO app_meta (key, value) VALUES (?1, ?2) ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }
}
