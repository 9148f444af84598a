use thiserror::Error;

/// Errors raised by the local durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Write to the persistence medium failed (disk full, read-only, I/O, queue cap).
    /// Callers of `save` must treat the action as not queued.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("Database corruption detected: {0}")]
    Corrupt(String),
    #[error("Encryption: {0}")]
    Encryption(String),
    #[error("Serialization: {0}")]
    Serialization(String),
    #[error("Database mutex poisoned: {0}. Restart the application to recover.")]
    LockPoisoned(String),
    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl StoreError {
    /// Classify a rusqlite error: medium-level failures become `StorageUnavailable`.
    pub(crate) fn from_write(context: &str, e: rusqlite::Error) -> Self {
        use rusqlite::ffi::ErrorCode;
        if let rusqlite::Error::SqliteFailure(ffi_err, _) = &e {
            let reason = match ffi_err.code {
                ErrorCode::DiskFull => Some("disk full"),
                ErrorCode::ReadOnly | ErrorCode::CannotOpen => Some("permission denied or read-only"),
                ErrorCode::SystemIoFailure => Some("I/O error"),
                _ => None,
            };
            if let Some(reason) = reason {
                return StoreError::StorageUnavailable(format!("{}: {} ({})", context, reason, e));
            }
        }
        StoreError::Sqlite(e)
    }
}

/// Errors returned by a remote store write. Always recovered locally by the engine.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Network: {0}")]
    Network(String),
    #[error("Auth: {0}")]
    Auth(String),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    /// Schema/validation rejection reported by the remote store.
    #[error("Rejected: {0}")]
    Rejected(String),
}

/// Startup failures of the composition root.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("config: {0}")]
    Config(#[from] ConfigError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    Invalid { name: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_full_maps_to_storage_unavailable() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        let mapped = StoreError::from_write("save", e);
        assert!(matches!(mapped, StoreError::StorageUnavailable(ref m) if m.contains("disk full")));
    }

    #[test]
    fn constraint_violation_stays_sqlite() {
        let e = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(matches!(StoreError::from_write("save", e), StoreError::Sqlite(_)));
    }

    #[test]
    fn http_error_display() {
        let e = RemoteError::Http {
            status: 503,
            message: "Service Unavailable".into(),
        };
        assert_eq!(e.to_string(), "HTTP 503: Service Unavailable");
    }
}
