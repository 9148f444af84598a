use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::database::StoreOptions;
use crate::error::ConfigError;
use crate::network::DEFAULT_PROBE_URLS;
use crate::remote::HttpRemoteConfig;
use crate::status::StatusConfig;
use crate::sync::SyncConfig;

/// Service configuration. Every field can be overridden by a `FIELDSYNC_*` variable.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub api_base_url: String,
    pub auth_base_url: String,
    pub http_timeout_secs: u64,
    pub sync_interval: Duration,
    pub status_poll_interval: Duration,
    pub probe_interval: Duration,
    pub probe_urls: Vec<String>,
    /// 0 disables dead-lettering (retry forever)
    pub max_attempts: u32,
    pub queue_limit: i64,
    pub retention: Option<Duration>,
    pub encryption_key: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub app_version: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("fieldsync.db"),
            api_base_url: "http://127.0.0.1:8080/api".to_string(),
            auth_base_url: "http://127.0.0.1:8080/api".to_string(),
            http_timeout_secs: 30,
            sync_interval: Duration::from_secs(30),
            status_poll_interval: Duration::from_secs(2),
            probe_interval: Duration::from_secs(15),
            probe_urls: DEFAULT_PROBE_URLS.iter().map(|s| s.to_string()).collect(),
            max_attempts: 10,
            queue_limit: 10_000,
            retention: None,
            encryption_key: None,
            access_token: None,
            refresh_token: None,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_env(name) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name: name.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn secs_env(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    let secs = parse_env(name, default.as_secs())?;
    if secs == 0 {
        return Err(ConfigError::Invalid {
            name: name.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let api_base_url = optional_env("FIELDSYNC_API_URL").unwrap_or(defaults.api_base_url);
        let auth_base_url = optional_env("FIELDSYNC_AUTH_URL").unwrap_or_else(|| api_base_url.clone());

        let retention = match optional_env("FIELDSYNC_RETENTION_HOURS") {
            Some(_) => {
                let hours: u64 = parse_env("FIELDSYNC_RETENTION_HOURS", 0)?;
                (hours > 0).then(|| Duration::from_secs(hours * 3600))
            }
            None => None,
        };

        let encryption_key = optional_env("FIELDSYNC_ENCRYPTION_KEY");
        if let Some(key) = &encryption_key {
            match hex::decode(key) {
                Ok(bytes) if bytes.len() == 32 => {}
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "FIELDSYNC_ENCRYPTION_KEY".to_string(),
                        message: "expected 64 hex characters".to_string(),
                    })
                }
            }
        }

        let probe_urls = match optional_env("FIELDSYNC_PROBE_URLS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => defaults.probe_urls,
        };

        Ok(Self {
            db_path: optional_env("FIELDSYNC_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            api_base_url,
            auth_base_url,
            http_timeout_secs: parse_env("FIELDSYNC_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs)?,
            sync_interval: secs_env("FIELDSYNC_SYNC_INTERVAL_SECS", defaults.sync_interval)?,
            status_poll_interval: secs_env(
                "FIELDSYNC_STATUS_POLL_SECS",
                defaults.status_poll_interval,
            )?,
            probe_interval: secs_env("FIELDSYNC_PROBE_INTERVAL_SECS", defaults.probe_interval)?,
            probe_urls,
            max_attempts: parse_env("FIELDSYNC_MAX_ATTEMPTS", defaults.max_attempts)?,
            queue_limit: parse_env("FIELDSYNC_QUEUE_LIMIT", defaults.queue_limit)?,
            retention,
            encryption_key,
            access_token: optional_env("FIELDSYNC_ACCESS_TOKEN"),
            refresh_token: optional_env("FIELDSYNC_REFRESH_TOKEN"),
            app_version: defaults.app_version,
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            encryption_key: self.encryption_key.clone(),
            queue_limit: self.queue_limit,
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: self.sync_interval,
            max_attempts: self.max_attempts,
            retention: self.retention,
        }
    }

    pub fn status_config(&self) -> StatusConfig {
        StatusConfig {
            poll_interval: self.status_poll_interval,
        }
    }

    pub fn remote_config(&self) -> HttpRemoteConfig {
        HttpRemoteConfig {
            base_url: self.api_base_url.clone(),
            http_timeout_secs: self.http_timeout_secs,
            app_version: self.app_version.clone(),
        }
    }
}
