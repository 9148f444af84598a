use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::AuthManager;
use crate::error::RemoteError;
use crate::models::QueuedRecord;

/// Field carrying the server-assigned sync time on every written document.
pub const SYNCED_AT_FIELD: &str = "syncedAt";

/// Sentinel the document store replaces with its own clock on write.
pub fn server_timestamp() -> serde_json::Value {
    serde_json::json!({ ".sv": "timestamp" })
}

/// Document written for a queued record: its payload plus the server sync timestamp.
pub fn document_for(record: &QueuedRecord) -> serde_json::Value {
    let mut doc = match &record.payload {
        serde_json::Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    doc.insert(SYNCED_AT_FIELD.to_string(), server_timestamp());
    serde_json::Value::Object(doc)
}

/// Remote document store the queue drains into.
///
/// `write` must be an upsert keyed by `document_id`: the engine re-sends a record
/// whenever it cannot confirm the local mark, so the same id may arrive twice.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn write(
        &self,
        collection: &str,
        document_id: &str,
        document: serde_json::Value,
    ) -> Result<(), RemoteError>;

    /// Whether writes can be attempted at all (e.g. credentials present).
    /// A drain is skipped entirely while this is false.
    async fn ready(&self) -> bool {
        true
    }
}

#[derive(Clone)]
pub struct HttpRemoteConfig {
    pub base_url: String,
    pub http_timeout_secs: u64,
    /// Sent in X-App-Version for debugging version skew
    pub app_version: String,
}

/// REST document store: `PUT {base}/collections/{collection}/documents/{id}`.
pub struct HttpRemoteStore {
    base_url: String,
    client: reqwest::Client,
    auth: Arc<AuthManager>,
    app_version: String,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig, auth: Arc<AuthManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            auth,
            app_version: config.app_version,
        }
    }

    pub fn document_url(&self, collection: &str, document_id: &str) -> String {
        format!(
            "{}/collections/{}/documents/{}",
            self.base_url, collection, document_id
        )
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn write(
        &self,
        collection: &str,
        document_id: &str,
        document: serde_json::Value,
    ) -> Result<(), RemoteError> {
        let url = self.document_url(collection, document_id);
        let mut access_token = self
            .auth
            .get_access_token()
            .await
            .map_err(RemoteError::Auth)?;
        let mut retry_with_refresh = true;

        loop {
            let response = self
                .client
                .put(&url)
                .header("Authorization", format!("Bearer {}", access_token))
                .header("X-App-Version", &self.app_version)
                .json(&document)
                .send()
                .await
                .map_err(|e| RemoteError::Network(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                debug!("[SYNC] {} written to {}", document_id, collection);
                return Ok(());
            }

            if status.as_u16() == 401 && retry_with_refresh {
                info!(
                    "[SYNC] Token expired (401), refreshing token for {}",
                    document_id
                );
                access_token = self.auth.refresh().await.map_err(|e| {
                    warn!("[SYNC] Failed to refresh token for {}: {}", document_id, e);
                    RemoteError::Auth(e)
                })?;
                // Only one refresh attempt per write
                retry_with_refresh = false;
                continue;
            }

            let status_code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").to_string()
            } else {
                body
            };
            return Err(match status_code {
                401 | 403 => RemoteError::Auth(message),
                400 | 422 => RemoteError::Rejected(message),
                _ => RemoteError::Http {
                    status: status_code,
                    message,
                },
            });
        }
    }

    async fn ready(&self) -> bool {
        self.auth.get_access_token().await.is_ok()
    }
}
