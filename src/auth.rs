use crate::models::TokenRefreshResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Bearer credentials for the remote store.
/// Tokens are issued by the identity provider and handed in by the host application.
pub struct AuthManager {
    auth_base_url: String,
    client: reqwest::Client,
    access_token: Arc<RwLock<Option<String>>>,
    refresh_token: Arc<RwLock<Option<String>>>,
}

impl AuthManager {
    pub fn new(auth_base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            auth_base_url,
            client,
            access_token: Arc::new(RwLock::new(None)),
            refresh_token: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        *self.access_token.write().await = access_token;
        *self.refresh_token.write().await = refresh_token;
    }

    pub async fn get_access_token(&self) -> Result<String, String> {
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| "Access token not set".to_string())
    }

    pub async fn get_refresh_token(&self) -> Option<String> {
        self.refresh_token.read().await.clone()
    }

    /// Exchange the refresh token for a new access token and store both.
    pub async fn refresh(&self) -> Result<String, String> {
        let refresh = self
            .get_refresh_token()
            .await
            .ok_or_else(|| "Token expired (401) but no refresh token available".to_string())?;

        let result = self.request_refresh(&refresh).await?;
        info!("[AUTH] Access token refreshed");
        let access = result.access_token.clone();
        // Keep the old refresh token when the provider does not rotate it
        let next_refresh = result.refresh_token.or(Some(refresh));
        self.set_tokens(Some(access.clone()), next_refresh).await;
        Ok(access)
    }

    async fn request_refresh(&self, refresh_token: &str) -> Result<TokenRefreshResult, String> {
        let url = format!("{}/auth/refresh", self.auth_base_url);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| format!("Network error during token refresh: {}", e))?;

        if !response.status().is_success() {
            return Err(format!(
                "Token refresh failed with status: {}",
                response.status()
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse refresh response: {}", e))?;

        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| "Missing access_token in refresh response".to_string())?
            .to_string();
        let refresh_token = json["refresh_token"].as_str().map(|s| s.to_string());

        Ok(TokenRefreshResult {
            access_token,
            refresh_token,
        })
    }
}
