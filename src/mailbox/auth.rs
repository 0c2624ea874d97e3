//! OAuth token refresh for the mail-API backend.
//!
//! Access tokens are refreshed when they are within a fixed margin of expiry
//! and the rotated pair is persisted, so a restart never loses credentials.
//! Refreshes for one tenant are serialized; a caller that lost the race
//! re-reads the mailbox row and finds the token already fresh.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::mailbox::api::transport_error;
use crate::store::{MailboxRecord, TicketStore};

/// OAuth client configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct RefresherConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

impl RefresherConfig {
    /// Build config from environment variables.
    /// Returns `None` if `MAILDESK_OAUTH_TOKEN_URL` is not set (API backend disabled).
    pub fn from_env() -> Option<Self> {
        let token_url = std::env::var("MAILDESK_OAUTH_TOKEN_URL").ok()?;
        let client_id = std::env::var("MAILDESK_OAUTH_CLIENT_ID").unwrap_or_default();
        let client_secret = SecretString::from(
            std::env::var("MAILDESK_OAUTH_CLIENT_SECRET").unwrap_or_default(),
        );
        Some(Self {
            token_url,
            client_id,
            client_secret,
        })
    }
}

/// Response from the token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    /// The provider may or may not rotate the refresh token.
    #[serde(default)]
    refresh_token: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    token_type: Option<String>,
}

/// Keeps per-tenant OAuth credentials fresh, backed by the mailbox store.
pub struct TokenRefresher {
    config: RefresherConfig,
    store: Arc<dyn TicketStore>,
    http: reqwest::Client,
    margin: chrono::Duration,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl TokenRefresher {
    pub fn new(
        config: RefresherConfig,
        store: Arc<dyn TicketStore>,
        http: reqwest::Client,
        margin: Duration,
    ) -> Self {
        let margin = chrono::Duration::from_std(margin)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));
        Self {
            config,
            store,
            http,
            margin,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Return a valid access token for the tenant, refreshing if it expires
    /// within the configured margin.
    pub async fn ensure_fresh(&self, tenant_id: Uuid) -> Result<SecretString, MailboxError> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let mailbox = self.load_mailbox(tenant_id).await?;
        if let (Some(token), Some(expires_at)) = (&mailbox.access_token, mailbox.token_expires_at)
            && expires_at - Utc::now() > self.margin
        {
            return Ok(token.clone());
        }

        self.refresh(tenant_id, &mailbox).await
    }

    /// Refresh unconditionally — used after the provider rejected a token
    /// that looked fresh on our side.
    pub async fn refresh_now(&self, tenant_id: Uuid) -> Result<SecretString, MailboxError> {
        let lock = self.tenant_lock(tenant_id).await;
        let _guard = lock.lock().await;

        let mailbox = self.load_mailbox(tenant_id).await?;
        self.refresh(tenant_id, &mailbox).await
    }

    async fn load_mailbox(&self, tenant_id: Uuid) -> Result<MailboxRecord, MailboxError> {
        self.store
            .get_mailbox(tenant_id)
            .await
            .map_err(|e| MailboxError::AuthFailed {
                reason: format!("mailbox lookup failed: {e}"),
            })?
            .ok_or(MailboxError::NotConnected)
    }

    async fn refresh(
        &self,
        tenant_id: Uuid,
        mailbox: &MailboxRecord,
    ) -> Result<SecretString, MailboxError> {
        let refresh_token = mailbox
            .refresh_token
            .as_ref()
            .ok_or_else(|| MailboxError::AuthFailed {
                reason: "no refresh token on file".into(),
            })?;

        debug!(tenant = %tenant_id, "Refreshing mailbox access token");

        let response = self
            .http
            .post(&self.config.token_url)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.expose_secret()),
                ("refresh_token", refresh_token.expose_secret()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| transport_error(&self.config.token_url, &e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(tenant = %tenant_id, "Token refresh failed: {status} - {body}");
            return Err(MailboxError::AuthFailed {
                reason: format!("token endpoint returned {status}"),
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| MailboxError::Protocol(format!("token response parse: {e}")))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in);
        let access = SecretString::from(token.access_token);
        let rotated = token.refresh_token.map(SecretString::from);

        self.store
            .update_mailbox_tokens(tenant_id, &access, rotated.as_ref(), expires_at)
            .await
            .map_err(|e| MailboxError::AuthFailed {
                reason: format!("token persist failed: {e}"),
            })?;

        debug!(tenant = %tenant_id, "Mailbox access token refreshed");
        Ok(access)
    }

    async fn tenant_lock(&self, tenant_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(tenant_id).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_returns_none_when_no_token_url() {
        // SAFETY: This test runs in isolation; no other thread reads
        // MAILDESK_OAUTH_TOKEN_URL concurrently.
        unsafe { std::env::remove_var("MAILDESK_OAUTH_TOKEN_URL") };
        assert!(RefresherConfig::from_env().is_none());
    }

    #[test]
    fn token_response_with_rotation() {
        let json = r#"{
            "access_token": "at-new",
            "expires_in": 3600,
            "refresh_token": "rt-new",
            "token_type": "Bearer"
        }"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.access_token, "at-new");
        assert_eq!(token.expires_in, 3600);
        assert_eq!(token.refresh_token.as_deref(), Some("rt-new"));
    }

    #[test]
    fn token_response_without_rotation() {
        let json = r#"{"access_token": "at-new", "expires_in": 900}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.refresh_token.is_none());
        assert!(token.token_type.is_none());
    }
}
