//! Mail-API backend — JSON message listing with page tokens and bearer auth.
//!
//! Unlike IMAP, provider state is only advanced by an explicit
//! `mark_processed` call after the pipeline has handled a message, so a
//! crash mid-batch re-lists the message next cycle and the idempotency
//! ledger absorbs the replay.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::mailbox::MailboxSource;
use crate::mailbox::auth::TokenRefresher;
use crate::mailbox::message::{OutboundMessage, RawMessage, parse_address, strip_html};

/// Upper bound on listing pages consumed in one poll cycle; anything left
/// over is picked up next cycle.
const MAX_PAGES: usize = 10;

// ── Wire DTOs ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    messages: Vec<ApiMessage>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    from: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    html_body: Option<String>,
    #[serde(default)]
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    thread_id: Option<String>,
}

impl ApiMessage {
    fn into_raw(self) -> RawMessage {
        let (sender_email, sender_name) = parse_address(&self.from);
        let html_body = self.html_body;
        let body = match self.body {
            Some(b) if !b.trim().is_empty() => b,
            _ => html_body.as_deref().map(strip_html).unwrap_or_default(),
        };

        RawMessage {
            external_id: self.id,
            subject: self.subject.unwrap_or_else(|| "(no subject)".into()),
            sender_email,
            sender_name,
            body,
            html_body,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            thread_id: self.thread_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct SendBody<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    in_reply_to: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct StateBody<'a> {
    state: &'a str,
}

// ── Error mapping ───────────────────────────────────────────────────

pub(crate) fn transport_error(host: &str, e: &reqwest::Error) -> MailboxError {
    if e.is_timeout() {
        MailboxError::Timeout {
            host: host.to_string(),
        }
    } else if e.is_connect() {
        MailboxError::HostUnreachable {
            host: host.to_string(),
            reason: e.to_string(),
        }
    } else {
        MailboxError::Protocol(e.to_string())
    }
}

fn status_error(status: reqwest::StatusCode) -> MailboxError {
    match status.as_u16() {
        401 => MailboxError::AuthExpired,
        403 => MailboxError::AuthFailed {
            reason: "access forbidden".into(),
        },
        _ => MailboxError::Protocol(format!("mail API returned {status}")),
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// Mail-API mailbox backend.
pub struct ApiMailbox {
    tenant_id: Uuid,
    base_url: String,
    http: reqwest::Client,
    refresher: Arc<TokenRefresher>,
    connected: bool,
}

impl ApiMailbox {
    pub fn new(
        tenant_id: Uuid,
        base_url: impl Into<String>,
        http: reqwest::Client,
        refresher: Arc<TokenRefresher>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            tenant_id,
            base_url,
            http,
            refresher,
            connected: false,
        }
    }

    async fn list_page(
        &self,
        token: &SecretString,
        page_token: Option<&str>,
    ) -> Result<ListResponse, MailboxError> {
        let mut request = self
            .http
            .get(format!("{}/messages", self.base_url))
            .bearer_auth(token.expose_secret())
            .query(&[("unprocessed", "true")]);
        if let Some(page_token) = page_token {
            request = request.query(&[("page_token", page_token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }

        response
            .json()
            .await
            .map_err(|e| MailboxError::Parse(format!("list response: {e}")))
    }
}

#[async_trait]
impl MailboxSource for ApiMailbox {
    async fn connect(&mut self) -> Result<(), MailboxError> {
        // A successful refresh proves the stored credential is usable.
        self.refresher.ensure_fresh(self.tenant_id).await?;
        self.connected = true;
        info!(base_url = %self.base_url, "Mail API mailbox connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MailboxError> {
        self.connected = false;
        debug!(base_url = %self.base_url, "Mail API mailbox disconnected");
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        if !self.connected {
            return Err(MailboxError::NotConnected);
        }

        let mut token = self.refresher.ensure_fresh(self.tenant_id).await?;
        let mut messages = Vec::new();
        let mut page_token: Option<String> = None;
        let mut refreshed = false;

        for _ in 0..MAX_PAGES {
            let page = match self.list_page(&token, page_token.as_deref()).await {
                Ok(page) => page,
                // The provider can reject a token that still looked fresh on
                // our side (revocation, clock skew). One forced refresh, then
                // give up until the next cycle.
                Err(MailboxError::AuthExpired) if !refreshed => {
                    refreshed = true;
                    token = self.refresher.refresh_now(self.tenant_id).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            messages.extend(page.messages.into_iter().map(ApiMessage::into_raw));
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if !messages.is_empty() {
            debug!(count = messages.len(), "Listed unprocessed messages");
        }
        Ok(messages)
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MailboxError> {
        let token = self.refresher.ensure_fresh(self.tenant_id).await?;
        let body = SendBody {
            to: &message.to,
            subject: &message.subject,
            body: &message.body,
            in_reply_to: message.in_reply_to.as_deref(),
        };

        let response = self
            .http
            .post(format!("{}/messages/send", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        let status = response.status();
        if !status.is_success() {
            if status.as_u16() == 401 {
                return Err(MailboxError::AuthExpired);
            }
            return Err(MailboxError::SendFailed {
                reason: format!("mail API returned {status}"),
            });
        }

        info!("Email sent to {}", message.to);
        Ok(())
    }

    async fn mark_processed(&mut self, external_id: &str) -> Result<(), MailboxError> {
        let token = self.refresher.ensure_fresh(self.tenant_id).await?;
        let response = self
            .http
            .post(format!("{}/messages/{external_id}/state", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&StateBody { state: "processed" })
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;

        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_response_full() {
        let json = r#"{
            "messages": [{
                "id": "api-1",
                "subject": "Order broken",
                "from": "Jane Doe <jane@example.com>",
                "body": "My order arrived broken.",
                "received_at": "2026-03-02T10:00:00Z",
                "thread_id": "t-9"
            }],
            "next_page_token": "page-2"
        }"#;
        let parsed: ListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.messages.len(), 1);
        assert_eq!(parsed.next_page_token.as_deref(), Some("page-2"));

        let raw = parsed.messages.into_iter().next().unwrap().into_raw();
        assert_eq!(raw.external_id, "api-1");
        assert_eq!(raw.sender_email, "jane@example.com");
        assert_eq!(raw.sender_name.as_deref(), Some("Jane Doe"));
        assert_eq!(raw.thread_id.as_deref(), Some("t-9"));
        assert_eq!(raw.received_at.to_rfc3339(), "2026-03-02T10:00:00+00:00");
    }

    #[test]
    fn list_response_empty_defaults() {
        let parsed: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.messages.is_empty());
        assert!(parsed.next_page_token.is_none());
    }

    #[test]
    fn api_message_html_fallback() {
        let json = r#"{
            "id": "api-2",
            "from": "bob@example.com",
            "html_body": "<p>Hello <b>there</b></p>"
        }"#;
        let msg: ApiMessage = serde_json::from_str(json).unwrap();
        let raw = msg.into_raw();
        assert_eq!(raw.body, "Hello there");
        assert_eq!(raw.subject, "(no subject)");
        assert!(raw.html_body.is_some());
        assert!(raw.sender_name.is_none());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(reqwest::StatusCode::UNAUTHORIZED),
            MailboxError::AuthExpired
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::FORBIDDEN),
            MailboxError::AuthFailed { .. }
        ));
        assert!(matches!(
            status_error(reqwest::StatusCode::INTERNAL_SERVER_ERROR),
            MailboxError::Protocol(_)
        ));
    }

    #[test]
    fn send_body_omits_absent_reply_header() {
        let body = SendBody {
            to: "jane@example.com",
            subject: "Re: Order broken",
            body: "We are on it.",
            in_reply_to: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("in_reply_to"));

        let body = SendBody {
            in_reply_to: Some("m1@example.com"),
            ..body
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"in_reply_to\":\"m1@example.com\""));
    }
}
