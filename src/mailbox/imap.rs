//! IMAP backend — raw IMAP over TLS for inbound, SMTP via lettre for outbound.
//!
//! Each poll cycle opens a fresh session: connect, LOGIN, SEARCH UNSEEN,
//! FETCH, STORE `\Seen`, LOGOUT. Blocking socket work runs under
//! `spawn_blocking`; the async trait surface never holds a socket across
//! an await point.

use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use mail_parser::{MessageParser, MimeHeaders};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MailboxError;
use crate::mailbox::MailboxSource;
use crate::mailbox::message::{OutboundMessage, RawMessage, strip_html};
use crate::store::MailboxRecord;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

// ── Configuration ───────────────────────────────────────────────────

/// Connection settings for one tenant's IMAP/SMTP mailbox.
#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// The tenant's support address, used as the outbound From.
    pub from_address: String,
    /// At most this many messages are fetched (and flagged `\Seen`) per
    /// cycle. Fetching flags, so anything past the limit must stay UNSEEN
    /// to come back next cycle.
    pub fetch_limit: usize,
}

impl ImapConfig {
    /// Build config from a persisted mailbox record.
    pub fn from_record(
        record: &MailboxRecord,
        support_email: &str,
        fetch_limit: usize,
    ) -> Result<Self, MailboxError> {
        let imap_host = record.imap_host.clone().ok_or_else(|| missing("imap_host"))?;
        let username = record.username.clone().ok_or_else(|| missing("username"))?;
        let password = record.password.clone().ok_or_else(|| missing("password"))?;
        let smtp_host = record
            .smtp_host
            .clone()
            .unwrap_or_else(|| imap_host.replace("imap", "smtp"));

        Ok(Self {
            imap_port: record.imap_port.unwrap_or(993),
            smtp_port: record.smtp_port.unwrap_or(587),
            imap_host,
            smtp_host,
            username,
            password,
            from_address: support_email.to_string(),
            fetch_limit,
        })
    }
}

fn missing(field: &str) -> MailboxError {
    MailboxError::Protocol(format!("mailbox record incomplete: missing {field}"))
}

// ── Backend ─────────────────────────────────────────────────────────

/// IMAP mailbox backend.
pub struct ImapMailbox {
    config: ImapConfig,
    connected: bool,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        Self {
            config,
            connected: false,
        }
    }
}

#[async_trait]
impl MailboxSource for ImapMailbox {
    async fn connect(&mut self) -> Result<(), MailboxError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || check_login(&config))
            .await
            .map_err(|e| MailboxError::Protocol(format!("connect task panicked: {e}")))??;

        self.connected = true;
        info!(host = %self.config.imap_host, "IMAP mailbox connected");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), MailboxError> {
        // Sessions are per-cycle; there is no held socket to close.
        self.connected = false;
        debug!(host = %self.config.imap_host, "IMAP mailbox disconnected");
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        if !self.connected {
            return Err(MailboxError::NotConnected);
        }

        let config = self.config.clone();
        let messages = tokio::task::spawn_blocking(move || fetch_unseen(&config))
            .await
            .map_err(|e| MailboxError::Protocol(format!("poll task panicked: {e}")))??;

        if !messages.is_empty() {
            debug!(count = messages.len(), "Fetched unseen messages");
        }
        Ok(messages)
    }

    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MailboxError> {
        let config = self.config.clone();
        let message = message.clone();
        tokio::task::spawn_blocking(move || send_smtp(&config, &message))
            .await
            .map_err(|e| MailboxError::Protocol(format!("send task panicked: {e}")))??;
        Ok(())
    }

    async fn mark_processed(&mut self, _external_id: &str) -> Result<(), MailboxError> {
        // `\Seen` was already applied at fetch time.
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ── Blocking IMAP session (run under spawn_blocking) ────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

fn connect_error(host: &str, e: &std::io::Error) -> MailboxError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MailboxError::Timeout {
            host: host.to_string(),
        },
        _ => MailboxError::HostUnreachable {
            host: host.to_string(),
            reason: e.to_string(),
        },
    }
}

fn io_error(host: &str, e: &std::io::Error) -> MailboxError {
    match e.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => MailboxError::Timeout {
            host: host.to_string(),
        },
        _ => MailboxError::Protocol(format!("IMAP I/O error: {e}")),
    }
}

/// Open a TLS stream to the IMAP host.
fn open_tls(config: &ImapConfig) -> Result<TlsStream, MailboxError> {
    let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
        .map_err(|e| connect_error(&config.imap_host, &e))?;
    tcp.set_read_timeout(Some(IO_TIMEOUT))
        .map_err(|e| MailboxError::Protocol(format!("set_read_timeout: {e}")))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name: rustls::pki_types::ServerName<'_> =
        rustls::pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| MailboxError::Protocol(format!("invalid server name: {e}")))?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)
        .map_err(|e| MailboxError::Protocol(format!("TLS setup failed: {e}")))?;

    Ok(rustls::StreamOwned::new(conn, tcp))
}

/// Read one CRLF-terminated line.
fn read_line(tls: &mut TlsStream, host: &str) -> Result<String, MailboxError> {
    let mut buf = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        match std::io::Read::read(tls, &mut byte) {
            Ok(0) => return Err(MailboxError::Protocol("IMAP connection closed".into())),
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    return Ok(String::from_utf8_lossy(&buf).to_string());
                }
            }
            Err(e) => return Err(io_error(host, &e)),
        }
    }
}

/// Send a tagged command and collect response lines until the tagged reply.
fn send_cmd(
    tls: &mut TlsStream,
    host: &str,
    tag: &str,
    cmd: &str,
) -> Result<Vec<String>, MailboxError> {
    let full = format!("{tag} {cmd}\r\n");
    IoWrite::write_all(tls, full.as_bytes()).map_err(|e| io_error(host, &e))?;
    IoWrite::flush(tls).map_err(|e| io_error(host, &e))?;

    let mut lines = Vec::new();
    loop {
        let line = read_line(tls, host)?;
        let done = line.starts_with(tag);
        lines.push(line);
        if done {
            break;
        }
    }
    Ok(lines)
}

/// Open a session, LOGIN, LOGOUT — credential probe for `connect`.
fn check_login(config: &ImapConfig) -> Result<(), MailboxError> {
    let host = &config.imap_host;
    let mut tls = open_tls(config)?;
    let _greeting = read_line(&mut tls, host)?;

    let login_resp = send_cmd(
        &mut tls,
        host,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailboxError::AuthFailed {
            reason: "IMAP login rejected".into(),
        });
    }

    let _ = send_cmd(&mut tls, host, "A2", "LOGOUT");
    Ok(())
}

/// Fetch unseen messages via raw IMAP over TLS (blocking).
fn fetch_unseen(config: &ImapConfig) -> Result<Vec<RawMessage>, MailboxError> {
    let host = &config.imap_host;
    let mut tls = open_tls(config)?;
    let _greeting = read_line(&mut tls, host)?;

    let login_resp = send_cmd(
        &mut tls,
        host,
        "A1",
        &format!(
            "LOGIN \"{}\" \"{}\"",
            config.username,
            config.password.expose_secret()
        ),
    )?;
    if !login_resp.last().is_some_and(|l| l.contains("OK")) {
        return Err(MailboxError::AuthFailed {
            reason: "IMAP login rejected".into(),
        });
    }

    let _select = send_cmd(&mut tls, host, "A2", "SELECT \"INBOX\"")?;

    let search_resp = send_cmd(&mut tls, host, "A3", "SEARCH UNSEEN")?;
    let seqs = unseen_sequences(&search_resp, config.fetch_limit);

    let mut results = Vec::new();
    let mut tag_counter = 4_u32;

    for seq in &seqs {
        let fetch_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let fetch_resp = send_cmd(&mut tls, host, &fetch_tag, &format!("FETCH {seq} RFC822"))?;

        let raw: String = fetch_resp
            .iter()
            .skip(1)
            .take(fetch_resp.len().saturating_sub(2))
            .cloned()
            .collect();

        match parse_rfc822(raw.as_bytes()) {
            Some(message) => results.push(message),
            None => warn!("Skipping unparseable message (seq {seq})"),
        }

        // Fetching consumes the message: set `\Seen` so the next UNSEEN
        // search skips it. The idempotency ledger, not this flag, is the
        // source of truth for "already handled".
        let store_tag = format!("A{tag_counter}");
        tag_counter += 1;
        let _ = send_cmd(&mut tls, host, &store_tag, &format!("STORE {seq} +FLAGS (\\Seen)"));
    }

    let logout_tag = format!("A{tag_counter}");
    let _ = send_cmd(&mut tls, host, &logout_tag, "LOGOUT");

    Ok(results)
}

/// Pull the message sequence numbers out of a SEARCH response, capped at
/// `limit`. Only the returned sequences are fetched and flagged `\Seen`;
/// everything past the cap stays UNSEEN and is returned by the next
/// cycle's search.
fn unseen_sequences(search_resp: &[String], limit: usize) -> Vec<String> {
    let mut seqs: Vec<String> = Vec::new();
    for line in search_resp {
        if line.starts_with("* SEARCH") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 2 {
                seqs.extend(parts[2..].iter().map(|s| s.to_string()));
            }
        }
    }
    if seqs.len() > limit {
        debug!(
            unseen = seqs.len(),
            limit, "More unseen mail than the cycle limit; rest stays unseen"
        );
        seqs.truncate(limit);
    }
    seqs
}

/// Parse a raw RFC 822 message into the uniform envelope.
pub(crate) fn parse_rfc822(raw: &[u8]) -> Option<RawMessage> {
    let parsed = MessageParser::default().parse(raw)?;

    let (sender_email, sender_name) = match parsed.from().and_then(|addr| addr.first()) {
        Some(addr) => (
            addr.address()
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| "unknown".into()),
            addr.name().map(|s| s.to_string()),
        ),
        None => ("unknown".into(), None),
    };

    let subject = parsed.subject().unwrap_or("(no subject)").to_string();
    let html_body = parsed.body_html(0).map(|h| h.to_string());
    let body = extract_text(&parsed);

    let external_id = parsed
        .message_id()
        .map(|s| s.to_string())
        .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4()));

    let received_at = parsed
        .date()
        .and_then(|d| {
            chrono::NaiveDate::from_ymd_opt(d.year as i32, u32::from(d.month), u32::from(d.day))
                .and_then(|date| {
                    date.and_hms_opt(
                        u32::from(d.hour),
                        u32::from(d.minute),
                        u32::from(d.second),
                    )
                })
                .map(|n| n.and_utc())
        })
        .unwrap_or_else(Utc::now);

    let thread_id = parsed.thread_name().map(|s| s.to_string());

    Some(RawMessage {
        external_id,
        subject,
        sender_email,
        sender_name,
        body,
        html_body,
        received_at,
        thread_id,
    })
}

/// Extract readable text from a parsed email.
fn extract_text(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.to_string();
    }
    if let Some(html) = parsed.body_html(0) {
        return strip_html(html.as_ref());
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}]\n{text}");
        }
    }
    "(no readable content)".to_string()
}

// ── Blocking SMTP send ──────────────────────────────────────────────

fn send_smtp(config: &ImapConfig, message: &OutboundMessage) -> Result<(), MailboxError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| MailboxError::SendFailed {
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    let mut builder = Message::builder()
        .from(config.from_address.parse().map_err(|e| {
            MailboxError::SendFailed {
                reason: format!("Invalid from address: {e}"),
            }
        })?)
        .to(message.to.parse().map_err(|e| MailboxError::SendFailed {
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(message.subject.as_str());

    if let Some(ref in_reply_to) = message.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }

    let email = builder
        .body(message.body.clone())
        .map_err(|e| MailboxError::SendFailed {
            reason: format!("Failed to build email: {e}"),
        })?;

    transport.send(&email).map_err(|e| MailboxError::SendFailed {
        reason: format!("SMTP send failed: {e}"),
    })?;

    info!("Email sent to {}", message.to);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record_with_imap() -> MailboxRecord {
        MailboxRecord {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            kind: crate::store::MailboxKind::Imap,
            imap_host: Some("imap.acme.test".into()),
            imap_port: None,
            smtp_host: None,
            smtp_port: None,
            username: Some("support@acme.test".into()),
            password: Some(SecretString::from("hunter2")),
            api_base_url: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            connected: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn config_from_record_fills_defaults() {
        let config =
            ImapConfig::from_record(&record_with_imap(), "support@acme.test", 10).unwrap();
        assert_eq!(config.imap_port, 993);
        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.smtp_host, "smtp.acme.test");
        assert_eq!(config.from_address, "support@acme.test");
        assert_eq!(config.fetch_limit, 10);
    }

    #[test]
    fn config_from_record_requires_host() {
        let mut record = record_with_imap();
        record.imap_host = None;
        let err = ImapConfig::from_record(&record, "support@acme.test", 10).unwrap_err();
        assert!(err.to_string().contains("imap_host"), "got: {err}");
    }

    #[test]
    fn search_response_yields_sequences() {
        let resp = vec![
            "* SEARCH 3 7 12\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert_eq!(unseen_sequences(&resp, 10), vec!["3", "7", "12"]);
    }

    #[test]
    fn empty_search_response_yields_nothing() {
        let resp = vec![
            "* SEARCH\r\n".to_string(),
            "A3 OK SEARCH completed\r\n".to_string(),
        ];
        assert!(unseen_sequences(&resp, 10).is_empty());
    }

    #[test]
    fn unseen_burst_is_capped_oldest_first() {
        // 11 unseen, limit 10: the 11th stays unseen for the next cycle.
        let line = format!(
            "* SEARCH {}\r\n",
            (1..=11).map(|n| n.to_string()).collect::<Vec<_>>().join(" ")
        );
        let resp = vec![line, "A3 OK SEARCH completed\r\n".to_string()];
        let seqs = unseen_sequences(&resp, 10);
        assert_eq!(seqs.len(), 10);
        assert_eq!(seqs.first().map(String::as_str), Some("1"));
        assert_eq!(seqs.last().map(String::as_str), Some("10"));
    }

    #[test]
    fn parse_plain_text_message() {
        let raw = b"From: Jane Doe <Jane@Example.com>\r\n\
            To: support@acme.test\r\n\
            Subject: Order broken\r\n\
            Message-ID: <m1@example.com>\r\n\
            Date: Mon, 2 Mar 2026 10:00:00 +0000\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            My order arrived broken.\r\n";

        let msg = parse_rfc822(raw).unwrap();
        assert_eq!(msg.external_id, "m1@example.com");
        assert_eq!(msg.sender_email, "jane@example.com");
        assert_eq!(msg.sender_name.as_deref(), Some("Jane Doe"));
        assert_eq!(msg.subject, "Order broken");
        assert!(msg.body.contains("My order arrived broken."));
        assert_eq!(msg.received_at.to_rfc3339(), "2026-03-02T10:00:00+00:00");
    }

    #[test]
    fn parse_html_message_yields_text() {
        let raw = b"From: bob@example.com\r\n\
            Subject: Hi\r\n\
            Message-ID: <m2@example.com>\r\n\
            Content-Type: text/html\r\n\
            \r\n\
            <p>Hello <b>there</b></p>\r\n";

        let msg = parse_rfc822(raw).unwrap();
        assert!(msg.body.contains("Hello"));
        assert!(!msg.body.contains("<p>"));
        assert!(msg.html_body.is_some());
        assert!(msg.sender_name.is_none());
    }

    #[test]
    fn parse_without_message_id_generates_one() {
        let raw = b"From: bob@example.com\r\nSubject: Hi\r\n\r\nBody\r\n";
        let msg = parse_rfc822(raw).unwrap();
        assert!(msg.external_id.starts_with("gen-"), "got: {}", msg.external_id);
    }

    #[tokio::test]
    async fn mark_processed_is_noop_and_starts_disconnected() {
        let config =
            ImapConfig::from_record(&record_with_imap(), "support@acme.test", 10).unwrap();
        let mut mailbox = ImapMailbox::new(config);
        assert!(!mailbox.is_connected());
        mailbox.mark_processed("m1@example.com").await.unwrap();
        let err = mailbox.poll().await.unwrap_err();
        assert!(matches!(err, MailboxError::NotConnected));
    }
}
