//! libSQL backend — async `TicketStore` trait implementation.
//!
//! Stores a single connection that is reused for all operations.
//! `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
//! Unique constraints (ticket number, ledger key, processed-id pairs) are the
//! serialization points; there are no application-level locks here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;
use crate::store::migrations;
use crate::store::traits::{
    MailboxKind, MailboxRecord, NotificationRecord, ProcessedEmail, TenantRecord, TicketStore,
    UserRecord,
};
use crate::tickets::model::{
    ActivityType, ProcessedOutcome, Ticket, TicketActivity, TicketComment, TicketPriority,
    TicketStatus,
};

/// libSQL ticket store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Load a ticket's processed-id list from the child table.
    async fn load_processed_ids(&self, ticket_id: Uuid) -> Result<Vec<String>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT external_id FROM ticket_processed_ids WHERE ticket_id = ?1 ORDER BY rowid",
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("load_processed_ids: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Run a single-ticket query and hydrate the processed-id list.
    async fn query_one_ticket(
        &self,
        sql: &str,
        query_params: impl libsql::params::IntoParams,
        context: &'static str,
    ) -> Result<Option<Ticket>, StoreError> {
        let mut rows = self
            .conn()
            .query(sql, query_params)
            .await
            .map_err(|e| StoreError::Query(format!("{context}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let mut ticket = row_to_ticket(&row)
                    .map_err(|e| StoreError::Query(format!("{context} row parse: {e}")))?;
                ticket.processed_external_ids = self.load_processed_ids(ticket.id).await?;
                Ok(Some(ticket))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("{context}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    // Try RFC 3339 first (our canonical write format)
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // Try SQLite datetime() output with fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    // Try SQLite datetime() output without fractional seconds
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

/// True when libsql reports a unique-constraint rejection.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Map an insert error, turning unique violations into [`StoreError::Conflict`].
fn insert_err(context: &'static str, e: libsql::Error) -> StoreError {
    if is_unique_violation(&e) {
        StoreError::Conflict(format!("{context}: {e}"))
    } else {
        StoreError::Query(format!("{context}: {e}"))
    }
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<i64>` to libsql Value.
fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(i) => libsql::Value::Integer(i),
        None => libsql::Value::Null,
    }
}

fn secret_text(s: &Option<SecretString>) -> libsql::Value {
    opt_text_owned(s.as_ref().map(|s| s.expose_secret().to_string()))
}

/// Map a libsql Row to a TenantRecord.
///
/// Column order matches TENANT_COLUMNS:
/// 0:id, 1:name, 2:support_email, 3:portal_enabled, 4:portal_base_url,
/// 5:ack_template, 6:created_at
fn row_to_tenant(row: &libsql::Row) -> Result<TenantRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let portal_enabled: i64 = row.get(3)?;
    let created_str: String = row.get(6)?;

    Ok(TenantRecord {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        support_email: row.get(2)?,
        portal_enabled: portal_enabled != 0,
        portal_base_url: row.get(4).ok(),
        ack_template: row.get(5).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a UserRecord.
fn row_to_user(row: &libsql::Row) -> Result<UserRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tenant_str: String = row.get(1)?;
    let created_str: String = row.get(4)?;

    Ok(UserRecord {
        id: parse_uuid(&id_str),
        tenant_id: parse_uuid(&tenant_str),
        email: row.get(2)?,
        display_name: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a MailboxRecord.
///
/// Column order matches MAILBOX_COLUMNS:
/// 0:id, 1:tenant_id, 2:kind, 3:imap_host, 4:imap_port, 5:smtp_host,
/// 6:smtp_port, 7:username, 8:password, 9:api_base_url, 10:access_token,
/// 11:refresh_token, 12:token_expires_at, 13:connected, 14:created_at,
/// 15:updated_at
fn row_to_mailbox(row: &libsql::Row) -> Result<MailboxRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tenant_str: String = row.get(1)?;
    let kind_str: String = row.get(2)?;
    let expires_str: Option<String> = row.get(12).ok();
    let connected: i64 = row.get(13)?;
    let created_str: String = row.get(14)?;
    let updated_str: String = row.get(15)?;

    Ok(MailboxRecord {
        id: parse_uuid(&id_str),
        tenant_id: parse_uuid(&tenant_str),
        kind: MailboxKind::parse_str(&kind_str).unwrap_or(MailboxKind::Imap),
        imap_host: row.get(3).ok(),
        imap_port: row.get::<i64>(4).ok().map(|p| p as u16),
        smtp_host: row.get(5).ok(),
        smtp_port: row.get::<i64>(6).ok().map(|p| p as u16),
        username: row.get(7).ok(),
        password: row.get::<String>(8).ok().map(SecretString::from),
        api_base_url: row.get(9).ok(),
        access_token: row.get::<String>(10).ok().map(SecretString::from),
        refresh_token: row.get::<String>(11).ok().map(SecretString::from),
        token_expires_at: parse_optional_datetime(&expires_str),
        connected: connected != 0,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Map a libsql Row to a Ticket. The processed-id list is hydrated separately.
///
/// Column order matches TICKET_COLUMNS:
/// 0:id, 1:tenant_id, 2:number, 3:subject, 4:body, 5:sender_email,
/// 6:sender_name, 7:external_message_id, 8:content_hash, 9:status,
/// 10:priority, 11:escalation_count, 12:public_token, 13:created_at,
/// 14:updated_at, 15:last_reply_at, 16:escalated_at, 17:resolved_at
fn row_to_ticket(row: &libsql::Row) -> Result<Ticket, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tenant_str: String = row.get(1)?;
    let status_str: String = row.get(9)?;
    let priority_str: String = row.get(10)?;
    let escalation_count: i64 = row.get(11)?;
    let created_str: String = row.get(13)?;
    let updated_str: String = row.get(14)?;
    let last_reply_str: Option<String> = row.get(15).ok();
    let escalated_str: Option<String> = row.get(16).ok();
    let resolved_str: Option<String> = row.get(17).ok();

    Ok(Ticket {
        id: parse_uuid(&id_str),
        tenant_id: parse_uuid(&tenant_str),
        number: row.get(2)?,
        subject: row.get(3)?,
        body: row.get(4)?,
        sender_email: row.get(5)?,
        sender_name: row.get(6).ok(),
        external_message_id: row.get(7)?,
        content_hash: row.get(8)?,
        processed_external_ids: Vec::new(),
        status: TicketStatus::parse_str(&status_str).unwrap_or(TicketStatus::New),
        priority: TicketPriority::parse_str(&priority_str).unwrap_or(TicketPriority::Low),
        escalation_count: escalation_count as i32,
        public_token: row.get(12)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
        last_reply_at: parse_optional_datetime(&last_reply_str),
        escalated_at: parse_optional_datetime(&escalated_str),
        resolved_at: parse_optional_datetime(&resolved_str),
    })
}

/// Map a libsql Row to a TicketComment.
fn row_to_comment(row: &libsql::Row) -> Result<TicketComment, libsql::Error> {
    let id_str: String = row.get(0)?;
    let ticket_str: String = row.get(1)?;
    let author_str: Option<String> = row.get(2).ok();
    let created_str: String = row.get(5)?;

    Ok(TicketComment {
        id: parse_uuid(&id_str),
        ticket_id: parse_uuid(&ticket_str),
        author_user_id: author_str.map(|s| parse_uuid(&s)),
        author_name: row.get(3)?,
        body: row.get(4)?,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a TicketActivity.
fn row_to_activity(row: &libsql::Row) -> Result<TicketActivity, libsql::Error> {
    let id_str: String = row.get(0)?;
    let ticket_str: String = row.get(1)?;
    let type_str: String = row.get(2)?;
    let created_str: String = row.get(6)?;

    Ok(TicketActivity {
        id: parse_uuid(&id_str),
        ticket_id: parse_uuid(&ticket_str),
        activity_type: ActivityType::parse_str(&type_str).unwrap_or(ActivityType::Note),
        actor: row.get(3).ok(),
        detail: row.get(4)?,
        content: row.get(5).ok(),
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to a ProcessedEmail ledger record.
fn row_to_processed(row: &libsql::Row) -> Result<ProcessedEmail, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tenant_str: String = row.get(1)?;
    let ticket_str: Option<String> = row.get(3).ok();
    let outcome_str: String = row.get(4)?;
    let processed_str: String = row.get(5)?;

    Ok(ProcessedEmail {
        id: parse_uuid(&id_str),
        tenant_id: parse_uuid(&tenant_str),
        external_id: row.get(2)?,
        ticket_id: ticket_str.map(|s| parse_uuid(&s)),
        outcome: ProcessedOutcome::parse_str(&outcome_str).unwrap_or(ProcessedOutcome::Skipped),
        processed_at: parse_datetime(&processed_str),
    })
}

/// Map a libsql Row to a NotificationRecord.
fn row_to_notification(row: &libsql::Row) -> Result<NotificationRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let tenant_str: String = row.get(1)?;
    let user_str: String = row.get(2)?;
    let ticket_str: Option<String> = row.get(3).ok();
    let read: i64 = row.get(5)?;
    let created_str: String = row.get(6)?;

    Ok(NotificationRecord {
        id: parse_uuid(&id_str),
        tenant_id: parse_uuid(&tenant_str),
        user_id: parse_uuid(&user_str),
        ticket_id: ticket_str.map(|s| parse_uuid(&s)),
        body: row.get(4)?,
        read: read != 0,
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const TENANT_COLUMNS: &str =
    "id, name, support_email, portal_enabled, portal_base_url, ack_template, created_at";

const USER_COLUMNS: &str = "id, tenant_id, email, display_name, created_at";

const MAILBOX_COLUMNS: &str = "id, tenant_id, kind, imap_host, imap_port, smtp_host, smtp_port, \
     username, password, api_base_url, access_token, refresh_token, token_expires_at, connected, \
     created_at, updated_at";

const TICKET_COLUMNS: &str = "id, tenant_id, number, subject, body, sender_email, sender_name, \
     external_message_id, content_hash, status, priority, escalation_count, public_token, \
     created_at, updated_at, last_reply_at, escalated_at, resolved_at";

/// TICKET_COLUMNS qualified with the `t.` alias for joined queries.
const TICKET_COLUMNS_T: &str = "t.id, t.tenant_id, t.number, t.subject, t.body, t.sender_email, \
     t.sender_name, t.external_message_id, t.content_hash, t.status, t.priority, \
     t.escalation_count, t.public_token, t.created_at, t.updated_at, t.last_reply_at, \
     t.escalated_at, t.resolved_at";

const COMMENT_COLUMNS: &str = "id, ticket_id, author_user_id, author_name, body, created_at";

const ACTIVITY_COLUMNS: &str = "id, ticket_id, activity_type, actor, detail, content, created_at";

const PROCESSED_COLUMNS: &str = "id, tenant_id, external_id, ticket_id, outcome, processed_at";

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, user_id, ticket_id, body, read, created_at";

#[async_trait]
impl TicketStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO tenants (id, name, support_email, portal_enabled, portal_base_url, \
                 ack_template, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tenant.id.to_string(),
                    tenant.name.clone(),
                    tenant.support_email.clone(),
                    tenant.portal_enabled as i64,
                    opt_text(tenant.portal_base_url.as_deref()),
                    opt_text(tenant.ack_template.as_deref()),
                    tenant.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| insert_err("insert_tenant", e))?;

        debug!(tenant_id = %tenant.id, name = %tenant.name, "Tenant inserted");
        Ok(())
    }

    async fn get_tenant(&self, id: Uuid) -> Result<Option<TenantRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_tenant: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let tenant = row_to_tenant(&row)
                    .map_err(|e| StoreError::Query(format!("get_tenant row parse: {e}")))?;
                Ok(Some(tenant))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_tenant: {e}"))),
        }
    }

    async fn list_tenants(&self) -> Result<Vec<TenantRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at ASC"),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_tenants: {e}")))?;

        let mut tenants = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_tenant(&row) {
                Ok(tenant) => tenants.push(tenant),
                Err(e) => {
                    tracing::warn!("Skipping tenant row: {e}");
                }
            }
        }
        Ok(tenants)
    }

    // ── Team members ────────────────────────────────────────────────

    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO users (id, tenant_id, email, display_name, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id.to_string(),
                    user.tenant_id.to_string(),
                    user.email.clone(),
                    user.display_name.clone(),
                    user.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| insert_err("insert_user", e))?;
        Ok(())
    }

    async fn get_user_by_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<Option<UserRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users \
                     WHERE tenant_id = ?1 AND LOWER(email) = LOWER(?2)"
                ),
                params![tenant_id.to_string(), email],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_user_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let user = row_to_user(&row)
                    .map_err(|e| StoreError::Query(format!("get_user_by_email row parse: {e}")))?;
                Ok(Some(user))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_user_by_email: {e}"))),
        }
    }

    async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<UserRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE tenant_id = ?1 ORDER BY created_at ASC"
                ),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_users: {e}")))?;

        let mut users = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_user(&row) {
                Ok(user) => users.push(user),
                Err(e) => {
                    tracing::warn!("Skipping user row: {e}");
                }
            }
        }
        Ok(users)
    }

    // ── Mailboxes ───────────────────────────────────────────────────

    async fn upsert_mailbox(&self, mailbox: &MailboxRecord) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO mailboxes (id, tenant_id, kind, imap_host, imap_port, \
                 smtp_host, smtp_port, username, password, api_base_url, access_token, \
                 refresh_token, token_expires_at, connected, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    mailbox.id.to_string(),
                    mailbox.tenant_id.to_string(),
                    mailbox.kind.as_str(),
                    opt_text(mailbox.imap_host.as_deref()),
                    opt_int(mailbox.imap_port.map(|p| p as i64)),
                    opt_text(mailbox.smtp_host.as_deref()),
                    opt_int(mailbox.smtp_port.map(|p| p as i64)),
                    opt_text(mailbox.username.as_deref()),
                    secret_text(&mailbox.password),
                    opt_text(mailbox.api_base_url.as_deref()),
                    secret_text(&mailbox.access_token),
                    secret_text(&mailbox.refresh_token),
                    opt_text_owned(mailbox.token_expires_at.map(|t| t.to_rfc3339())),
                    mailbox.connected as i64,
                    mailbox.created_at.to_rfc3339(),
                    mailbox.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("upsert_mailbox: {e}")))?;

        debug!(tenant_id = %mailbox.tenant_id, kind = mailbox.kind.as_str(), "Mailbox saved");
        Ok(())
    }

    async fn get_mailbox(&self, tenant_id: Uuid) -> Result<Option<MailboxRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE tenant_id = ?1"),
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_mailbox: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let mailbox = row_to_mailbox(&row)
                    .map_err(|e| StoreError::Query(format!("get_mailbox row parse: {e}")))?;
                Ok(Some(mailbox))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_mailbox: {e}"))),
        }
    }

    async fn list_connected_mailboxes(&self) -> Result<Vec<MailboxRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {MAILBOX_COLUMNS} FROM mailboxes WHERE connected = 1 \
                     ORDER BY created_at ASC"
                ),
                (),
            )
            .await
            .map_err(|e| StoreError::Query(format!("list_connected_mailboxes: {e}")))?;

        let mut mailboxes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_mailbox(&row) {
                Ok(mailbox) => mailboxes.push(mailbox),
                Err(e) => {
                    tracing::warn!("Skipping mailbox row: {e}");
                }
            }
        }
        Ok(mailboxes)
    }

    async fn set_mailbox_connected(
        &self,
        tenant_id: Uuid,
        connected: bool,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE mailboxes SET connected = ?1, updated_at = ?2 WHERE tenant_id = ?3",
                params![
                    connected as i64,
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("set_mailbox_connected: {e}")))?;
        Ok(())
    }

    async fn update_mailbox_tokens(
        &self,
        tenant_id: Uuid,
        access_token: &SecretString,
        refresh_token: Option<&SecretString>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // A refresh response without a rotated refresh token keeps the old one.
        self.conn()
            .execute(
                "UPDATE mailboxes SET access_token = ?1, \
                 refresh_token = COALESCE(?2, refresh_token), \
                 token_expires_at = ?3, updated_at = ?4 WHERE tenant_id = ?5",
                params![
                    access_token.expose_secret(),
                    opt_text_owned(refresh_token.map(|t| t.expose_secret().to_string())),
                    expires_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    tenant_id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_mailbox_tokens: {e}")))?;

        debug!(tenant_id = %tenant_id, "Mailbox tokens rotated");
        Ok(())
    }

    // ── Tickets ─────────────────────────────────────────────────────

    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO tickets (id, tenant_id, number, subject, body, sender_email, \
                 sender_name, external_message_id, content_hash, status, priority, \
                 escalation_count, public_token, created_at, updated_at, last_reply_at, \
                 escalated_at, resolved_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, \
                 ?16, ?17, ?18)",
                params![
                    ticket.id.to_string(),
                    ticket.tenant_id.to_string(),
                    ticket.number.clone(),
                    ticket.subject.clone(),
                    ticket.body.clone(),
                    ticket.sender_email.clone(),
                    opt_text(ticket.sender_name.as_deref()),
                    ticket.external_message_id.clone(),
                    ticket.content_hash.clone(),
                    ticket.status.as_str(),
                    ticket.priority.as_str(),
                    ticket.escalation_count as i64,
                    ticket.public_token.clone(),
                    ticket.created_at.to_rfc3339(),
                    ticket.updated_at.to_rfc3339(),
                    opt_text_owned(ticket.last_reply_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(ticket.escalated_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(ticket.resolved_at.map(|t| t.to_rfc3339())),
                ],
            )
            .await
            .map_err(|e| insert_err("insert_ticket", e))?;

        for external_id in &ticket.processed_external_ids {
            self.add_processed_id(ticket.id, external_id).await?;
        }

        debug!(ticket_id = %ticket.id, number = %ticket.number, "Ticket inserted");
        Ok(())
    }

    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError> {
        self.query_one_ticket(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            params![id.to_string()],
            "get_ticket",
        )
        .await
    }

    async fn get_ticket_by_number(
        &self,
        tenant_id: Uuid,
        number: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        self.query_one_ticket(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE tenant_id = ?1 AND number = ?2"),
            params![tenant_id.to_string(), number],
            "get_ticket_by_number",
        )
        .await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE tickets SET subject = ?1, body = ?2, status = ?3, priority = ?4, \
                 escalation_count = ?5, updated_at = ?6, last_reply_at = ?7, escalated_at = ?8, \
                 resolved_at = ?9 WHERE id = ?10",
                params![
                    ticket.subject.clone(),
                    ticket.body.clone(),
                    ticket.status.as_str(),
                    ticket.priority.as_str(),
                    ticket.escalation_count as i64,
                    Utc::now().to_rfc3339(),
                    opt_text_owned(ticket.last_reply_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(ticket.escalated_at.map(|t| t.to_rfc3339())),
                    opt_text_owned(ticket.resolved_at.map(|t| t.to_rfc3339())),
                    ticket.id.to_string(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("update_ticket: {e}")))?;

        debug!(ticket_id = %ticket.id, status = ticket.status.as_str(), "Ticket updated");
        Ok(())
    }

    async fn latest_ticket_number(&self, tenant_id: Uuid) -> Result<Option<String>, StoreError> {
        // Zero padding makes lexicographic order numeric within one length;
        // a widened number sorts before "INC999999" as text, so compare
        // length first.
        let mut rows = self
            .conn()
            .query(
                "SELECT number FROM tickets WHERE tenant_id = ?1 \
                 ORDER BY length(number) DESC, number DESC LIMIT 1",
                params![tenant_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("latest_ticket_number: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get(0).ok()),
            _ => Ok(None),
        }
    }

    async fn find_ticket_by_content_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError> {
        self.query_one_ticket(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets \
                 WHERE tenant_id = ?1 AND content_hash = ?2 AND created_at >= ?3 \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![tenant_id.to_string(), content_hash, since.to_rfc3339()],
            "find_ticket_by_content_hash",
        )
        .await
    }

    async fn find_open_ticket_by_sender(
        &self,
        tenant_id: Uuid,
        sender_email: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError> {
        self.query_one_ticket(
            &format!(
                "SELECT {TICKET_COLUMNS} FROM tickets \
                 WHERE tenant_id = ?1 AND LOWER(sender_email) = LOWER(?2) \
                 AND status NOT IN ('resolved', 'closed') AND created_at >= ?3 \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![tenant_id.to_string(), sender_email, since.to_rfc3339()],
            "find_open_ticket_by_sender",
        )
        .await
    }

    async fn find_ticket_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Ticket>, StoreError> {
        self.query_one_ticket(
            &format!(
                "SELECT {TICKET_COLUMNS_T} FROM tickets t \
                 JOIN ticket_processed_ids p ON p.ticket_id = t.id \
                 WHERE t.tenant_id = ?1 AND p.external_id = ?2 LIMIT 1"
            ),
            params![tenant_id.to_string(), external_id],
            "find_ticket_by_external_id",
        )
        .await
    }

    async fn add_processed_id(
        &self,
        ticket_id: Uuid,
        external_id: &str,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO ticket_processed_ids (ticket_id, external_id, created_at) \
                 VALUES (?1, ?2, ?3)",
                params![
                    ticket_id.to_string(),
                    external_id,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("add_processed_id: {e}")))?;
        Ok(())
    }

    // ── Comments & activities ───────────────────────────────────────

    async fn append_comment(&self, comment: &TicketComment) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO ticket_comments (id, ticket_id, author_user_id, author_name, body, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    comment.id.to_string(),
                    comment.ticket_id.to_string(),
                    opt_text_owned(comment.author_user_id.map(|u| u.to_string())),
                    comment.author_name.clone(),
                    comment.body.clone(),
                    comment.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_comment: {e}")))?;
        Ok(())
    }

    async fn comments_for_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Vec<TicketComment>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {COMMENT_COLUMNS} FROM ticket_comments WHERE ticket_id = ?1 \
                     ORDER BY created_at ASC"
                ),
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("comments_for_ticket: {e}")))?;

        let mut comments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_comment(&row) {
                Ok(comment) => comments.push(comment),
                Err(e) => {
                    tracing::warn!("Skipping comment row: {e}");
                }
            }
        }
        Ok(comments)
    }

    async fn append_activity(&self, activity: &TicketActivity) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO ticket_activities (id, ticket_id, activity_type, actor, detail, \
                 content, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    activity.id.to_string(),
                    activity.ticket_id.to_string(),
                    activity.activity_type.as_str(),
                    opt_text(activity.actor.as_deref()),
                    activity.detail.clone(),
                    opt_text(activity.content.as_deref()),
                    activity.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("append_activity: {e}")))?;
        Ok(())
    }

    async fn activities_for_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Vec<TicketActivity>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ACTIVITY_COLUMNS} FROM ticket_activities WHERE ticket_id = ?1 \
                     ORDER BY created_at ASC"
                ),
                params![ticket_id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("activities_for_ticket: {e}")))?;

        let mut activities = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_activity(&row) {
                Ok(activity) => activities.push(activity),
                Err(e) => {
                    tracing::warn!("Skipping activity row: {e}");
                }
            }
        }
        Ok(activities)
    }

    // ── Idempotency ledger ──────────────────────────────────────────

    async fn is_processed(&self, tenant_id: Uuid, external_id: &str) -> Result<bool, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM processed_emails WHERE tenant_id = ?1 AND external_id = ?2",
                params![tenant_id.to_string(), external_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("is_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).unwrap_or(0);
                Ok(count > 0)
            }
            _ => Ok(false),
        }
    }

    async fn get_processed(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<ProcessedEmail>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROCESSED_COLUMNS} FROM processed_emails \
                     WHERE tenant_id = ?1 AND external_id = ?2"
                ),
                params![tenant_id.to_string(), external_id],
            )
            .await
            .map_err(|e| StoreError::Query(format!("get_processed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_processed(&row)
                    .map_err(|e| StoreError::Query(format!("get_processed row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Query(format!("get_processed: {e}"))),
        }
    }

    async fn record_processed(&self, record: &ProcessedEmail) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO processed_emails (id, tenant_id, external_id, ticket_id, outcome, \
                 processed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.to_string(),
                    record.tenant_id.to_string(),
                    record.external_id.clone(),
                    opt_text_owned(record.ticket_id.map(|t| t.to_string())),
                    record.outcome.as_str(),
                    record.processed_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| insert_err("record_processed", e))?;

        debug!(
            external_id = %record.external_id,
            outcome = record.outcome.as_str(),
            "Ledger entry recorded"
        );
        Ok(())
    }

    // ── Notifications ───────────────────────────────────────────────

    async fn insert_notification(
        &self,
        notification: &NotificationRecord,
    ) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "INSERT INTO notifications (id, tenant_id, user_id, ticket_id, body, read, \
                 created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    notification.id.to_string(),
                    notification.tenant_id.to_string(),
                    notification.user_id.to_string(),
                    opt_text_owned(notification.ticket_id.map(|t| t.to_string())),
                    notification.body.clone(),
                    notification.read as i64,
                    notification.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| StoreError::Query(format!("insert_notification: {e}")))?;
        Ok(())
    }

    async fn notifications_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE user_id = ?1 \
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![user_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| StoreError::Query(format!("notifications_for_user: {e}")))?;

        let mut notifications = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_notification(&row) {
                Ok(notification) => notifications.push(notification),
                Err(e) => {
                    tracing::warn!("Skipping notification row: {e}");
                }
            }
        }
        Ok(notifications)
    }

    async fn mark_notification_read(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn()
            .execute(
                "UPDATE notifications SET read = 1 WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| StoreError::Query(format!("mark_notification_read: {e}")))?;
        Ok(())
    }
}
