//! Unified `TicketStore` trait — single async interface for all persistence.
//!
//! The pipeline consumes this as `Arc<dyn TicketStore>`; the ticket CRUD
//! surface reads and writes through the same interface, so every invariant
//! the schema enforces holds for both writers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::StoreError;
use crate::tickets::model::{ProcessedOutcome, Ticket, TicketActivity, TicketComment};

/// A company account. All tickets and mailboxes are scoped to one tenant.
#[derive(Debug, Clone)]
pub struct TenantRecord {
    pub id: Uuid,
    pub name: String,
    /// The connected support address. Inbound mail from this address is
    /// always skipped to break self-reply loops.
    pub support_email: String,
    pub portal_enabled: bool,
    pub portal_base_url: Option<String>,
    /// Custom acknowledgment template; `None` uses the built-in default.
    pub ack_template: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Which backend a mailbox connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxKind {
    Imap,
    Api,
}

impl MailboxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailboxKind::Imap => "imap",
            MailboxKind::Api => "api",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "imap" => Some(MailboxKind::Imap),
            "api" => Some(MailboxKind::Api),
            _ => None,
        }
    }
}

/// A tenant's mailbox connection. IMAP and API fields are populated
/// according to `kind`; the rest stay `None`.
#[derive(Debug, Clone)]
pub struct MailboxRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: MailboxKind,
    // IMAP backend
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    // API backend
    pub api_base_url: Option<String>,
    pub access_token: Option<SecretString>,
    pub refresh_token: Option<SecretString>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Connected mailboxes are polled; disconnecting clears this.
    pub connected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A team member account within a tenant. Matched by email for comment
/// attribution; the audience for notification fan-out.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

/// One idempotency-ledger row: this external message id has already produced
/// an effect. Write-once.
#[derive(Debug, Clone)]
pub struct ProcessedEmail {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: String,
    /// The ticket the message affected, absent for skips.
    pub ticket_id: Option<Uuid>,
    pub outcome: ProcessedOutcome,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedEmail {
    pub fn new(
        tenant_id: Uuid,
        external_id: impl Into<String>,
        ticket_id: Option<Uuid>,
        outcome: ProcessedOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            external_id: external_id.into(),
            ticket_id,
            outcome,
            processed_at: Utc::now(),
        }
    }
}

/// One row in a team member's notification feed.
#[derive(Debug, Clone)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub ticket_id: Option<Uuid>,
    pub body: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl NotificationRecord {
    pub fn new(
        tenant_id: Uuid,
        user_id: Uuid,
        ticket_id: Option<Uuid>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            user_id,
            ticket_id,
            body: body.into(),
            read: false,
            created_at: Utc::now(),
        }
    }
}

/// Backend-agnostic persistence trait covering tenants, mailboxes, tickets,
/// the idempotency ledger, and notification feeds.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), StoreError>;

    // ── Tenants ─────────────────────────────────────────────────────

    /// Insert a new tenant.
    async fn insert_tenant(&self, tenant: &TenantRecord) -> Result<(), StoreError>;

    /// Get a tenant by ID.
    async fn get_tenant(&self, id: Uuid) -> Result<Option<TenantRecord>, StoreError>;

    /// List all tenants.
    async fn list_tenants(&self) -> Result<Vec<TenantRecord>, StoreError>;

    // ── Team members ────────────────────────────────────────────────

    /// Insert a new team member.
    async fn insert_user(&self, user: &UserRecord) -> Result<(), StoreError>;

    /// Find a team member by email within a tenant (case-insensitive).
    async fn get_user_by_email(
        &self,
        tenant_id: Uuid,
        email: &str,
    ) -> Result<Option<UserRecord>, StoreError>;

    /// List a tenant's team members.
    async fn list_users(&self, tenant_id: Uuid) -> Result<Vec<UserRecord>, StoreError>;

    // ── Mailboxes ───────────────────────────────────────────────────

    /// Insert or replace a tenant's mailbox connection.
    async fn upsert_mailbox(&self, mailbox: &MailboxRecord) -> Result<(), StoreError>;

    /// Get a tenant's mailbox connection.
    async fn get_mailbox(&self, tenant_id: Uuid) -> Result<Option<MailboxRecord>, StoreError>;

    /// All mailboxes currently marked connected, across tenants. The
    /// supervisor resumes polling from this on startup.
    async fn list_connected_mailboxes(&self) -> Result<Vec<MailboxRecord>, StoreError>;

    /// Mark a mailbox connected or disconnected.
    async fn set_mailbox_connected(
        &self,
        tenant_id: Uuid,
        connected: bool,
    ) -> Result<(), StoreError>;

    /// Persist a rotated OAuth token pair after refresh.
    async fn update_mailbox_tokens(
        &self,
        tenant_id: Uuid,
        access_token: &SecretString,
        refresh_token: Option<&SecretString>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Tickets ─────────────────────────────────────────────────────

    /// Insert a new ticket with its seeded processed-id list. Fails with
    /// [`StoreError::Conflict`] when the number is already taken; the caller
    /// retries with the next candidate.
    async fn insert_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Get a ticket by ID, processed-id list hydrated.
    async fn get_ticket(&self, id: Uuid) -> Result<Option<Ticket>, StoreError>;

    /// Get a ticket by its human-facing number within a tenant.
    async fn get_ticket_by_number(
        &self,
        tenant_id: Uuid,
        number: &str,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Update a ticket's scalar fields (status, priority, counters,
    /// timestamps). Last writer wins; the processed-id list and comments are
    /// append-only through their own methods and never touched here.
    async fn update_ticket(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Highest ticket number assigned for a tenant, if any. Fixed-width
    /// numbers make the lexicographic maximum the numeric maximum.
    async fn latest_ticket_number(&self, tenant_id: Uuid) -> Result<Option<String>, StoreError>;

    /// Most recent ticket matching a content hash within a tenant, created
    /// at or after `since`.
    async fn find_ticket_by_content_hash(
        &self,
        tenant_id: Uuid,
        content_hash: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Most recent open ticket from a sender within a tenant, created at or
    /// after `since`.
    async fn find_open_ticket_by_sender(
        &self,
        tenant_id: Uuid,
        sender_email: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<Ticket>, StoreError>;

    /// The ticket that already folded in an external message id, if any.
    async fn find_ticket_by_external_id(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<Ticket>, StoreError>;

    /// Append an external message id to a ticket's processed-id list.
    /// Union semantics: appending an id already present is a no-op, and
    /// concurrent appends never lose entries.
    async fn add_processed_id(&self, ticket_id: Uuid, external_id: &str)
    -> Result<(), StoreError>;

    // ── Comments & activities ───────────────────────────────────────

    /// Append a comment to a ticket.
    async fn append_comment(&self, comment: &TicketComment) -> Result<(), StoreError>;

    /// List a ticket's comments, oldest first.
    async fn comments_for_ticket(&self, ticket_id: Uuid)
    -> Result<Vec<TicketComment>, StoreError>;

    /// Append an audit activity to a ticket.
    async fn append_activity(&self, activity: &TicketActivity) -> Result<(), StoreError>;

    /// List a ticket's activities, oldest first.
    async fn activities_for_ticket(
        &self,
        ticket_id: Uuid,
    ) -> Result<Vec<TicketActivity>, StoreError>;

    // ── Idempotency ledger ──────────────────────────────────────────

    /// Has this external message id already produced an effect?
    async fn is_processed(&self, tenant_id: Uuid, external_id: &str) -> Result<bool, StoreError>;

    /// The ledger row for an external message id, if present.
    async fn get_processed(
        &self,
        tenant_id: Uuid,
        external_id: &str,
    ) -> Result<Option<ProcessedEmail>, StoreError>;

    /// Record that an external message id has been handled. Fails with
    /// [`StoreError::Conflict`] on a concurrent double-insert; callers treat
    /// that as already processed.
    async fn record_processed(&self, record: &ProcessedEmail) -> Result<(), StoreError>;

    // ── Notifications ───────────────────────────────────────────────

    /// Insert a notification feed row.
    async fn insert_notification(&self, notification: &NotificationRecord)
    -> Result<(), StoreError>;

    /// A team member's feed, most recent first, up to `limit`.
    async fn notifications_for_user(
        &self,
        user_id: Uuid,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, StoreError>;

    /// Mark one notification as read.
    async fn mark_notification_read(&self, id: Uuid) -> Result<(), StoreError>;
}
