//! Ticket data model — the aggregate, its enums, and content-identity helpers.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle status of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    New,
    Acknowledged,
    InProgress,
    Resolved,
    Closed,
}

impl TicketStatus {
    /// Open tickets can still receive replies.
    pub fn is_open(&self) -> bool {
        !matches!(self, TicketStatus::Resolved | TicketStatus::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::New => "new",
            TicketStatus::Acknowledged => "acknowledged",
            TicketStatus::InProgress => "in_progress",
            TicketStatus::Resolved => "resolved",
            TicketStatus::Closed => "closed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(TicketStatus::New),
            "acknowledged" => Some(TicketStatus::Acknowledged),
            "in_progress" => Some(TicketStatus::InProgress),
            "resolved" => Some(TicketStatus::Resolved),
            "closed" => Some(TicketStatus::Closed),
            _ => None,
        }
    }
}

/// Ticket priority, totally ordered from `Low` to `Urgent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TicketPriority {
    /// One step up the order. `Urgent` stays `Urgent`.
    pub fn escalated(&self) -> Self {
        match self {
            TicketPriority::Low => TicketPriority::Medium,
            TicketPriority::Medium => TicketPriority::High,
            TicketPriority::High | TicketPriority::Urgent => TicketPriority::Urgent,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TicketPriority::Low => "low",
            TicketPriority::Medium => "medium",
            TicketPriority::High => "high",
            TicketPriority::Urgent => "urgent",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(TicketPriority::Low),
            "medium" => Some(TicketPriority::Medium),
            "high" => Some(TicketPriority::High),
            "urgent" => Some(TicketPriority::Urgent),
            _ => None,
        }
    }
}

/// Kind of audit event on a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Created,
    StatusChanged,
    Assigned,
    Note,
    Comment,
    Reply,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Created => "created",
            ActivityType::StatusChanged => "status_changed",
            ActivityType::Assigned => "assigned",
            ActivityType::Note => "note",
            ActivityType::Comment => "comment",
            ActivityType::Reply => "reply",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ActivityType::Created),
            "status_changed" => Some(ActivityType::StatusChanged),
            "assigned" => Some(ActivityType::Assigned),
            "note" => Some(ActivityType::Note),
            "comment" => Some(ActivityType::Comment),
            "reply" => Some(ActivityType::Reply),
            _ => None,
        }
    }
}

/// Outcome recorded in the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    Created,
    Updated,
    Skipped,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedOutcome::Created => "created",
            ProcessedOutcome::Updated => "updated",
            ProcessedOutcome::Skipped => "skipped",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(ProcessedOutcome::Created),
            "updated" => Some(ProcessedOutcome::Updated),
            "skipped" => Some(ProcessedOutcome::Skipped),
            _ => None,
        }
    }
}

/// A support ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    /// Unique ID.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Human-facing sequential number, e.g. `INC000042`. Immutable.
    pub number: String,
    /// Subject of the originating email.
    pub subject: String,
    /// Plain-text body of the originating email.
    pub body: String,
    /// Customer email address.
    pub sender_email: String,
    /// Customer display name, if the From header carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Provider id of the originating message.
    pub external_message_id: String,
    /// Normalized digest of sender + subject + body. See [`content_hash`].
    pub content_hash: String,
    /// Every inbound external message id folded into this ticket. Grows only.
    pub processed_external_ids: Vec<String>,
    /// Lifecycle status.
    pub status: TicketStatus,
    /// Current priority. Escalation only moves this up.
    pub priority: TicketPriority,
    /// Number of escalation events, starting at 1 on creation.
    pub escalation_count: i32,
    /// Unguessable token for the customer portal link. Immutable.
    pub public_token: String,
    /// When the ticket was created.
    pub created_at: DateTime<Utc>,
    /// When the ticket was last updated.
    pub updated_at: DateTime<Utc>,
    /// When the customer last replied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply_at: Option<DateTime<Utc>>,
    /// When the priority last stepped up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    /// When the ticket was resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Ticket {
    /// Create a ticket from an inbound complaint. Status starts at
    /// `Acknowledged` (the acknowledgment email goes out as part of the same
    /// pipeline pass) and the processed-id list is seeded with the
    /// originating message id.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        tenant_id: Uuid,
        number: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
        sender_email: impl Into<String>,
        sender_name: Option<String>,
        external_message_id: impl Into<String>,
        priority: TicketPriority,
    ) -> Self {
        let now = Utc::now();
        let number = number.into();
        let subject = subject.into();
        let body = body.into();
        let sender_email = sender_email.into();
        let external_message_id = external_message_id.into();
        let hash = content_hash(&sender_email, &subject, &body);
        let public_token = generate_public_token(&number);
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            number,
            subject,
            body,
            sender_email,
            sender_name,
            external_message_id: external_message_id.clone(),
            content_hash: hash,
            processed_external_ids: vec![external_message_id],
            status: TicketStatus::Acknowledged,
            priority,
            escalation_count: 1,
            public_token,
            created_at: now,
            updated_at: now,
            last_reply_at: None,
            escalated_at: None,
            resolved_at: None,
        }
    }
}

/// A customer or team comment on a ticket. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketComment {
    pub id: Uuid,
    pub ticket_id: Uuid,
    /// Team member account, when the author email matched one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_user_id: Option<Uuid>,
    /// Display name shown with the comment.
    pub author_name: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl TicketComment {
    pub fn new(
        ticket_id: Uuid,
        author_user_id: Option<Uuid>,
        author_name: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            author_user_id,
            author_name: author_name.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

/// An immutable audit event on a ticket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketActivity {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub activity_type: ActivityType,
    /// Who acted, when known. The pipeline uses the sender address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// One-line description of what happened.
    pub detail: String,
    /// Attached content, e.g. the reply text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TicketActivity {
    pub fn new(ticket_id: Uuid, activity_type: ActivityType, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ticket_id,
            activity_type,
            actor: None,
            detail: detail.into(),
            content: None,
            created_at: Utc::now(),
        }
    }

    /// Builder: set the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Builder: attach content.
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Format a ticket sequence as the human-facing number: `INC` + the sequence,
/// zero-padded to at least six digits. The width grows once a tenant passes
/// `999999`, so ordering by number must compare length before text.
pub fn format_ticket_number(seq: u32) -> String {
    format!("INC{seq:06}")
}

/// Numeric part of a ticket number, if it has the expected shape.
pub fn parse_ticket_number(number: &str) -> Option<u32> {
    let digits = number.strip_prefix("INC")?;
    if digits.len() < 6 {
        return None;
    }
    digits.parse().ok()
}

/// Portal access token: `{number}_{16 random bytes as hex}`.
pub fn generate_public_token(number: &str) -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!("{number}_{hex}")
}

/// Normalized content digest used for duplicate detection.
///
/// Sender is lowercased, the subject loses its reply prefixes and case, and
/// the body is lowercased with whitespace collapsed, so trivial re-sends and
/// quoted re-deliveries hash equal while different senders never collide on
/// identical text.
pub fn content_hash(sender_email: &str, subject: &str, body: &str) -> String {
    let sender = sender_email.trim().to_lowercase();
    let subject = strip_reply_prefixes(subject).to_lowercase();
    let body = collapse_whitespace(&body.to_lowercase());

    let mut hasher = Sha256::new();
    hasher.update(sender.as_bytes());
    hasher.update(b"\n");
    hasher.update(subject.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Remove leading `Re:` / `Fwd:` / `Fw:` prefixes (repeatedly, any case).
pub fn strip_reply_prefixes(subject: &str) -> String {
    let mut s = subject.trim();
    loop {
        let mut stripped = None;
        for prefix in ["re:", "fwd:", "fw:"] {
            if s.len() >= prefix.len()
                && s.is_char_boundary(prefix.len())
                && s[..prefix.len()].eq_ignore_ascii_case(prefix)
            {
                stripped = Some(s[prefix.len()..].trim_start());
                break;
            }
        }
        match stripped {
            Some(rest) => s = rest,
            None => break,
        }
    }
    s.to_string()
}

/// True when the subject carries a reply or forward prefix.
pub fn has_reply_prefix(subject: &str) -> bool {
    let lower = subject.trim_start().to_lowercase();
    lower.starts_with("re:") || lower.starts_with("fwd:") || lower.starts_with("fw:")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
