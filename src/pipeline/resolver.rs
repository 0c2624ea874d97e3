//! Duplicate and reply resolution for inbound messages.
//!
//! Every message lands in exactly one bucket, decided by an ordered ladder
//! with first match winning:
//!
//! 1. Idempotency ledger hit → already processed, reuse the prior outcome
//! 2. A ticket already carries the external id → effects committed, only
//!    the ledger row is missing; restore it without touching the ticket
//! 3. Explicit ticket number in the subject → reply to that ticket
//! 4. Content hash matches a recent ticket → duplicate delivery, skip
//! 5. Re:/Fwd: subject + recent open ticket from the sender → reply
//! 6. Reply-indicator phrase + recent open ticket from the sender → reply
//! 7. Otherwise → new message
//!
//! The ladder runs before classification, so a redelivered or duplicate
//! message never spends a classifier call.

use std::sync::{Arc, LazyLock};

use chrono::{Duration, Utc};
use regex::Regex;
use tracing::debug;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::mailbox::message::{RawMessage, strip_quoted_text};
use crate::store::{ProcessedEmail, TicketStore};
use crate::tickets::model::{Ticket, content_hash, format_ticket_number, has_reply_prefix};

/// A ticket number embedded in a subject: `INC` + six or more digits, any
/// case, brackets or not. Numbers widen once a tenant outgrows the six-digit
/// padding, so the run is open-ended; parsing collapses stray leading zeros.
static TICKET_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bINC(\d{6,})\b").unwrap());

/// Body phrases that signal the customer is continuing an earlier thread
/// even without a reply prefix or ticket number.
const REPLY_INDICATORS: &[&str] = &[
    "as discussed",
    "following up",
    "still waiting",
    "no response",
    "you mentioned",
    "regarding my previous",
];

/// Which ladder rule matched a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// Explicit ticket number in the subject.
    TicketReference,
    /// Re:/Fwd: prefix plus a recent open ticket from the sender.
    SubjectPrefix,
    /// Indicator phrase plus a recent open ticket from the sender.
    ContentIndicator,
}

impl ReplyMatch {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyMatch::TicketReference => "ticket_reference",
            ReplyMatch::SubjectPrefix => "subject_prefix",
            ReplyMatch::ContentIndicator => "content_indicator",
        }
    }
}

/// Where a message landed on the ladder.
#[derive(Debug)]
pub enum Resolution {
    /// The ledger already has this external id; no effects may run again.
    AlreadyProcessed(ProcessedEmail),
    /// A ticket already carries this external id: the effects committed but
    /// the ledger row was lost. Only the row needs restoring.
    Replayed(Ticket),
    /// The message continues an existing ticket.
    Reply { ticket: Ticket, matched_by: ReplyMatch },
    /// Same sender, same content as a recent ticket. Skipped, not appended.
    Duplicate(Ticket),
    /// Nothing matched; the message is a candidate for a new ticket.
    New,
}

/// Runs the resolution ladder against the store.
pub struct ReplyResolver {
    store: Arc<dyn TicketStore>,
    config: PipelineConfig,
}

impl ReplyResolver {
    pub fn new(store: Arc<dyn TicketStore>, config: PipelineConfig) -> Self {
        Self { store, config }
    }

    /// Resolve one message. Read-only: no rule here writes anything.
    pub async fn resolve(
        &self,
        tenant_id: Uuid,
        message: &RawMessage,
    ) -> Result<Resolution, StoreError> {
        // Rule 1: idempotency ledger.
        if let Some(prior) = self
            .store
            .get_processed(tenant_id, &message.external_id)
            .await?
        {
            debug!(
                external_id = %message.external_id,
                outcome = prior.outcome.as_str(),
                "Message already in ledger"
            );
            return Ok(Resolution::AlreadyProcessed(prior));
        }

        // Rule 2: a ticket that already carries the id. This is the crash
        // window between a committed mutation and its ledger write; the
        // effects must not run a second time.
        if let Some(ticket) = self
            .store
            .find_ticket_by_external_id(tenant_id, &message.external_id)
            .await?
        {
            debug!(
                ticket = %ticket.number,
                external_id = %message.external_id,
                "Ticket already carries this message"
            );
            return Ok(Resolution::Replayed(ticket));
        }

        // Rule 3: explicit ticket number in the subject. A number that no
        // longer resolves falls through to the remaining rules.
        if let Some(number) = extract_ticket_reference(&message.subject) {
            if let Some(ticket) = self.store.get_ticket_by_number(tenant_id, &number).await? {
                debug!(ticket = %ticket.number, "Subject references ticket");
                return Ok(Resolution::Reply {
                    ticket,
                    matched_by: ReplyMatch::TicketReference,
                });
            }
            debug!(number = %number, "Subject references unknown ticket; continuing");
        }

        // Rule 4: content-hash duplicate inside the dedup window.
        let stripped = strip_quoted_text(&message.body);
        let hash = content_hash(&message.sender_email, &message.subject, &stripped);
        let since = Utc::now() - Duration::days(self.config.dedup_window_days);
        if let Some(ticket) = self
            .store
            .find_ticket_by_content_hash(tenant_id, &hash, since)
            .await?
        {
            debug!(ticket = %ticket.number, "Content duplicate of existing ticket");
            return Ok(Resolution::Duplicate(ticket));
        }

        // Rule 5: reply prefix plus a recent open ticket from this sender.
        if has_reply_prefix(&message.subject) {
            let since = Utc::now() - Duration::days(self.config.reply_window_days);
            if let Some(ticket) = self
                .store
                .find_open_ticket_by_sender(tenant_id, &message.sender_email, since)
                .await?
            {
                debug!(ticket = %ticket.number, "Reply prefix matched open ticket");
                return Ok(Resolution::Reply {
                    ticket,
                    matched_by: ReplyMatch::SubjectPrefix,
                });
            }
        }

        // Rule 6: indicator phrase plus a recent open ticket. Wider window
        // than rule 5: follow-ups arrive later than direct replies.
        if contains_reply_indicator(&message.body) {
            let since = Utc::now() - Duration::days(self.config.indicator_window_days);
            if let Some(ticket) = self
                .store
                .find_open_ticket_by_sender(tenant_id, &message.sender_email, since)
                .await?
            {
                debug!(ticket = %ticket.number, "Indicator phrase matched open ticket");
                return Ok(Resolution::Reply {
                    ticket,
                    matched_by: ReplyMatch::ContentIndicator,
                });
            }
        }

        Ok(Resolution::New)
    }
}

/// Extract a normalized ticket number (`INC` + at least six digits,
/// uppercased, zero padding collapsed) from a subject line, tolerating
/// brackets and case.
pub fn extract_ticket_reference(subject: &str) -> Option<String> {
    TICKET_REFERENCE
        .captures(subject)
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse::<u32>().ok())
        .map(format_ticket_number)
}

/// True when the body carries a phrase customers use to continue a thread.
pub fn contains_reply_indicator(body: &str) -> bool {
    let lower = body.to_lowercase();
    REPLY_INDICATORS.iter().any(|phrase| lower.contains(phrase))
}
