//! Ticket mutations driven by the pipeline.
//!
//! All writes that follow a resolution funnel through here: creating a
//! ticket, folding a reply into one, and recording the ledger outcome.
//! Every mutating path ends with one published [`TicketEvent`] and one
//! notification row per team member.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{Error, PipelineError, StoreError};
use crate::mailbox::message::{RawMessage, strip_quoted_text};
use crate::pipeline::sentiment;
use crate::store::{NotificationRecord, ProcessedEmail, TenantRecord, TicketStore};
use crate::tickets::events::{EventBus, TicketEvent};
use crate::tickets::model::{
    ActivityType, ProcessedOutcome, Ticket, TicketActivity, TicketComment, format_ticket_number,
    parse_ticket_number,
};

/// How many ticket numbers to try before giving up. Collisions only happen
/// when another worker allocates concurrently, so one or two retries is the
/// realistic worst case.
const MAX_NUMBER_ATTEMPTS: u32 = 5;

pub struct MutationEngine {
    store: Arc<dyn TicketStore>,
    events: EventBus,
    config: PipelineConfig,
}

impl MutationEngine {
    pub fn new(store: Arc<dyn TicketStore>, events: EventBus, config: PipelineConfig) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Open a ticket for a new complaint.
    ///
    /// The number comes from the tenant's current maximum plus one; the
    /// unique index on (tenant, number) arbitrates races, and a conflict
    /// moves to the next candidate. Initial priority comes from the
    /// sentiment score of the message.
    pub async fn create_ticket(
        &self,
        tenant: &TenantRecord,
        message: &RawMessage,
    ) -> Result<Ticket, Error> {
        // The stored body is quote-stripped; the content hash and the
        // duplicate lookup must see the same bytes.
        let body = strip_quoted_text(&message.body);
        let priority = sentiment::initial_priority(&message.subject, &body, &self.config);

        let mut seq = match self
            .store
            .latest_ticket_number(tenant.id)
            .await?
            .as_deref()
            .and_then(parse_ticket_number)
        {
            Some(latest) => latest + 1,
            None => 1,
        };

        for _ in 0..MAX_NUMBER_ATTEMPTS {
            let number = format_ticket_number(seq);
            let ticket = Ticket::new(
                tenant.id,
                &number,
                &message.subject,
                &body,
                &message.sender_email,
                message.sender_name.clone(),
                &message.external_id,
                priority,
            );

            match self.store.insert_ticket(&ticket).await {
                Ok(()) => {
                    let activity = TicketActivity::new(
                        ticket.id,
                        ActivityType::Created,
                        format!("Ticket created with {} priority", priority.as_str()),
                    )
                    .with_actor(&message.sender_email);
                    self.store.append_activity(&activity).await?;

                    info!(
                        tenant = %tenant.id,
                        ticket = %ticket.number,
                        priority = priority.as_str(),
                        "Ticket created"
                    );
                    self.emit(TicketEvent::Created {
                        tenant_id: tenant.id,
                        ticket_id: ticket.id,
                        number: ticket.number.clone(),
                        subject: ticket.subject.clone(),
                        priority,
                        at: ticket.created_at,
                    })
                    .await;
                    return Ok(ticket);
                }
                Err(StoreError::Conflict(constraint)) => {
                    debug!(
                        number = %number,
                        constraint = %constraint,
                        "Ticket number taken; trying next"
                    );
                    seq += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PipelineError::NumberExhausted {
            attempts: MAX_NUMBER_ATTEMPTS,
        }
        .into())
    }

    /// Fold a customer reply into an existing ticket.
    ///
    /// Escalation steps the priority up once (Urgent is the ceiling) and
    /// bumps the escalation count. Either way the reply becomes a comment
    /// and an audit activity, and the message id joins the ticket's
    /// processed set. A message the ticket already carries is a redelivery
    /// and changes nothing.
    pub async fn append_reply(
        &self,
        tenant: &TenantRecord,
        ticket_id: Uuid,
        message: &RawMessage,
        escalate: bool,
    ) -> Result<Ticket, Error> {
        let mut ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "ticket",
                id: ticket_id.to_string(),
            })?;

        // Running the effects twice for one message would double the
        // comment and the escalation.
        if ticket.processed_external_ids.contains(&message.external_id) {
            debug!(
                ticket = %ticket.number,
                external_id = %message.external_id,
                "Reply already folded in; skipping"
            );
            return Ok(ticket);
        }

        let now = Utc::now();
        if escalate {
            ticket.priority = ticket.priority.escalated();
            ticket.escalation_count += 1;
            ticket.escalated_at = Some(now);
        }
        ticket.last_reply_at = Some(now);
        self.store.update_ticket(&ticket).await?;

        self.store
            .add_processed_id(ticket.id, &message.external_id)
            .await?;
        if !ticket.processed_external_ids.contains(&message.external_id) {
            ticket
                .processed_external_ids
                .push(message.external_id.clone());
        }

        // A reply that is all quotation still deserves an audit trail;
        // keep the raw text when stripping leaves nothing.
        let stripped = strip_quoted_text(&message.body);
        let body = if stripped.is_empty() {
            message.body.trim().to_string()
        } else {
            stripped
        };

        let (author_user_id, author_name) = match self
            .store
            .get_user_by_email(tenant.id, &message.sender_email)
            .await?
        {
            Some(user) => (Some(user.id), user.display_name),
            None => (None, message.display_name().to_string()),
        };
        let comment = TicketComment::new(ticket.id, author_user_id, author_name, &body);
        self.store.append_comment(&comment).await?;

        let detail = if escalate {
            format!(
                "Customer replied; priority escalated to {}",
                ticket.priority.as_str()
            )
        } else {
            "Customer replied".to_string()
        };
        let activity = TicketActivity::new(ticket.id, ActivityType::Reply, detail)
            .with_actor(&message.sender_email)
            .with_content(&body);
        self.store.append_activity(&activity).await?;

        info!(
            ticket = %ticket.number,
            escalated = escalate,
            priority = ticket.priority.as_str(),
            "Reply appended"
        );
        let event = if escalate {
            TicketEvent::Escalated {
                tenant_id: tenant.id,
                ticket_id: ticket.id,
                number: ticket.number.clone(),
                priority: ticket.priority,
                escalation_count: ticket.escalation_count,
                at: now,
            }
        } else {
            TicketEvent::Reply {
                tenant_id: tenant.id,
                ticket_id: ticket.id,
                number: ticket.number.clone(),
                at: now,
            }
        };
        self.emit(event).await;

        Ok(ticket)
    }

    /// Write the idempotency-ledger row for a handled message. A conflict
    /// means a concurrent worker already recorded it; the effects are
    /// durable either way, so that is success.
    pub async fn record_outcome(
        &self,
        tenant_id: Uuid,
        external_id: &str,
        ticket_id: Option<Uuid>,
        outcome: ProcessedOutcome,
    ) -> Result<(), StoreError> {
        let record = ProcessedEmail::new(tenant_id, external_id, ticket_id, outcome);
        match self.store.record_processed(&record).await {
            Ok(()) => Ok(()),
            Err(StoreError::Conflict(_)) => {
                debug!(external_id, "Ledger row already present");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish an event and write its notification rows. Fan-out failures
    /// are logged and dropped: the mutation already committed.
    async fn emit(&self, event: TicketEvent) {
        if let Err(e) = self.fan_out(&event).await {
            warn!(ticket = %event.number(), error = %e, "Notification fan-out failed");
        }
        self.events.publish(event);
    }

    async fn fan_out(&self, event: &TicketEvent) -> Result<(), StoreError> {
        let users = self.store.list_users(event.tenant_id()).await?;
        let body = event.feed_text();
        for user in &users {
            let row = NotificationRecord::new(
                event.tenant_id(),
                user.id,
                Some(event.ticket_id()),
                body.clone(),
            );
            self.store.insert_notification(&row).await?;
        }
        if !users.is_empty() {
            debug!(
                recipients = users.len(),
                ticket = %event.number(),
                "Notifications written"
            );
        }
        Ok(())
    }
}
