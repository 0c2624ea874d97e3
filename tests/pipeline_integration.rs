//! Integration tests for the ingestion pipeline.
//!
//! Each test wires a real [`MessageProcessor`] to an in-memory libSQL store
//! and drives it through the public API, checking tickets, comments,
//! activities, the idempotency ledger, notifications, and outbound
//! acknowledgments together.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use maildesk::config::PipelineConfig;
use maildesk::error::{ClassifierError, MailboxError};
use maildesk::mailbox::{MailboxSource, OutboundMessage, RawMessage};
use maildesk::pipeline::{Classifier, Label, MessageProcessor, Verdict};
use maildesk::store::{LibSqlStore, TenantRecord, TicketStore, UserRecord};
use maildesk::tickets::{
    ActivityType, EventBus, ProcessedOutcome, TicketEvent, TicketPriority, TicketStatus,
};

/// Stub classifier with a fixed label (no real endpoint calls).
struct StubClassifier {
    label: Label,
}

#[async_trait]
impl Classifier for StubClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body: &str,
        is_reply: bool,
    ) -> Result<Verdict, ClassifierError> {
        Ok(Verdict {
            label: self.label,
            confidence: 0.95,
            should_escalate: is_reply && self.label == Label::Complaint,
        })
    }
}

/// Classifier that always fails, as if the endpoint were down.
struct OutageClassifier;

#[async_trait]
impl Classifier for OutageClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body: &str,
        _is_reply: bool,
    ) -> Result<Verdict, ClassifierError> {
        Err(ClassifierError::Timeout)
    }
}

/// Mailbox double recording outbound sends and provider-side marks.
#[derive(Default)]
struct StubMailbox {
    sent: Vec<OutboundMessage>,
    marked: Vec<String>,
}

#[async_trait]
impl MailboxSource for StubMailbox {
    async fn connect(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }
    async fn disconnect(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }
    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError> {
        Ok(Vec::new())
    }
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MailboxError> {
        self.sent.push(message.clone());
        Ok(())
    }
    async fn mark_processed(&mut self, external_id: &str) -> Result<(), MailboxError> {
        self.marked.push(external_id.to_string());
        Ok(())
    }
    fn is_connected(&self) -> bool {
        true
    }
}

struct Pipeline {
    store: Arc<dyn TicketStore>,
    processor: MessageProcessor,
    events: EventBus,
    tenant: TenantRecord,
}

/// Wire a processor to a fresh in-memory store with one portal-enabled
/// tenant and two team members.
async fn pipeline_with(classifier: Arc<dyn Classifier>) -> Pipeline {
    let store: Arc<dyn TicketStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let tenant = TenantRecord {
        id: Uuid::new_v4(),
        name: "Acme".into(),
        support_email: "support@acme.test".into(),
        portal_enabled: true,
        portal_base_url: Some("https://portal.acme.test/".into()),
        ack_template: None,
        created_at: Utc::now(),
    };
    store.insert_tenant(&tenant).await.unwrap();
    for (email, name) in [
        ("sam@acme.test", "Sam Ellis"),
        ("rita@acme.test", "Rita Okafor"),
    ] {
        let user = UserRecord {
            id: Uuid::new_v4(),
            tenant_id: tenant.id,
            email: email.into(),
            display_name: name.into(),
            created_at: Utc::now(),
        };
        store.insert_user(&user).await.unwrap();
    }
    let events = EventBus::new();
    let processor = MessageProcessor::new(
        Arc::clone(&store),
        classifier,
        events.clone(),
        PipelineConfig::default(),
    );
    Pipeline {
        store,
        processor,
        events,
        tenant,
    }
}

async fn complaint_pipeline() -> Pipeline {
    pipeline_with(Arc::new(StubClassifier {
        label: Label::Complaint,
    }))
    .await
}

/// Helper: build an inbound message.
fn inbound(external_id: &str, from: &str, subject: &str, body: &str) -> RawMessage {
    RawMessage {
        external_id: external_id.into(),
        subject: subject.into(),
        sender_email: from.into(),
        sender_name: Some("Jane Doe".into()),
        body: body.into(),
        html_body: None,
        received_at: Utc::now(),
        thread_id: None,
    }
}

// ── Creation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn complaint_lifecycle_end_to_end() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();
    let mut rx = pipe.events.subscribe();

    let outcome = pipe
        .processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Terrible service",
                "This is terrible and completely unacceptable. The product arrived broken.",
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ProcessedOutcome::Created);

    // Ticket with sentiment-derived priority.
    let ticket = pipe
        .store
        .get_ticket_by_number(pipe.tenant.id, "INC000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Acknowledged);
    assert_eq!(ticket.priority, TicketPriority::High);
    assert_eq!(ticket.sender_name.as_deref(), Some("Jane Doe"));

    // Acknowledgment with the portal link for this ticket.
    assert_eq!(mailbox.sent.len(), 1);
    let ack = &mailbox.sent[0];
    assert_eq!(ack.to, "jane@example.com");
    assert_eq!(ack.subject, "Re: Terrible service [INC000001]");
    assert!(ack.body.contains("Jane Doe"));
    assert!(
        ack.body
            .contains(&format!("https://portal.acme.test/tickets/{}", ticket.public_token))
    );
    assert_eq!(ack.in_reply_to.as_deref(), Some("m1"));

    // Audit trail starts with the creation entry.
    let activities = pipe.store.activities_for_ticket(ticket.id).await.unwrap();
    assert_eq!(activities.len(), 1);
    assert_eq!(activities[0].activity_type, ActivityType::Created);

    // Every team member got a feed row.
    for user in pipe.store.list_users(pipe.tenant.id).await.unwrap() {
        let feed = pipe.store.notifications_for_user(user.id, 10).await.unwrap();
        assert_eq!(feed.len(), 1);
        assert!(feed[0].body.starts_with("New ticket INC000001"));
        assert_eq!(feed[0].ticket_id, Some(ticket.id));
    }

    // The live stream saw the same creation.
    let event = rx.try_recv().unwrap();
    assert!(matches!(event, TicketEvent::Created { .. }));
    assert_eq!(event.number(), "INC000001");
}

#[tokio::test]
async fn same_text_from_different_senders_opens_two_tickets() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();

    for (id, from) in [("m1", "jane@example.com"), ("m2", "bob@example.com")] {
        let outcome = pipe
            .processor
            .process(
                &pipe.tenant,
                &mut mailbox,
                &inbound(id, from, "Refund please", "The item is broken, I want a refund."),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ProcessedOutcome::Created);
    }

    assert_eq!(
        pipe.store.latest_ticket_number(pipe.tenant.id).await.unwrap(),
        Some("INC000002".to_string())
    );
}

// ── Replies ──────────────────────────────────────────────────────────

#[tokio::test]
async fn reply_escalates_priority_and_notifies_team() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();

    pipe.processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Order update",
                "Where is my order? It was due last week.",
            ),
        )
        .await
        .unwrap();

    let outcome = pipe
        .processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m2",
                "jane@example.com",
                "Re: Order update [INC000001]",
                "A week has passed and nothing has moved.",
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ProcessedOutcome::Updated);

    let ticket = pipe
        .store
        .get_ticket_by_number(pipe.tenant.id, "INC000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.priority, TicketPriority::Medium); // stepped up from Low
    assert_eq!(ticket.escalation_count, 2);
    assert!(ticket.last_reply_at.is_some());
    assert!(
        ticket
            .processed_external_ids
            .iter()
            .any(|id| id == "m2")
    );

    // The reply text landed as a customer comment and a Reply activity.
    let comments = pipe.store.comments_for_ticket(ticket.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    assert_eq!(comments[0].author_name, "Jane Doe");
    assert!(comments[0].author_user_id.is_none());

    let activities = pipe.store.activities_for_ticket(ticket.id).await.unwrap();
    assert_eq!(activities.last().unwrap().activity_type, ActivityType::Reply);
    assert!(
        activities
            .last()
            .unwrap()
            .content
            .as_deref()
            .unwrap()
            .contains("nothing has moved")
    );

    // One ack for creation, one for the escalation; two feed rows per user.
    assert_eq!(mailbox.sent.len(), 2);
    for user in pipe.store.list_users(pipe.tenant.id).await.unwrap() {
        let feed = pipe.store.notifications_for_user(user.id, 10).await.unwrap();
        assert_eq!(feed.len(), 2);
        assert!(feed[0].body.contains("escalated to medium"));
    }
}

#[tokio::test]
async fn indicator_phrase_resolves_reply_without_subject_marker() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();

    pipe.processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Broken charger",
                "The charger arrived broken.",
            ),
        )
        .await
        .unwrap();

    // Fresh subject, no ticket number, no Re: prefix — the body phrase alone
    // ties it back to the open ticket.
    let outcome = pipe
        .processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m2",
                "jane@example.com",
                "Any update on my order",
                "I am still waiting to hear back from someone.",
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ProcessedOutcome::Updated);

    let ticket = pipe
        .store
        .get_ticket_by_number(pipe.tenant.id, "INC000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.escalation_count, 2);
    assert_eq!(
        pipe.store.comments_for_ticket(ticket.id).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn team_member_reply_is_attributed_to_account() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();

    pipe.processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Wrong item",
                "You sent the wrong item.",
            ),
        )
        .await
        .unwrap();

    let mut agent_reply = inbound(
        "m2",
        "sam@acme.test",
        "Re: Wrong item [INC000001]",
        "Looking into this now.",
    );
    agent_reply.sender_name = Some("Sam".into());
    pipe.processor
        .process(&pipe.tenant, &mut mailbox, &agent_reply)
        .await
        .unwrap();

    let ticket = pipe
        .store
        .get_ticket_by_number(pipe.tenant.id, "INC000001")
        .await
        .unwrap()
        .unwrap();
    let comments = pipe.store.comments_for_ticket(ticket.id).await.unwrap();
    assert_eq!(comments.len(), 1);
    // Matched by email to the team account, attributed by display name.
    assert!(comments[0].author_user_id.is_some());
    assert_eq!(comments[0].author_name, "Sam Ellis");
}

// ── Suppression ──────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_content_is_skipped_with_ticket_pointer() {
    let pipe = complaint_pipeline().await;
    let mut mailbox = StubMailbox::default();

    pipe.processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Missing parts",
                "Two parts are missing from the box.",
            ),
        )
        .await
        .unwrap();

    // Same sender and text under a new provider id, as resent mail arrives.
    let outcome = pipe
        .processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m2",
                "jane@example.com",
                "Missing parts",
                "Two parts are missing from the box.",
            ),
        )
        .await
        .unwrap();
    assert_eq!(outcome, ProcessedOutcome::Skipped);

    let ticket = pipe
        .store
        .get_ticket_by_number(pipe.tenant.id, "INC000001")
        .await
        .unwrap()
        .unwrap();
    let ledger = pipe
        .store
        .get_processed(pipe.tenant.id, "m2")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ledger.outcome, ProcessedOutcome::Skipped);
    assert_eq!(ledger.ticket_id, Some(ticket.id));

    // No second ticket, no second acknowledgment.
    assert_eq!(
        pipe.store.latest_ticket_number(pipe.tenant.id).await.unwrap(),
        Some("INC000001".to_string())
    );
    assert_eq!(mailbox.sent.len(), 1);
}

#[tokio::test]
async fn classifier_outage_falls_back_to_normal() {
    let pipe = pipeline_with(Arc::new(OutageClassifier)).await;
    let mut mailbox = StubMailbox::default();

    let outcome = pipe
        .processor
        .process(
            &pipe.tenant,
            &mut mailbox,
            &inbound(
                "m1",
                "jane@example.com",
                "Terrible experience",
                "This is unacceptable.",
            ),
        )
        .await
        .unwrap();

    // The fallback verdict never opens a ticket, but the message is still
    // recorded as handled.
    assert_eq!(outcome, ProcessedOutcome::Skipped);
    assert_eq!(
        pipe.store.latest_ticket_number(pipe.tenant.id).await.unwrap(),
        None
    );
    assert!(pipe.store.is_processed(pipe.tenant.id, "m1").await.unwrap());
    assert!(mailbox.sent.is_empty());
}
