//! Per-message orchestration: guard, resolve, classify, mutate, record.
//!
//! One [`MessageProcessor`] serves every tenant; all tenant state arrives as
//! arguments. The order is fixed and matters:
//!
//! 1. Self-sent mail is dropped before anything else (acknowledgment loop)
//! 2. The resolution ladder runs, ledger first — a redelivered message
//!    never reaches the classifier, even when its ledger row was lost
//! 3. Only messages that still need a decision reach the classifier
//! 4. Mutations commit, then the ledger row is written, then the
//!    acknowledgment goes out
//!
//! A failure on one message is logged and skipped; the rest of the batch
//! still runs. The unwritten ledger row means the failed message is retried
//! on the next poll cycle.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::Error;
use crate::mailbox::{MailboxSource, message::RawMessage};
use crate::pipeline::ack;
use crate::pipeline::classifier::{Classifier, classify_or_default};
use crate::pipeline::engine::MutationEngine;
use crate::pipeline::resolver::{ReplyResolver, Resolution};
use crate::store::{TenantRecord, TicketStore};
use crate::tickets::events::EventBus;
use crate::tickets::model::ProcessedOutcome;

pub struct MessageProcessor {
    classifier: Arc<dyn Classifier>,
    resolver: ReplyResolver,
    engine: MutationEngine,
    config: PipelineConfig,
}

impl MessageProcessor {
    pub fn new(
        store: Arc<dyn TicketStore>,
        classifier: Arc<dyn Classifier>,
        events: EventBus,
        config: PipelineConfig,
    ) -> Self {
        let resolver = ReplyResolver::new(Arc::clone(&store), config.clone());
        let engine = MutationEngine::new(store, events, config.clone());
        Self {
            classifier,
            resolver,
            engine,
            config,
        }
    }

    /// Process one inbound message end to end.
    pub async fn process(
        &self,
        tenant: &TenantRecord,
        source: &mut dyn MailboxSource,
        message: &RawMessage,
    ) -> Result<ProcessedOutcome, Error> {
        info!(
            tenant = %tenant.id,
            external_id = %message.external_id,
            sender = %message.sender_email,
            "Processing inbound message"
        );

        // 1. Mail from the tenant's own support address is our outbound
        // traffic echoed back; ticketing it would loop forever.
        if message
            .sender_email
            .eq_ignore_ascii_case(&tenant.support_email)
        {
            debug!(sender = %message.sender_email, "Skipping self-sent message");
            self.engine
                .record_outcome(
                    tenant.id,
                    &message.external_id,
                    None,
                    ProcessedOutcome::Skipped,
                )
                .await?;
            return Ok(ProcessedOutcome::Skipped);
        }

        // 2. Resolve: ledger, then ticket references, then heuristics.
        match self.resolver.resolve(tenant.id, message).await? {
            Resolution::AlreadyProcessed(prior) => {
                info!(
                    external_id = %message.external_id,
                    outcome = prior.outcome.as_str(),
                    "Redelivered message; prior outcome stands"
                );
                Ok(prior.outcome)
            }

            Resolution::Replayed(ticket) => {
                info!(
                    ticket = %ticket.number,
                    external_id = %message.external_id,
                    "Effects already committed; restoring ledger row"
                );
                let outcome = if ticket.external_message_id == message.external_id {
                    ProcessedOutcome::Created
                } else {
                    ProcessedOutcome::Updated
                };
                self.engine
                    .record_outcome(tenant.id, &message.external_id, Some(ticket.id), outcome)
                    .await?;
                Ok(outcome)
            }

            Resolution::Duplicate(ticket) => {
                info!(ticket = %ticket.number, "Duplicate content; skipping");
                self.engine
                    .record_outcome(
                        tenant.id,
                        &message.external_id,
                        Some(ticket.id),
                        ProcessedOutcome::Skipped,
                    )
                    .await?;
                Ok(ProcessedOutcome::Skipped)
            }

            Resolution::Reply { ticket, matched_by } => {
                debug!(
                    ticket = %ticket.number,
                    matched_by = matched_by.as_str(),
                    "Message resolved as reply"
                );
                // 3. Classify in reply context; a complaint verdict
                // escalates the ticket.
                let verdict = classify_or_default(
                    self.classifier.as_ref(),
                    &message.subject,
                    &message.body,
                    true,
                )
                .await;
                let updated = self
                    .engine
                    .append_reply(tenant, ticket.id, message, verdict.should_escalate)
                    .await?;
                self.engine
                    .record_outcome(
                        tenant.id,
                        &message.external_id,
                        Some(updated.id),
                        ProcessedOutcome::Updated,
                    )
                    .await?;
                // 4. Escalations are acknowledged; routine replies are not.
                if verdict.should_escalate {
                    ack::dispatch_acknowledgment(source, tenant, &updated).await;
                }
                Ok(ProcessedOutcome::Updated)
            }

            Resolution::New => {
                // 3. Classify as a fresh message; only complaints open
                // tickets.
                let verdict = classify_or_default(
                    self.classifier.as_ref(),
                    &message.subject,
                    &message.body,
                    false,
                )
                .await;
                if !verdict.is_complaint() {
                    info!(
                        label = verdict.label.as_str(),
                        "Message is not a complaint; skipping"
                    );
                    self.engine
                        .record_outcome(
                            tenant.id,
                            &message.external_id,
                            None,
                            ProcessedOutcome::Skipped,
                        )
                        .await?;
                    return Ok(ProcessedOutcome::Skipped);
                }

                let ticket = self.engine.create_ticket(tenant, message).await?;
                self.engine
                    .record_outcome(
                        tenant.id,
                        &message.external_id,
                        Some(ticket.id),
                        ProcessedOutcome::Created,
                    )
                    .await?;
                // 4. Acknowledge the new ticket.
                ack::dispatch_acknowledgment(source, tenant, &ticket).await;
                Ok(ProcessedOutcome::Created)
            }
        }
    }

    /// Process one poll cycle's worth of messages, oldest first, bounded by
    /// the configured batch size. Returns how many were handled.
    pub async fn process_batch(
        &self,
        tenant: &TenantRecord,
        source: &mut dyn MailboxSource,
        messages: Vec<RawMessage>,
    ) -> usize {
        let total = messages.len();
        if total > self.config.batch_size {
            debug!(
                total,
                limit = self.config.batch_size,
                "Batch over limit; remainder arrives next cycle"
            );
        }

        let mut processed = 0usize;
        for message in messages.iter().take(self.config.batch_size) {
            match self.process(tenant, source, message).await {
                Ok(_) => {
                    processed += 1;
                    // Provider-side state is best-effort; the ledger is the
                    // source of truth for "already handled".
                    if let Err(e) = source.mark_processed(&message.external_id).await {
                        warn!(
                            external_id = %message.external_id,
                            error = %e,
                            "Could not mark message processed at provider"
                        );
                    }
                }
                Err(e) => {
                    error!(
                        external_id = %message.external_id,
                        error = %e,
                        "Failed to process message; will retry next cycle"
                    );
                }
            }
        }

        info!(processed, total, "Poll cycle batch complete");
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use crate::error::{ClassifierError, MailboxError};
    use crate::mailbox::OutboundMessage;
    use crate::pipeline::classifier::{Label, Verdict};
    use crate::store::LibSqlStore;

    /// Mailbox double that records what the processor sends and marks.
    #[derive(Default)]
    struct MockSource {
        sent: Vec<OutboundMessage>,
        marked: Vec<String>,
    }

    #[async_trait]
    impl MailboxSource for MockSource {
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

    /// Classifier double with a fixed label and a call counter.
    struct MockClassifier {
        label: Label,
        calls: AtomicUsize,
    }

    impl MockClassifier {
        fn complaint() -> Self {
            Self {
                label: Label::Complaint,
                calls: AtomicUsize::new(0),
            }
        }

        fn normal() -> Self {
            Self {
                label: Label::Normal,
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Classifier for MockClassifier {
        async fn classify(
            &self,
            _subject: &str,
            _body: &str,
            is_reply: bool,
        ) -> Result<Verdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Verdict {
                label: self.label,
                confidence: 0.9,
                should_escalate: is_reply && self.label == Label::Complaint,
            })
        }
    }

    struct Fixture {
        store: Arc<dyn TicketStore>,
        classifier: Arc<MockClassifier>,
        processor: MessageProcessor,
        tenant: TenantRecord,
    }

    async fn setup(classifier: MockClassifier) -> Fixture {
        setup_with_config(classifier, PipelineConfig::default()).await
    }

    async fn setup_with_config(classifier: MockClassifier, config: PipelineConfig) -> Fixture {
        let store: Arc<dyn TicketStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let tenant = TenantRecord {
            id: Uuid::new_v4(),
            name: "Acme".into(),
            support_email: "support@acme.test".into(),
            portal_enabled: false,
            portal_base_url: None,
            ack_template: None,
            created_at: Utc::now(),
        };
        store.insert_tenant(&tenant).await.unwrap();
        let classifier = Arc::new(classifier);
        let processor = MessageProcessor::new(
            Arc::clone(&store),
            Arc::clone(&classifier) as Arc<dyn Classifier>,
            EventBus::new(),
            config,
        );
        Fixture {
            store,
            classifier,
            processor,
            tenant,
        }
    }

    fn message(external_id: &str, from: &str, subject: &str, body: &str) -> RawMessage {
        RawMessage {
            external_id: external_id.into(),
            subject: subject.into(),
            sender_email: from.into(),
            sender_name: None,
            body: body.into(),
            html_body: None,
            received_at: Utc::now(),
            thread_id: None,
        }
    }

    #[tokio::test]
    async fn self_sent_mail_is_skipped_without_classification() {
        let fx = setup(MockClassifier::complaint()).await;
        let mut source = MockSource::default();

        let outcome = fx
            .processor
            .process(
                &fx.tenant,
                &mut source,
                &message("m1", "Support@Acme.test", "Re: your ticket", "ack text"),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ProcessedOutcome::Skipped);
        assert_eq!(fx.classifier.call_count(), 0);
        assert!(fx.store.is_processed(fx.tenant.id, "m1").await.unwrap());
        assert_eq!(
            fx.store.latest_ticket_number(fx.tenant.id).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn normal_mail_is_recorded_but_opens_nothing() {
        let fx = setup(MockClassifier::normal()).await;
        let mut source = MockSource::default();

        let outcome = fx
            .processor
            .process(
                &fx.tenant,
                &mut source,
                &message(
                    "m1",
                    "jane@example.com",
                    "Quick question",
                    "What are your opening hours?",
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ProcessedOutcome::Skipped);
        assert_eq!(fx.classifier.call_count(), 1);
        assert!(fx.store.is_processed(fx.tenant.id, "m1").await.unwrap());
        assert_eq!(
            fx.store.latest_ticket_number(fx.tenant.id).await.unwrap(),
            None
        );
        assert!(source.sent.is_empty());
    }

    #[tokio::test]
    async fn complaint_creates_ticket_and_acknowledges() {
        let fx = setup(MockClassifier::complaint()).await;
        let mut source = MockSource::default();

        let handled = fx
            .processor
            .process_batch(
                &fx.tenant,
                &mut source,
                vec![message(
                    "m1",
                    "jane@example.com",
                    "Order broken",
                    "My order arrived broken.",
                )],
            )
            .await;

        assert_eq!(handled, 1);
        let ticket = fx
            .store
            .get_ticket_by_number(fx.tenant.id, "INC000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.sender_email, "jane@example.com");

        // Acknowledgment went out and the provider was told.
        assert_eq!(source.sent.len(), 1);
        assert!(source.sent[0].subject.contains("INC000001"));
        assert_eq!(source.marked, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn redelivery_reuses_outcome_without_classifying() {
        let fx = setup(MockClassifier::complaint()).await;
        let mut source = MockSource::default();
        let msg = message(
            "m1",
            "jane@example.com",
            "Order broken",
            "It arrived broken.",
        );

        let first = fx
            .processor
            .process(&fx.tenant, &mut source, &msg)
            .await
            .unwrap();
        assert_eq!(first, ProcessedOutcome::Created);
        assert_eq!(fx.classifier.call_count(), 1);

        let second = fx
            .processor
            .process(&fx.tenant, &mut source, &msg)
            .await
            .unwrap();
        assert_eq!(second, ProcessedOutcome::Created);
        // No second classification, no second ticket, no second ack.
        assert_eq!(fx.classifier.call_count(), 1);
        assert_eq!(
            fx.store.latest_ticket_number(fx.tenant.id).await.unwrap(),
            Some("INC000001".to_string())
        );
        assert_eq!(source.sent.len(), 1);
    }

    #[tokio::test]
    async fn escalating_reply_is_acknowledged() {
        let fx = setup(MockClassifier::complaint()).await;
        let mut source = MockSource::default();

        fx.processor
            .process(
                &fx.tenant,
                &mut source,
                &message(
                    "m1",
                    "jane@example.com",
                    "Order broken",
                    "It arrived broken.",
                ),
            )
            .await
            .unwrap();

        let outcome = fx
            .processor
            .process(
                &fx.tenant,
                &mut source,
                &message(
                    "m2",
                    "jane@example.com",
                    "Re: [INC000001] Order broken",
                    "A week later and still no replacement.",
                ),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ProcessedOutcome::Updated);
        let ticket = fx
            .store
            .get_ticket_by_number(fx.tenant.id, "INC000001")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.escalation_count, 2);
        // One ack for creation, one for the escalation.
        assert_eq!(source.sent.len(), 2);
    }

    #[tokio::test]
    async fn batch_respects_configured_limit() {
        let config = PipelineConfig {
            batch_size: 2,
            ..PipelineConfig::default()
        };
        let fx = setup_with_config(MockClassifier::normal(), config).await;
        let mut source = MockSource::default();

        let handled = fx
            .processor
            .process_batch(
                &fx.tenant,
                &mut source,
                vec![
                    message("m1", "a@example.com", "One", "First."),
                    message("m2", "b@example.com", "Two", "Second."),
                    message("m3", "c@example.com", "Three", "Third."),
                ],
            )
            .await;

        assert_eq!(handled, 2);
        // The third message was not touched; it returns next cycle.
        assert!(!fx.store.is_processed(fx.tenant.id, "m3").await.unwrap());
        assert_eq!(source.marked.len(), 2);
    }
}
