//! Gateway to the external complaint classifier.
//!
//! The pipeline never talks to the endpoint directly; it goes through
//! [`Classifier`], which the gateway implements with body sanitization, a
//! minimum inter-call delay, and a hard fallback: any transport or response
//! failure yields the safe verdict (Normal, no escalation). A classifier
//! outage therefore degrades to "no ticket created, no escalation" instead
//! of failing the poll cycle.

use std::time::Instant;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::{ClassifierConfig, PipelineConfig};
use crate::error::ClassifierError;
use crate::mailbox::message::strip_html;

/// What the classifier decided a message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Complaint,
    Normal,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Complaint => "complaint",
            Label::Normal => "normal",
        }
    }
}

/// Classification result for one message.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub label: Label,
    /// Endpoint confidence in `label`, 0.0 when this is a fallback.
    pub confidence: f32,
    /// True when a reply should escalate its ticket's priority.
    pub should_escalate: bool,
}

impl Verdict {
    /// The verdict used when classification is unavailable: treat the
    /// message as normal and escalate nothing.
    pub fn fallback() -> Self {
        Self {
            label: Label::Normal,
            confidence: 0.0,
            should_escalate: false,
        }
    }

    pub fn is_complaint(&self) -> bool {
        self.label == Label::Complaint
    }
}

/// Classifies one message, given whether it resolved as a reply.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
        is_reply: bool,
    ) -> Result<Verdict, ClassifierError>;
}

/// Classify with the hard fallback applied. All call sites go through this;
/// classifier errors never travel further up.
pub async fn classify_or_default(
    classifier: &dyn Classifier,
    subject: &str,
    body: &str,
    is_reply: bool,
) -> Verdict {
    match classifier.classify(subject, body, is_reply).await {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(error = %e, "Classification failed; using fallback verdict");
            Verdict::fallback()
        }
    }
}

#[derive(Debug, Serialize)]
struct ClassifyRequest<'a> {
    subject: &'a str,
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct ClassifyResponse {
    label: String,
    #[serde(default)]
    confidence: f32,
}

/// HTTP gateway to the classification endpoint.
pub struct HttpClassifier {
    config: ClassifierConfig,
    http: reqwest::Client,
    body_limit: usize,
    min_delay: std::time::Duration,
    /// Start time of the most recent request. Held across the pacing sleep
    /// so concurrent callers line up instead of bursting.
    last_call: Mutex<Option<Instant>>,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig, pipeline: &PipelineConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            body_limit: pipeline.classifier_body_limit,
            min_delay: pipeline.classifier_min_delay,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until at least `min_delay` has passed since the previous call.
    async fn pace(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        subject: &str,
        body: &str,
        is_reply: bool,
    ) -> Result<Verdict, ClassifierError> {
        self.pace().await;

        let excerpt = prepare_excerpt(body, self.body_limit);
        let request = ClassifyRequest {
            subject,
            body: &excerpt,
        };

        let mut builder = self
            .http
            .post(&self.config.endpoint_url)
            .timeout(self.config.request_timeout)
            .json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ClassifierError::Timeout
            } else {
                ClassifierError::RequestFailed(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(ClassifierError::RequestFailed(format!(
                "classifier returned {}",
                response.status()
            )));
        }

        let parsed: ClassifyResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::InvalidResponse(e.to_string()))?;

        let label = parse_label(&parsed.label)?;
        let verdict = verdict_from(label, parsed.confidence, is_reply);
        debug!(
            label = label.as_str(),
            confidence = verdict.confidence,
            should_escalate = verdict.should_escalate,
            "Message classified"
        );
        Ok(verdict)
    }
}

/// Strip markup and cut to the configured length before submitting. The
/// endpoint bills by input size; quoted novels add nothing.
pub(crate) fn prepare_excerpt(body: &str, limit: usize) -> String {
    let text = if looks_like_html(body) {
        strip_html(body)
    } else {
        body.to_string()
    };
    text.chars().take(limit).collect()
}

fn looks_like_html(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("<html") || lower.contains("<body") || lower.contains("<div") || lower.contains("<p>")
}

fn parse_label(s: &str) -> Result<Label, ClassifierError> {
    if s.eq_ignore_ascii_case("complaint") {
        Ok(Label::Complaint)
    } else if s.eq_ignore_ascii_case("normal") {
        Ok(Label::Normal)
    } else {
        Err(ClassifierError::InvalidResponse(format!(
            "unknown label: {s}"
        )))
    }
}

/// Escalation is a reply-context decision: a complaint verdict on a reply
/// steps the ticket's priority up, on a new message it only gates creation.
fn verdict_from(label: Label, confidence: f32, is_reply: bool) -> Verdict {
    Verdict {
        label,
        confidence,
        should_escalate: is_reply && label == Label::Complaint,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(
            &self,
            _subject: &str,
            _body: &str,
            _is_reply: bool,
        ) -> Result<Verdict, ClassifierError> {
            Err(ClassifierError::Timeout)
        }
    }

    #[test]
    fn fallback_is_normal_and_never_escalates() {
        let verdict = Verdict::fallback();
        assert_eq!(verdict.label, Label::Normal);
        assert!(!verdict.should_escalate);
        assert!(!verdict.is_complaint());
    }

    #[test]
    fn complaint_on_reply_escalates() {
        let verdict = verdict_from(Label::Complaint, 0.9, true);
        assert!(verdict.should_escalate);
    }

    #[test]
    fn complaint_on_new_message_does_not_escalate() {
        let verdict = verdict_from(Label::Complaint, 0.9, false);
        assert!(verdict.is_complaint());
        assert!(!verdict.should_escalate);
    }

    #[test]
    fn normal_reply_does_not_escalate() {
        let verdict = verdict_from(Label::Normal, 0.8, true);
        assert!(!verdict.should_escalate);
    }

    #[test]
    fn label_parse_tolerates_case() {
        assert_eq!(parse_label("Complaint").unwrap(), Label::Complaint);
        assert_eq!(parse_label("NORMAL").unwrap(), Label::Normal);
        assert!(parse_label("spam").is_err());
    }

    #[test]
    fn excerpt_strips_html_and_truncates() {
        let body = "<html><body><p>My order is broken.</p></body></html>";
        assert_eq!(prepare_excerpt(body, 2000), "My order is broken.");

        let long = "x".repeat(5000);
        assert_eq!(prepare_excerpt(&long, 2000).chars().count(), 2000);
    }

    #[test]
    fn plain_text_excerpt_is_untouched() {
        let body = "Comparing a < b in my code sample.";
        assert_eq!(prepare_excerpt(body, 2000), body);
    }

    #[test]
    fn response_deserializes() {
        let parsed: ClassifyResponse =
            serde_json::from_str(r#"{"label":"complaint","confidence":0.93}"#).unwrap();
        assert_eq!(parsed.label, "complaint");
        assert!((parsed.confidence - 0.93).abs() < f32::EPSILON);

        // Confidence is optional.
        let parsed: ClassifyResponse = serde_json::from_str(r#"{"label":"normal"}"#).unwrap();
        assert_eq!(parsed.confidence, 0.0);
    }

    #[tokio::test]
    async fn errors_collapse_to_fallback() {
        let verdict = classify_or_default(&FailingClassifier, "subject", "body", true).await;
        assert_eq!(verdict.label, Label::Normal);
        assert!(!verdict.should_escalate);
    }
}
