//! Deterministic sentiment scoring for initial ticket priority.
//!
//! Runs at creation time only; replies change priority through escalation,
//! never through re-scoring. The score is a weighted count of negative terms
//! in the subject and body, mapped to a priority by the configured
//! thresholds. No network, no model: the same message always gets the same
//! priority.

use crate::config::PipelineConfig;
use crate::tickets::model::TicketPriority;

/// Mildly negative: something is off, but the tone is neutral.
const MILD_TERMS: &[&str] = &["problem", "issue", "slow", "delay", "waiting", "confused"];

/// Clearly negative: something is broken or went wrong.
const NEGATIVE_TERMS: &[&str] = &[
    "broken", "failed", "wrong", "missing", "damaged", "error", "not working", "refund",
];

/// Strongly negative: the customer is angry.
const STRONG_TERMS: &[&str] = &[
    "terrible",
    "awful",
    "unacceptable",
    "furious",
    "worst",
    "scam",
    "disgusted",
    "ridiculous",
];

/// Weighted negative-term count over subject and body. Zero or below;
/// more negative means angrier. Each occurrence counts, so "broken ...
/// broken" scores lower than a single mention.
pub fn score(subject: &str, body: &str) -> i32 {
    let text = format!("{subject}\n{body}").to_lowercase();
    let mut score = 0i32;
    for term in MILD_TERMS {
        score -= text.matches(term).count() as i32;
    }
    for term in NEGATIVE_TERMS {
        score -= 2 * text.matches(term).count() as i32;
    }
    for term in STRONG_TERMS {
        score -= 3 * text.matches(term).count() as i32;
    }
    score
}

/// Map a score to the priority a new ticket starts at.
pub fn priority_for(score: i32, config: &PipelineConfig) -> TicketPriority {
    if score < config.sentiment_high_threshold {
        TicketPriority::High
    } else if score < config.sentiment_medium_threshold {
        TicketPriority::Medium
    } else {
        TicketPriority::Low
    }
}

/// Score a message and map it in one step.
pub fn initial_priority(subject: &str, body: &str, config: &PipelineConfig) -> TicketPriority {
    priority_for(score(subject, body), config)
}
