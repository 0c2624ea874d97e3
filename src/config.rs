//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Interval between poll cycles per mailbox.
    pub poll_interval: Duration,
    /// Maximum messages processed per cycle per tenant.
    pub batch_size: usize,
    /// Trailing window for content-hash duplicate detection.
    pub dedup_window_days: i64,
    /// Trailing window for Re:/Fwd: reply matching.
    pub reply_window_days: i64,
    /// Trailing window for indicator-phrase reply matching.
    pub indicator_window_days: i64,
    /// Sentiment score at or below which a new ticket is high priority.
    pub sentiment_high_threshold: i32,
    /// Sentiment score at or below which a new ticket is medium priority.
    pub sentiment_medium_threshold: i32,
    /// Minimum delay between consecutive classifier calls.
    pub classifier_min_delay: Duration,
    /// Maximum characters of stripped body submitted to the classifier.
    pub classifier_body_limit: usize,
    /// Refresh OAuth tokens that expire within this margin.
    pub token_refresh_margin: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60), // 1 minute
            batch_size: 10,
            dedup_window_days: 30,
            reply_window_days: 7,
            indicator_window_days: 14,
            sentiment_high_threshold: -5,
            sentiment_medium_threshold: -2,
            classifier_min_delay: Duration::from_millis(1000),
            classifier_body_limit: 2000,
            token_refresh_margin: Duration::from_secs(300), // 5 minutes
        }
    }
}

impl PipelineConfig {
    /// Defaults overlaid with any `MAILDESK_*` environment overrides.
    /// Unparseable values are startup errors, not silent fallbacks.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(secs) = read_parsed::<u64>("MAILDESK_POLL_INTERVAL_SECS")? {
            cfg.poll_interval = Duration::from_secs(secs);
        }
        if let Some(n) = read_parsed::<usize>("MAILDESK_BATCH_SIZE")? {
            cfg.batch_size = n;
        }
        if let Some(days) = read_parsed::<i64>("MAILDESK_DEDUP_WINDOW_DAYS")? {
            cfg.dedup_window_days = days;
        }
        if let Some(days) = read_parsed::<i64>("MAILDESK_REPLY_WINDOW_DAYS")? {
            cfg.reply_window_days = days;
        }
        if let Some(days) = read_parsed::<i64>("MAILDESK_INDICATOR_WINDOW_DAYS")? {
            cfg.indicator_window_days = days;
        }
        if let Some(score) = read_parsed::<i32>("MAILDESK_SENTIMENT_HIGH")? {
            cfg.sentiment_high_threshold = score;
        }
        if let Some(score) = read_parsed::<i32>("MAILDESK_SENTIMENT_MEDIUM")? {
            cfg.sentiment_medium_threshold = score;
        }
        if let Some(ms) = read_parsed::<u64>("MAILDESK_CLASSIFIER_MIN_DELAY_MS")? {
            cfg.classifier_min_delay = Duration::from_millis(ms);
        }
        if let Some(n) = read_parsed::<usize>("MAILDESK_CLASSIFIER_BODY_LIMIT")? {
            cfg.classifier_body_limit = n;
        }
        if let Some(secs) = read_parsed::<u64>("MAILDESK_TOKEN_REFRESH_MARGIN_SECS")? {
            cfg.token_refresh_margin = Duration::from_secs(secs);
        }

        Ok(cfg)
    }
}

/// Connection details for the external classification endpoint.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub endpoint_url: String,
    pub api_key: Option<SecretString>,
    pub request_timeout: Duration,
}

impl ClassifierConfig {
    /// Load from environment. Returns `None` when no endpoint is configured.
    pub fn from_env() -> Option<Self> {
        let endpoint_url = std::env::var("MAILDESK_CLASSIFIER_URL").ok()?;
        let api_key = std::env::var("MAILDESK_CLASSIFIER_API_KEY")
            .ok()
            .map(SecretString::from);

        Some(Self {
            endpoint_url,
            api_key,
            request_timeout: Duration::from_secs(30),
        })
    }
}

fn read_parsed<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
