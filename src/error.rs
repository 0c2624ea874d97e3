//! Error types for the maildesk pipeline.
//!
//! Each domain gets its own enum; the top-level [`Error`] aggregates them for
//! callers that cross domain boundaries. Errors local to one message or one
//! poll cycle are handled where they occur and never bubble to process level.

use thiserror::Error;

/// Errors raised while loading configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {key}")]
    MissingKey { key: String },

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Errors from the ticket store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("migration failed: {0}")]
    Migration(String),

    /// A unique constraint rejected the write. Expected under concurrent
    /// ticket-number allocation and ledger double-insert; callers retry with
    /// the next candidate or treat the row as already present.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
}

/// Errors from a mailbox backend (IMAP session or mail API).
///
/// All variants are fatal for the current poll cycle only; the poller logs
/// them and retries on the next tick.
#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("connection to {host} timed out")]
    Timeout { host: String },

    #[error("cannot reach {host}: {reason}")]
    HostUnreachable { host: String, reason: String },

    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    /// The access token was rejected as expired. Distinguished from
    /// [`MailboxError::AuthFailed`] so the caller can refresh and retry once
    /// instead of giving up on the credential.
    #[error("access token expired")]
    AuthExpired,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("message parse failed: {0}")]
    Parse(String),

    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    #[error("mailbox is not connected")]
    NotConnected,
}

/// Errors from the external classification endpoint.
///
/// The gateway converts every one of these into a fallback verdict; they are
/// never visible above the classifier module.
#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    RequestFailed(String),

    #[error("classifier request timed out")]
    Timeout,

    #[error("unexpected classifier response: {0}")]
    InvalidResponse(String),
}

/// Errors from pipeline orchestration itself.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not allocate a ticket number after {attempts} attempts")]
    NumberExhausted { attempts: u32 },

    #[error("tenant {tenant_id} has no connected mailbox")]
    NoMailbox { tenant_id: String },
}

/// Top-level error for the maildesk crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the underlying failure is a transport problem that the next
    /// poll cycle may not see again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Mailbox(
                MailboxError::Timeout { .. }
                    | MailboxError::HostUnreachable { .. }
                    | MailboxError::AuthExpired
            ) | Error::Classifier(ClassifierError::Timeout | ClassifierError::RequestFailed(_))
        )
    }
}
