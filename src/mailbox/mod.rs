//! Mailbox capability — a uniform interface over the two inbound backends
//! (stateful IMAP session, page-token mail API) plus OAuth token refresh.

pub mod api;
pub mod auth;
pub mod imap;
pub mod message;

use async_trait::async_trait;

use crate::error::MailboxError;

pub use api::ApiMailbox;
pub use auth::TokenRefresher;
pub use imap::ImapMailbox;
pub use message::{OutboundMessage, RawMessage};

/// A connected mailbox for one tenant.
///
/// All backends implement the same surface; a backend that cannot support an
/// operation (IMAP has no post-hoc message state) implements it as a no-op
/// rather than an error. One instance serves one tenant and is driven by that
/// tenant's poller task, so methods take `&mut self`.
#[async_trait]
pub trait MailboxSource: Send {
    /// Validate credentials and open the backend session.
    async fn connect(&mut self) -> Result<(), MailboxError>;

    /// Close the backend session. Safe to call when not connected.
    async fn disconnect(&mut self) -> Result<(), MailboxError>;

    /// Fetch the next batch of unprocessed messages.
    ///
    /// The IMAP backend marks fetched messages `\Seen` as a side effect of
    /// the fetch itself; the API backend leaves provider state untouched
    /// until [`mark_processed`](Self::mark_processed) is called.
    async fn poll(&mut self) -> Result<Vec<RawMessage>, MailboxError>;

    /// Send an outbound message through the backend.
    async fn send(&mut self, message: &OutboundMessage) -> Result<(), MailboxError>;

    /// Tell the provider a message has been handled.
    async fn mark_processed(&mut self, external_id: &str) -> Result<(), MailboxError>;

    /// Whether `connect` has succeeded and `disconnect` has not been called.
    fn is_connected(&self) -> bool;
}
