//! maildesk — email-to-ticket ingestion for multi-tenant support desks.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod pipeline;
pub mod store;
pub mod tickets;
