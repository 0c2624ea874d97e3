//! Persistence layer — libSQL-backed storage for tickets, tenants, and the
//! idempotency ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{
    MailboxKind, MailboxRecord, NotificationRecord, ProcessedEmail, TenantRecord, TicketStore,
    UserRecord,
};
