//! Ticket domain — the aggregate model and its lifecycle event stream.

pub mod events;
pub mod model;

pub use events::{EventBus, TicketEvent};
pub use model::{
    ActivityType, ProcessedOutcome, Ticket, TicketActivity, TicketComment, TicketPriority,
    TicketStatus,
};
