//! Ticket lifecycle event stream.
//!
//! The pipeline publishes one event per state-changing outcome; live
//! consumers subscribe to the broadcast, durable consumers read the persisted
//! notification feed the processor writes alongside.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::model::TicketPriority;

const CHANNEL_CAPACITY: usize = 256;

/// A state-changing ticket outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TicketEvent {
    /// A new ticket was opened from an inbound complaint.
    Created {
        tenant_id: Uuid,
        ticket_id: Uuid,
        number: String,
        subject: String,
        priority: TicketPriority,
        at: DateTime<Utc>,
    },
    /// A customer reply was appended without an escalation.
    Reply {
        tenant_id: Uuid,
        ticket_id: Uuid,
        number: String,
        at: DateTime<Utc>,
    },
    /// A customer reply was appended and the priority stepped up.
    Escalated {
        tenant_id: Uuid,
        ticket_id: Uuid,
        number: String,
        priority: TicketPriority,
        escalation_count: i32,
        at: DateTime<Utc>,
    },
}

impl TicketEvent {
    pub fn tenant_id(&self) -> Uuid {
        match self {
            TicketEvent::Created { tenant_id, .. }
            | TicketEvent::Reply { tenant_id, .. }
            | TicketEvent::Escalated { tenant_id, .. } => *tenant_id,
        }
    }

    pub fn ticket_id(&self) -> Uuid {
        match self {
            TicketEvent::Created { ticket_id, .. }
            | TicketEvent::Reply { ticket_id, .. }
            | TicketEvent::Escalated { ticket_id, .. } => *ticket_id,
        }
    }

    pub fn number(&self) -> &str {
        match self {
            TicketEvent::Created { number, .. }
            | TicketEvent::Reply { number, .. }
            | TicketEvent::Escalated { number, .. } => number,
        }
    }

    /// One-line feed text for the notification row.
    pub fn feed_text(&self) -> String {
        match self {
            TicketEvent::Created { number, subject, .. } => {
                format!("New ticket {number}: {subject}")
            }
            TicketEvent::Reply { number, .. } => {
                format!("Customer replied to {number}")
            }
            TicketEvent::Escalated { number, priority, .. } => {
                format!("Customer replied to {number}; priority escalated to {}", priority.as_str())
            }
        }
    }
}

/// Broadcast fan-out for [`TicketEvent`]s. Cheap to clone; publishing with no
/// subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TicketEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TicketEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TicketEvent) {
        // send fails only when no receiver is subscribed.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created_event() -> TicketEvent {
        TicketEvent::Created {
            tenant_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            number: "INC000001".into(),
            subject: "Order broken".into(),
            priority: TicketPriority::High,
            at: Utc::now(),
        }
    }

    #[test]
    fn created_serde_shape() {
        let json = serde_json::to_string(&created_event()).unwrap();
        assert!(json.contains("\"type\":\"created\""));
        assert!(json.contains("\"number\":\"INC000001\""));
        assert!(json.contains("\"priority\":\"high\""));
    }

    #[test]
    fn escalated_serde_shape() {
        let event = TicketEvent::Escalated {
            tenant_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            number: "INC000002".into(),
            priority: TicketPriority::Medium,
            escalation_count: 2,
            at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"escalated\""));
        assert!(json.contains("\"escalation_count\":2"));
    }

    #[test]
    fn feed_text_per_variant() {
        let event = created_event();
        assert_eq!(event.feed_text(), "New ticket INC000001: Order broken");

        let event = TicketEvent::Escalated {
            tenant_id: Uuid::new_v4(),
            ticket_id: Uuid::new_v4(),
            number: "INC000003".into(),
            priority: TicketPriority::Urgent,
            escalation_count: 4,
            at: Utc::now(),
        };
        assert_eq!(
            event.feed_text(),
            "Customer replied to INC000003; priority escalated to urgent"
        );
    }

    #[tokio::test]
    async fn bus_delivers_to_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(created_event());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.number(), "INC000001");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(created_event()); // must not panic
    }
}
