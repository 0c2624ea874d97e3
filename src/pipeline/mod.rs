//! The email-to-ticket pipeline.
//!
//! Every inbound message flows through the same stages:
//! 1. [`poller`] — one polling task per connected tenant fetches mail
//! 2. [`resolver`] — ledger and dedup ladder decides new / reply / skip
//! 3. [`classifier`] — the external endpoint labels what is left
//! 4. [`engine`] — ticket mutations, ledger rows, notifications
//! 5. [`ack`] — the customer acknowledgment closes the loop
//!
//! [`processor`] wires 2-5 together per message; [`poller`] drives it.

pub mod ack;
pub mod classifier;
pub mod engine;
pub mod poller;
pub mod processor;
pub mod resolver;
pub mod sentiment;

pub use classifier::{Classifier, HttpClassifier, Label, Verdict};
pub use engine::MutationEngine;
pub use poller::{MailboxSupervisor, spawn_tenant_poller};
pub use processor::MessageProcessor;
pub use resolver::{ReplyResolver, Resolution};
