//! Domain records and the shared message-store contract.
//!
//! The relational schema behind the clinic CRUD is out of scope; this crate
//! defines only what the notification core reads and writes — appointments
//! (mirrored, read-only), notification messages, appointment↔message links,
//! and recipient profiles — plus two interchangeable store backends.

pub mod memory;
pub mod records;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use records::{
    AppointmentMessageLink, AppointmentRecord, ManualSendClaim, MessageKind, MessageStatus,
    NewMessage, NotificationMessage, RecipientProfile, RecipientRelationship, TemplateKey,
};
pub use sqlite::SqliteStore;
pub use store::{NotificationStore, RecipientDirectory};
