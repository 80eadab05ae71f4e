use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::records::{
    AppointmentRecord, ManualSendClaim, MessageStatus, NewMessage, NotificationMessage,
    RecipientProfile, TemplateKey,
};

/// Query/update contract over the shared message store.
///
/// The store is the only mutable resource shared between concurrently
/// running planners, cascades, and delivery cycles, possibly across process
/// instances. Cross-instance safety rests entirely on the conditional
/// primitives (`try_transition_status`, `claim_manual_send`): both must be
/// atomic with respect to every other store operation.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    // Appointment mirror (written by the external appointment service).
    async fn upsert_appointment(&self, record: &AppointmentRecord) -> Result<()>;
    async fn appointment(&self, appointment_id: i64) -> Result<Option<AppointmentRecord>>;
    /// Live (non-deleted, dated) appointments for one subject on one
    /// calendar date — the "day group".
    async fn live_appointments_on(
        &self,
        subject_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>>;

    // Messages.
    async fn insert_message(&self, draft: NewMessage) -> Result<NotificationMessage>;
    async fn message(&self, message_id: i64) -> Result<Option<NotificationMessage>>;
    /// Dedupe-key lookup: non-deleted `scheduled`-kind `pending` message
    /// with this recipient and exact delivery instant.
    async fn find_pending_scheduled(
        &self,
        recipient: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<NotificationMessage>>;
    /// Due messages for a delivery cycle: `scheduled` + `pending` +
    /// `scheduled_at <= now`, not deleted, oldest first, capped at `limit`.
    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMessage>>;
    async fn update_body(&self, message_id: i64, body: &str) -> Result<()>;
    async fn update_recipient(&self, message_id: i64, recipient: &str) -> Result<()>;
    async fn mark_sent(&self, message_id: i64, sent_at: DateTime<Utc>) -> Result<()>;
    /// Records a data-quality error and returns the message to `pending`
    /// without consuming a delivery attempt.
    async fn defer_with_error(&self, message_id: i64, error: &str) -> Result<()>;
    /// Records a delivery failure: stores the error, bumps the attempt
    /// counter, and returns the message to `pending` — or to terminal
    /// `failed` once `attempts` reaches `max_attempts` (0 disables the
    /// ceiling). Returns the resulting status.
    async fn record_failure(
        &self,
        message_id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<MessageStatus>;
    async fn soft_delete_message(&self, message_id: i64) -> Result<()>;
    /// Atomic compare-and-set on the status column. Returns false when the
    /// precondition no longer holds (another worker got there first).
    async fn try_transition_status(
        &self,
        message_id: i64,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool>;
    /// Releases `sending` rows last touched before `older_than` back to
    /// `pending`. Returns how many were released.
    async fn release_stale_sending(&self, older_than: DateTime<Utc>) -> Result<usize>;
    /// Atomic claim for an immediate notification: an identical recent
    /// manual message in flight or already sent means `AlreadyHandled`; a
    /// `pending` candidate is claimed via conditional update; otherwise a
    /// new message is inserted directly in `sending`.
    async fn claim_manual_send(
        &self,
        recipient: &str,
        body: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        template: TemplateKey,
    ) -> Result<ManualSendClaim>;

    // Links.
    async fn insert_link_if_missing(&self, message_id: i64, appointment_id: i64) -> Result<bool>;
    async fn delete_link(&self, message_id: i64, appointment_id: i64) -> Result<bool>;
    async fn message_ids_for_appointment(&self, appointment_id: i64) -> Result<Vec<i64>>;
    async fn appointment_ids_for_message(&self, message_id: i64) -> Result<Vec<i64>>;
    async fn live_link_count(&self, message_id: i64) -> Result<usize>;
}

/// Resolves an appointment subject to the contact that should be notified.
/// Backed by the out-of-scope patient/guardian CRUD; read-only here.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn profile(&self, subject_id: i64) -> Result<Option<RecipientProfile>>;
}
