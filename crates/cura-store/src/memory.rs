use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::records::{
    AppointmentRecord, ManualSendClaim, MessageKind, MessageStatus, NewMessage,
    NotificationMessage, RecipientProfile, TemplateKey,
};
use crate::store::{NotificationStore, RecipientDirectory};

#[derive(Debug, Default)]
struct MemoryTables {
    appointments: BTreeMap<i64, AppointmentRecord>,
    messages: BTreeMap<i64, NotificationMessage>,
    // (message_id, appointment_id)
    links: BTreeSet<(i64, i64)>,
    profiles: BTreeMap<i64, RecipientProfile>,
    next_message_id: i64,
}

/// In-process store: every operation runs under one mutex, which makes the
/// conditional primitives trivially atomic. Used by tests and embedded
/// single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds or replaces a directory profile. Stands in for the external
    /// guardian/patient CRUD.
    pub fn upsert_profile(&self, profile: RecipientProfile) {
        self.tables().profiles.insert(profile.subject_id, profile);
    }

    /// Total number of non-deleted messages; test observability helper.
    pub fn live_message_count(&self) -> usize {
        self.tables()
            .messages
            .values()
            .filter(|message| !message.deleted)
            .count()
    }

    /// Total number of links; test observability helper.
    pub fn link_count(&self) -> usize {
        self.tables().links.len()
    }
}

fn insert_message_locked(tables: &mut MemoryTables, draft: NewMessage, now: DateTime<Utc>) -> NotificationMessage {
    tables.next_message_id += 1;
    let message = NotificationMessage {
        id: tables.next_message_id,
        recipient: draft.recipient,
        body: draft.body,
        kind: draft.kind,
        status: draft.status,
        scheduled_at: draft.scheduled_at,
        sent_at: None,
        error: None,
        attempts: 0,
        template: draft.template,
        deleted: false,
        created_at: now,
        updated_at: now,
    };
    tables.messages.insert(message.id, message.clone());
    message
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn upsert_appointment(&self, record: &AppointmentRecord) -> Result<()> {
        self.tables().appointments.insert(record.id, record.clone());
        Ok(())
    }

    async fn appointment(&self, appointment_id: i64) -> Result<Option<AppointmentRecord>> {
        Ok(self.tables().appointments.get(&appointment_id).cloned())
    }

    async fn live_appointments_on(
        &self,
        subject_id: i64,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>> {
        Ok(self
            .tables()
            .appointments
            .values()
            .filter(|record| {
                !record.deleted
                    && record.subject_id == subject_id
                    && record.scheduled_date == Some(date)
            })
            .cloned()
            .collect())
    }

    async fn insert_message(&self, draft: NewMessage) -> Result<NotificationMessage> {
        let mut tables = self.tables();
        Ok(insert_message_locked(&mut tables, draft, Utc::now()))
    }

    async fn message(&self, message_id: i64) -> Result<Option<NotificationMessage>> {
        Ok(self.tables().messages.get(&message_id).cloned())
    }

    async fn find_pending_scheduled(
        &self,
        recipient: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<Option<NotificationMessage>> {
        Ok(self
            .tables()
            .messages
            .values()
            .find(|message| {
                !message.deleted
                    && message.kind == MessageKind::Scheduled
                    && message.status == MessageStatus::Pending
                    && message.recipient == recipient
                    && message.scheduled_at == scheduled_at
            })
            .cloned())
    }

    async fn due_scheduled_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationMessage>> {
        let mut due: Vec<NotificationMessage> = self
            .tables()
            .messages
            .values()
            .filter(|message| {
                !message.deleted
                    && message.kind == MessageKind::Scheduled
                    && message.status == MessageStatus::Pending
                    && message.scheduled_at <= now
            })
            .cloned()
            .collect();
        due.sort_by_key(|message| (message.scheduled_at, message.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn update_body(&self, message_id: i64, body: &str) -> Result<()> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        if message.status == MessageStatus::Sent {
            return Err(anyhow!("message {message_id} is sent and immutable"));
        }
        message.body = body.to_string();
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn update_recipient(&self, message_id: i64, recipient: &str) -> Result<()> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        if message.status == MessageStatus::Sent {
            return Err(anyhow!("message {message_id} is sent and immutable"));
        }
        message.recipient = recipient.to_string();
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_sent(&self, message_id: i64, sent_at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        message.status = MessageStatus::Sent;
        message.sent_at = Some(sent_at);
        message.error = None;
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn defer_with_error(&self, message_id: i64, error: &str) -> Result<()> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        if message.status.is_terminal() {
            return Ok(());
        }
        message.status = MessageStatus::Pending;
        message.error = Some(error.to_string());
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn record_failure(
        &self,
        message_id: i64,
        error: &str,
        max_attempts: u32,
    ) -> Result<MessageStatus> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        if message.status.is_terminal() {
            return Ok(message.status);
        }
        message.attempts = message.attempts.saturating_add(1);
        message.error = Some(error.to_string());
        message.status = if max_attempts > 0 && message.attempts >= max_attempts {
            MessageStatus::Failed
        } else {
            MessageStatus::Pending
        };
        message.updated_at = Utc::now();
        Ok(message.status)
    }

    async fn soft_delete_message(&self, message_id: i64) -> Result<()> {
        let mut tables = self.tables();
        let message = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| anyhow!("message {message_id} not found"))?;
        message.deleted = true;
        message.updated_at = Utc::now();
        Ok(())
    }

    async fn try_transition_status(
        &self,
        message_id: i64,
        from: MessageStatus,
        to: MessageStatus,
    ) -> Result<bool> {
        let mut tables = self.tables();
        let Some(message) = tables.messages.get_mut(&message_id) else {
            return Ok(false);
        };
        if message.deleted || message.status != from {
            return Ok(false);
        }
        message.status = to;
        message.updated_at = Utc::now();
        Ok(true)
    }

    async fn release_stale_sending(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut tables = self.tables();
        let mut released = 0;
        for message in tables.messages.values_mut() {
            if !message.deleted
                && message.status == MessageStatus::Sending
                && message.updated_at < older_than
            {
                message.status = MessageStatus::Pending;
                message.updated_at = Utc::now();
                released += 1;
            }
        }
        Ok(released)
    }

    async fn claim_manual_send(
        &self,
        recipient: &str,
        body: &str,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
        template: TemplateKey,
    ) -> Result<ManualSendClaim> {
        let mut tables = self.tables();
        let candidate = tables
            .messages
            .values()
            .filter(|message| {
                !message.deleted
                    && message.kind == MessageKind::Manual
                    && message.recipient == recipient
                    && message.body == body
                    && message.created_at >= window_start
            })
            .map(|message| (message.id, message.status))
            .next();

        match candidate {
            Some((_, status)) if status != MessageStatus::Pending => {
                Ok(ManualSendClaim::AlreadyHandled)
            }
            Some((id, _)) => {
                let message = tables
                    .messages
                    .get_mut(&id)
                    .ok_or_else(|| anyhow!("manual candidate {id} vanished"))?;
                message.status = MessageStatus::Sending;
                message.updated_at = now;
                Ok(ManualSendClaim::Claimed(message.clone()))
            }
            None => {
                let message = insert_message_locked(
                    &mut tables,
                    NewMessage {
                        recipient: recipient.to_string(),
                        body: body.to_string(),
                        kind: MessageKind::Manual,
                        status: MessageStatus::Sending,
                        scheduled_at: now,
                        template,
                    },
                    now,
                );
                Ok(ManualSendClaim::Claimed(message))
            }
        }
    }

    async fn insert_link_if_missing(&self, message_id: i64, appointment_id: i64) -> Result<bool> {
        Ok(self.tables().links.insert((message_id, appointment_id)))
    }

    async fn delete_link(&self, message_id: i64, appointment_id: i64) -> Result<bool> {
        Ok(self.tables().links.remove(&(message_id, appointment_id)))
    }

    async fn message_ids_for_appointment(&self, appointment_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .tables()
            .links
            .iter()
            .filter(|(_, linked_appointment)| *linked_appointment == appointment_id)
            .map(|(message_id, _)| *message_id)
            .collect())
    }

    async fn appointment_ids_for_message(&self, message_id: i64) -> Result<Vec<i64>> {
        Ok(self
            .tables()
            .links
            .iter()
            .filter(|(linked_message, _)| *linked_message == message_id)
            .map(|(_, appointment_id)| *appointment_id)
            .collect())
    }

    async fn live_link_count(&self, message_id: i64) -> Result<usize> {
        Ok(self
            .tables()
            .links
            .iter()
            .filter(|(linked_message, _)| *linked_message == message_id)
            .count())
    }
}

#[async_trait]
impl RecipientDirectory for MemoryStore {
    async fn profile(&self, subject_id: i64) -> Result<Option<RecipientProfile>> {
        Ok(self.tables().profiles.get(&subject_id).cloned())
    }
}
