//! Appointment↔message link registry.
//!
//! Owns the delete-vs-detach decision: a `pending` message losing its last
//! link is soft-deleted, anything still referenced (or already sent, for
//! audit history) is kept and reported back as needing a re-render.

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use cura_store::{MessageStatus, NotificationStore};

/// Result of detaching one appointment from one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachOutcome {
    /// The message lost its last link while still `pending` and was
    /// soft-deleted.
    Deleted,
    /// The message survives with other links; its body no longer matches
    /// its link set and must be re-rendered.
    NeedsRerender,
    /// No live link existed, or the message itself is gone.
    AlreadyDetached,
}

#[derive(Clone)]
pub struct LinkRegistry {
    store: Arc<dyn NotificationStore>,
}

impl LinkRegistry {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Idempotent link insert; returns true when the link was created.
    pub async fn attach_if_missing(&self, message_id: i64, appointment_id: i64) -> Result<bool> {
        self.store
            .insert_link_if_missing(message_id, appointment_id)
            .await
    }

    pub async fn detach_and_maybe_delete(
        &self,
        appointment_id: i64,
        message_id: i64,
    ) -> Result<DetachOutcome> {
        let removed = self.store.delete_link(message_id, appointment_id).await?;
        if !removed {
            return Ok(DetachOutcome::AlreadyDetached);
        }
        let remaining = self.store.live_link_count(message_id).await?;
        if remaining > 0 {
            return Ok(DetachOutcome::NeedsRerender);
        }
        let Some(message) = self.store.message(message_id).await? else {
            return Ok(DetachOutcome::AlreadyDetached);
        };
        if message.deleted {
            return Ok(DetachOutcome::AlreadyDetached);
        }
        if message.status == MessageStatus::Pending {
            self.store.soft_delete_message(message_id).await?;
            debug!(message_id, appointment_id, "orphaned pending message deleted");
            return Ok(DetachOutcome::Deleted);
        }
        // Sent (or in-flight) messages are preserved for audit history even
        // with zero links.
        Ok(DetachOutcome::NeedsRerender)
    }
}
