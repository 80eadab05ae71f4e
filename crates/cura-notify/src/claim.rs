//! Immediate-notification claim lock.
//!
//! Collapses near-simultaneous "you were rescheduled" sends for one
//! recipient into exactly one gateway call. The claim itself is the store's
//! atomic conditional transition; losing it is a successful no-op, not an
//! error. Whoever wins the claim performs the send and settles the message
//! to `sent` or back to `pending` with the error recorded.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use cura_delivery::SmsGateway;
use cura_store::{ManualSendClaim, NotificationStore, TemplateKey};

/// Outcome of one `send_once` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOnceOutcome {
    /// This caller won the claim and the gateway accepted the message.
    Sent,
    /// An identical recent notification is already claimed or delivered.
    AlreadyHandled,
    /// This caller won the claim but the gateway refused; the message is
    /// back in `pending` with the error recorded.
    Deferred,
}

impl SendOnceOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::AlreadyHandled => "already_handled",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Clone)]
pub struct ImmediateNotifier {
    store: Arc<dyn NotificationStore>,
    gateway: Arc<dyn SmsGateway>,
    dedupe_window: Duration,
}

impl ImmediateNotifier {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        gateway: Arc<dyn SmsGateway>,
        dedupe_window: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            dedupe_window,
        }
    }

    /// Sends `body` to `recipient` at most once per dedupe window.
    pub async fn send_once(
        &self,
        recipient: &str,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<SendOnceOutcome> {
        let window_start = now - self.dedupe_window;
        let claim = self
            .store
            .claim_manual_send(recipient, body, window_start, now, TemplateKey::Reschedule)
            .await?;
        let message = match claim {
            ManualSendClaim::AlreadyHandled => {
                debug!(recipient, "immediate notification already handled by a peer");
                return Ok(SendOnceOutcome::AlreadyHandled);
            }
            ManualSendClaim::Claimed(message) => message,
        };

        match self.gateway.send(recipient, body).await {
            Ok(_receipt) => {
                self.store.mark_sent(message.id, now).await?;
                debug!(recipient, message_id = message.id, "immediate notification sent");
                Ok(SendOnceOutcome::Sent)
            }
            Err(error) => {
                // No ceiling here: a pending manual message is only retried
                // by a later identical cascade inside the window.
                self.store
                    .record_failure(message.id, &error.to_string(), 0)
                    .await?;
                warn!(
                    recipient,
                    message_id = message.id,
                    reason_code = error.reason_code.as_str(),
                    "immediate notification deferred"
                );
                Ok(SendOnceOutcome::Deferred)
            }
        }
    }
}
