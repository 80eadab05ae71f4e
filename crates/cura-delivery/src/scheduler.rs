//! Polling delivery loop.
//!
//! A single long-running task claims due reminder messages through the
//! store's conditional status update, dispatches them through the gateway,
//! and records outcomes. Claims are per-message: losing a claim to a
//! concurrent worker is a skip, not an error, and one message's failure
//! never aborts the rest of the batch.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cura_core::config::DeliveryConfig;
use cura_core::normalize_msisdn;
use cura_store::{MessageStatus, NotificationMessage, NotificationStore, RecipientDirectory};

use crate::gateway::SmsGateway;

const VALIDATION_ERROR_MISSING_RECIPIENT: &str = "validation: recipient address missing";
const VALIDATION_ERROR_EMPTY_BODY: &str = "validation: message body empty";

/// Counters for one poll cycle; returned for observability and asserted on
/// by tests.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DeliveryCycleReport {
    pub due: usize,
    pub claimed: usize,
    pub lost_claims: usize,
    pub sent: usize,
    pub retried: usize,
    pub requeued: usize,
    pub failed_terminal: usize,
    pub validation_errors: usize,
    pub recipients_refreshed: usize,
    pub stale_released: usize,
}

enum MessageOutcome {
    Sent { retries: u32 },
    Requeued { retries: u32 },
    FailedTerminal { retries: u32 },
    ValidationError,
}

/// Claims, sends, and retries due messages against the store and gateway.
pub struct DeliveryScheduler {
    store: Arc<dyn NotificationStore>,
    directory: Arc<dyn RecipientDirectory>,
    gateway: Arc<dyn SmsGateway>,
    config: DeliveryConfig,
}

impl DeliveryScheduler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        directory: Arc<dyn RecipientDirectory>,
        gateway: Arc<dyn SmsGateway>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            directory,
            gateway,
            config,
        }
    }

    /// Runs one poll cycle at `now`. Errors from individual messages are
    /// recorded on the message and counted; only a failure to query the
    /// store at all surfaces as `Err`.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<DeliveryCycleReport> {
        let mut report = DeliveryCycleReport::default();

        if let Some(stale_after) = self.config.stale_claim_after() {
            match self.store.release_stale_sending(now - stale_after).await {
                Ok(released) => {
                    report.stale_released = released;
                    if released > 0 {
                        warn!(released, "released stale sending claims back to pending");
                    }
                }
                Err(error) => warn!(%error, "stale claim sweep failed"),
            }
        }

        let due = self
            .store
            .due_scheduled_messages(now, self.config.batch_size)
            .await
            .context("failed to query due messages")?;
        report.due = due.len();

        for message in due {
            let message_id = message.id;
            match self.process_message(message, now).await {
                Ok(None) => report.lost_claims += 1,
                Ok(Some(outcome)) => {
                    report.claimed += 1;
                    match outcome {
                        MessageOutcome::Sent { retries } => {
                            report.sent += 1;
                            report.retried += retries as usize;
                        }
                        MessageOutcome::Requeued { retries } => {
                            report.requeued += 1;
                            report.retried += retries as usize;
                        }
                        MessageOutcome::FailedTerminal { retries } => {
                            report.failed_terminal += 1;
                            report.retried += retries as usize;
                        }
                        MessageOutcome::ValidationError => report.validation_errors += 1,
                    }
                }
                Err(error) => {
                    // Store-level trouble for this message; leave it for the
                    // next cycle and keep draining the batch.
                    warn!(message_id, %error, "message processing aborted");
                    report.requeued += 1;
                }
            }
        }

        if report.due > 0 {
            info!(
                due = report.due,
                sent = report.sent,
                requeued = report.requeued,
                failed = report.failed_terminal,
                lost = report.lost_claims,
                "delivery cycle complete"
            );
        }
        Ok(report)
    }

    /// Returns `Ok(None)` when another worker claimed the message first.
    async fn process_message(
        &self,
        message: NotificationMessage,
        now: DateTime<Utc>,
    ) -> Result<Option<MessageOutcome>> {
        let claimed = self
            .store
            .try_transition_status(message.id, MessageStatus::Pending, MessageStatus::Sending)
            .await?;
        if !claimed {
            debug!(message_id = message.id, "claim lost to concurrent worker");
            return Ok(None);
        }

        let mut refreshed = false;
        let recipient = match self.refresh_recipient(&message).await {
            Ok(Some(current)) if current != message.recipient => {
                self.store.update_recipient(message.id, &current).await?;
                refreshed = true;
                current
            }
            Ok(_) => message.recipient.clone(),
            Err(error) => {
                warn!(message_id = message.id, %error, "recipient refresh failed");
                message.recipient.clone()
            }
        };
        if refreshed {
            debug!(message_id = message.id, "recipient address refreshed before send");
        }

        if recipient.trim().is_empty() {
            self.store
                .defer_with_error(message.id, VALIDATION_ERROR_MISSING_RECIPIENT)
                .await?;
            return Ok(Some(MessageOutcome::ValidationError));
        }
        if message.body.trim().is_empty() {
            self.store
                .defer_with_error(message.id, VALIDATION_ERROR_EMPTY_BODY)
                .await?;
            return Ok(Some(MessageOutcome::ValidationError));
        }

        let mut retries = 0_u32;
        loop {
            match self.gateway.send(&recipient, &message.body).await {
                Ok(receipt) => {
                    self.store.mark_sent(message.id, now).await?;
                    debug!(
                        message_id = message.id,
                        provider_message_id = receipt.provider_message_id.as_deref().unwrap_or(""),
                        "message delivered"
                    );
                    return Ok(Some(MessageOutcome::Sent { retries }));
                }
                Err(error) if error.retryable && retries < self.config.retry_attempts => {
                    retries += 1;
                    let backoff =
                        self.config.retry_backoff_base() * 2_u32.saturating_pow(retries - 1);
                    debug!(
                        message_id = message.id,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient gateway failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => {
                    let status = self
                        .store
                        .record_failure(
                            message.id,
                            &error.to_string(),
                            self.config.max_delivery_attempts,
                        )
                        .await?;
                    warn!(
                        message_id = message.id,
                        reason_code = error.reason_code.as_str(),
                        retryable = error.retryable,
                        final_status = status.as_str(),
                        "message delivery failed"
                    );
                    return Ok(Some(if status == MessageStatus::Failed {
                        MessageOutcome::FailedTerminal { retries }
                    } else {
                        MessageOutcome::Requeued { retries }
                    }));
                }
            }
        }
    }

    /// Re-resolves the recipient address from the directory: contact numbers
    /// can change between message creation and delivery.
    async fn refresh_recipient(&self, message: &NotificationMessage) -> Result<Option<String>> {
        let appointment_ids = self.store.appointment_ids_for_message(message.id).await?;
        let Some(appointment_id) = appointment_ids.first() else {
            return Ok(None);
        };
        let Some(appointment) = self.store.appointment(*appointment_id).await? else {
            return Ok(None);
        };
        let Some(profile) = self.directory.profile(appointment.subject_id).await? else {
            return Ok(None);
        };
        Ok(profile.phone.as_deref().and_then(normalize_msisdn))
    }
}

/// Handle over the running scheduler task.
#[derive(Debug)]
pub struct DeliverySchedulerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl DeliverySchedulerHandle {
    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Spawns the polling loop on the current runtime. Cycles run back to back
/// on the configured interval; a cycle that overruns its interval causes
/// the missed ticks to be skipped rather than stacked.
pub fn start_delivery_scheduler(scheduler: DeliveryScheduler) -> Result<DeliverySchedulerHandle> {
    if scheduler.config.poll_interval().is_zero() {
        anyhow::bail!("delivery poll interval must be greater than zero");
    }
    let handle = tokio::runtime::Handle::try_current()
        .context("delivery scheduler requires an active Tokio runtime")?;

    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let task = handle.spawn(async move {
        let mut interval = tokio::time::interval(scheduler.config.poll_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(error) = scheduler.run_cycle(Utc::now()).await {
                        warn!(%error, "delivery cycle failed");
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("delivery scheduler stopped");
                    break;
                }
            }
        }
    });
    Ok(DeliverySchedulerHandle {
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}
