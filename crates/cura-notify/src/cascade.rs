//! Reschedule cascade.
//!
//! When an appointment's date changes, the cascade detaches it from the
//! messages it shared, repairs what remains of the old day group, replans
//! the new date, and dispatches one immediate notification through the
//! claim lock. Steps run strictly in that order; later steps read the
//! side effects of earlier ones.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;
use tracing::{info, warn};

use cura_delivery::SmsGateway;
use cura_store::{MessageKind, MessageStatus, NotificationStore, TemplateKey};

use crate::claim::ImmediateNotifier;
use crate::links::DetachOutcome;
use crate::planner::{summarize_items, ConsolidationPlanner, PlanReport, RecipientResolution};
use crate::template::{greeting_for_hour, render, TemplateVars};

/// Counters and outcomes from one cascade invocation.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CascadeReport {
    pub appointment_id: i64,
    pub detached: usize,
    pub orphans_deleted: usize,
    pub rerendered: usize,
    pub skipped_past_date: bool,
    pub plan: Option<PlanReport>,
    /// `sent`, `already_handled`, `deferred`, or a skip reason when the
    /// recipient could not be resolved.
    pub immediate: Option<String>,
}

#[derive(Clone)]
pub struct RescheduleCascade {
    planner: ConsolidationPlanner,
    notifier: ImmediateNotifier,
}

impl RescheduleCascade {
    pub fn new(
        planner: ConsolidationPlanner,
        gateway: Arc<dyn SmsGateway>,
        dedupe_window: chrono::Duration,
    ) -> Self {
        let notifier = ImmediateNotifier::new(planner.store.clone(), gateway, dedupe_window);
        Self { planner, notifier }
    }

    /// Handles `AppointmentRescheduled(appointment_id, old_date, new_date)`.
    pub async fn on_appointment_rescheduled(
        &self,
        appointment_id: i64,
        old_date: NaiveDate,
        new_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<CascadeReport> {
        let mut report = CascadeReport {
            appointment_id,
            ..CascadeReport::default()
        };

        // Step 1: detach from every message this appointment drove.
        let linked = self
            .planner
            .store
            .message_ids_for_appointment(appointment_id)
            .await?;
        for message_id in linked {
            match self
                .planner
                .links
                .detach_and_maybe_delete(appointment_id, message_id)
                .await?
            {
                DetachOutcome::Deleted => {
                    report.detached += 1;
                    report.orphans_deleted += 1;
                }
                DetachOutcome::NeedsRerender => report.detached += 1,
                DetachOutcome::AlreadyDetached => {}
            }
        }

        let Some(appointment) = self.planner.store.appointment(appointment_id).await? else {
            warn!(appointment_id, "cascade aborted: appointment vanished");
            return Ok(report);
        };

        // Step 2: repair the shrunken old day group.
        if old_date != new_date {
            report.rerendered = self
                .rerender_group(appointment.subject_id, old_date)
                .await?;
        }

        // Step 3: never plan or announce a date already in the past.
        let today = self.planner.policy.local_date(now);
        if new_date < today {
            info!(appointment_id, %new_date, "cascade skipped: past date");
            report.skipped_past_date = true;
            return Ok(report);
        }

        // Step 4: (re)consolidate the new day group.
        report.plan = Some(
            self.planner
                .plan_for_appointment(appointment_id, now)
                .await?,
        );

        // Step 5: one immediate notification per cascade, deduped across
        // concurrent invocations by the claim lock.
        report.immediate = Some(
            self.send_immediate(appointment.subject_id, new_date, now)
                .await?,
        );

        info!(
            appointment_id,
            detached = report.detached,
            orphans_deleted = report.orphans_deleted,
            rerendered = report.rerendered,
            immediate = report.immediate.as_deref().unwrap_or("none"),
            "cascade complete"
        );
        Ok(report)
    }

    /// Re-renders every pending reminder still linked to the subject's
    /// remaining appointments on `date`. Returns how many bodies changed.
    async fn rerender_group(&self, subject_id: i64, date: NaiveDate) -> Result<usize> {
        let remaining = self
            .planner
            .store
            .live_appointments_on(subject_id, date)
            .await?;
        if remaining.is_empty() {
            return Ok(0);
        }
        let profile = match self.planner.resolve_recipient(subject_id).await? {
            RecipientResolution::Address { profile, .. } => profile,
            RecipientResolution::Skip(reason) => {
                info!(subject_id, reason, "old-group repair skipped");
                return Ok(0);
            }
        };

        let mut message_ids = BTreeSet::new();
        for member in &remaining {
            for message_id in self
                .planner
                .store
                .message_ids_for_appointment(member.id)
                .await?
            {
                message_ids.insert(message_id);
            }
        }

        let mut rerendered = 0;
        for message_id in message_ids {
            let Some(message) = self.planner.store.message(message_id).await? else {
                continue;
            };
            if message.deleted
                || message.kind != MessageKind::Scheduled
                || message.status != MessageStatus::Pending
            {
                continue;
            }
            let body = self
                .planner
                .reminder_body(message.template, &remaining, &profile, date);
            if body != message.body {
                self.planner.store.update_body(message_id, &body).await?;
                rerendered += 1;
            }
        }
        Ok(rerendered)
    }

    /// Builds and dispatches the "you have been rescheduled" summary for
    /// everything now on `new_date`.
    async fn send_immediate(
        &self,
        subject_id: i64,
        new_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let (phone, profile) = match self.planner.resolve_recipient(subject_id).await? {
            RecipientResolution::Address { phone, profile } => (phone, profile),
            RecipientResolution::Skip(reason) => return Ok(reason.to_string()),
        };
        let group = self
            .planner
            .store
            .live_appointments_on(subject_id, new_date)
            .await?;
        if group.is_empty() {
            return Ok("no_live_appointments".to_string());
        }
        let (item_list, sequence_list) = summarize_items(&group);
        let local_now = now.with_timezone(&self.planner.policy.timezone());
        let vars = TemplateVars {
            greeting: greeting_for_hour(local_now.hour()).to_string(),
            honorific: profile.relationship.honorific().to_string(),
            name: profile.display_name.clone(),
            item_list,
            sequence_list,
            date: self.planner.policy.format_date(new_date),
            time: self.planner.policy.format_send_time(),
            days_until: (new_date - self.planner.policy.local_date(now))
                .num_days()
                .max(0)
                .to_string(),
        };
        let body = render(
            self.planner.templates.pattern_for(TemplateKey::Reschedule),
            &vars,
        );
        let outcome = self.notifier.send_once(&phone, &body, now).await?;
        Ok(outcome.as_str().to_string())
    }
}
