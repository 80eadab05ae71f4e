//! Consolidation planner.
//!
//! Turns one appointment into the set of reminder messages its day group
//! should have: one message per reminder offset, shared by every live
//! appointment of the same subject on the same calendar date. Re-running
//! the planner for any appointment of the group converges on the same
//! message set.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Timelike, Utc};
use serde::Serialize;
use tracing::{debug, info};

use cura_core::time_utils::ReminderPolicy;
use cura_core::normalize_msisdn;
use cura_store::{
    AppointmentRecord, MessageKind, MessageStatus, NewMessage, NotificationStore,
    RecipientDirectory, RecipientProfile, TemplateKey,
};

use crate::links::LinkRegistry;
use crate::template::{greeting_for_hour, render, TemplateCatalog, TemplateVars};

pub const SKIP_REASON_NOT_PLANNABLE: &str = "appointment_missing_or_undated";
pub const SKIP_REASON_NO_RECIPIENT: &str = "recipient_address_missing";
pub const SKIP_REASON_OPTED_OUT: &str = "recipient_opted_out";

/// Counters from one planner run.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PlanReport {
    pub created: usize,
    pub reused: usize,
    pub links_added: usize,
    pub offsets_skipped_past: usize,
    pub skip_reason: Option<String>,
}

impl PlanReport {
    fn skipped(reason: &str) -> Self {
        Self {
            skip_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

/// Outcome of resolving the contact for a subject.
pub(crate) enum RecipientResolution {
    Address {
        phone: String,
        profile: RecipientProfile,
    },
    Skip(&'static str),
}

#[derive(Clone)]
pub struct ConsolidationPlanner {
    pub(crate) store: Arc<dyn NotificationStore>,
    pub(crate) directory: Arc<dyn RecipientDirectory>,
    pub(crate) policy: ReminderPolicy,
    pub(crate) templates: TemplateCatalog,
    pub(crate) links: LinkRegistry,
}

impl ConsolidationPlanner {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        directory: Arc<dyn RecipientDirectory>,
        policy: ReminderPolicy,
        templates: TemplateCatalog,
    ) -> Self {
        let links = LinkRegistry::new(store.clone());
        Self {
            store,
            directory,
            policy,
            templates,
            links,
        }
    }

    /// Plans reminder messages for the day group of `appointment_id`.
    ///
    /// Opted-out recipients and unresolvable addresses are skips, not
    /// errors; the report records the reason. Offsets whose delivery
    /// instant already passed are never scheduled.
    pub async fn plan_for_appointment(
        &self,
        appointment_id: i64,
        now: DateTime<Utc>,
    ) -> Result<PlanReport> {
        let Some(appointment) = self.store.appointment(appointment_id).await? else {
            debug!(appointment_id, "planner skip: appointment not found");
            return Ok(PlanReport::skipped(SKIP_REASON_NOT_PLANNABLE));
        };
        if !appointment.is_plannable() {
            debug!(appointment_id, "planner skip: deleted or undated appointment");
            return Ok(PlanReport::skipped(SKIP_REASON_NOT_PLANNABLE));
        }
        let date = appointment
            .scheduled_date
            .context("plannable appointment lost its date")?;

        let (phone, profile) = match self.resolve_recipient(appointment.subject_id).await? {
            RecipientResolution::Address { phone, profile } => (phone, profile),
            RecipientResolution::Skip(reason) => {
                info!(
                    appointment_id,
                    subject_id = appointment.subject_id,
                    reason,
                    "planner skip"
                );
                return Ok(PlanReport::skipped(reason));
            }
        };

        let group = self.day_group(&appointment, date).await?;
        let mut report = PlanReport::default();

        for &offset_days in self.policy.offsets_days() {
            let Some(run_at) = self.policy.run_at(date, offset_days) else {
                continue;
            };
            if run_at < now {
                report.offsets_skipped_past += 1;
                continue;
            }
            let template = TemplateKey::Reminder { offset_days };
            let body = self.reminder_body(template, &group, &profile, date);

            match self.store.find_pending_scheduled(&phone, run_at).await? {
                Some(existing) => {
                    for member in &group {
                        if self.links.attach_if_missing(existing.id, member.id).await? {
                            report.links_added += 1;
                        }
                    }
                    self.store.update_body(existing.id, &body).await?;
                    report.reused += 1;
                }
                None => {
                    let message = self
                        .store
                        .insert_message(NewMessage {
                            recipient: phone.clone(),
                            body,
                            kind: MessageKind::Scheduled,
                            status: MessageStatus::Pending,
                            scheduled_at: run_at,
                            template,
                        })
                        .await?;
                    for member in &group {
                        if self.links.attach_if_missing(message.id, member.id).await? {
                            report.links_added += 1;
                        }
                    }
                    report.created += 1;
                }
            }
        }

        info!(
            appointment_id,
            created = report.created,
            reused = report.reused,
            links_added = report.links_added,
            skipped_past = report.offsets_skipped_past,
            "planner run complete"
        );
        Ok(report)
    }

    /// Loads the day group, making sure the triggering appointment is part
    /// of it even if the mirror lags.
    pub(crate) async fn day_group(
        &self,
        appointment: &AppointmentRecord,
        date: NaiveDate,
    ) -> Result<Vec<AppointmentRecord>> {
        let mut group = self
            .store
            .live_appointments_on(appointment.subject_id, date)
            .await?;
        if !group.iter().any(|member| member.id == appointment.id) {
            group.push(appointment.clone());
        }
        group.sort_by(|a, b| {
            a.sequence
                .cmp(&b.sequence)
                .then_with(|| a.item_name.cmp(&b.item_name))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(group)
    }

    pub(crate) async fn resolve_recipient(
        &self,
        subject_id: i64,
    ) -> Result<RecipientResolution> {
        let Some(profile) = self.directory.profile(subject_id).await? else {
            return Ok(RecipientResolution::Skip(SKIP_REASON_NO_RECIPIENT));
        };
        if profile.opted_out {
            return Ok(RecipientResolution::Skip(SKIP_REASON_OPTED_OUT));
        }
        let Some(phone) = profile.phone.as_deref().and_then(normalize_msisdn) else {
            return Ok(RecipientResolution::Skip(SKIP_REASON_NO_RECIPIENT));
        };
        Ok(RecipientResolution::Address { phone, profile })
    }

    /// Renders a reminder body from the full day-group item list.
    pub(crate) fn reminder_body(
        &self,
        template: TemplateKey,
        group: &[AppointmentRecord],
        profile: &RecipientProfile,
        date: NaiveDate,
    ) -> String {
        let days_until = match template {
            TemplateKey::Reminder { offset_days } => offset_days,
            TemplateKey::Reschedule => 0,
        };
        let (item_list, sequence_list) = summarize_items(group);
        let vars = TemplateVars {
            greeting: greeting_for_hour(self.policy.send_time().hour()).to_string(),
            honorific: profile.relationship.honorific().to_string(),
            name: profile.display_name.clone(),
            item_list,
            sequence_list,
            date: self.policy.format_date(date),
            time: self.policy.format_send_time(),
            days_until: days_until.to_string(),
        };
        render(self.templates.pattern_for(template), &vars)
    }
}

/// Combined item/sequence summary for a day group, in group order.
pub(crate) fn summarize_items(group: &[AppointmentRecord]) -> (String, String) {
    let items: Vec<&str> = group.iter().map(|member| member.item_name.as_str()).collect();
    let sequences: Vec<String> = group
        .iter()
        .map(|member| member.sequence.to_string())
        .collect();
    (items.join(", "), sequences.join(", "))
}
