use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states for an outbound notification message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for a delivery cycle to claim it.
    Pending,
    /// Claimed by exactly one worker; a send is in flight.
    Sending,
    /// Delivered; immutable from here on.
    Sent,
    /// Attempt ceiling exhausted; terminal.
    Failed,
}

impl MessageStatus {
    /// Returns the stable snake_case wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    /// Parses a status token; normalization happens here and nowhere else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sending" => Some(Self::Sending),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Returns true when the message cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed)
    }
}

/// Distinguishes consolidated reminders from one-off alerts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Offset-based reminder produced by the consolidation planner.
    Scheduled,
    /// Immediate notification (reschedule alerts).
    Manual,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Some(Self::Scheduled),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Identifies the body pattern a message was rendered from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKey {
    /// Reminder fired this many days before the appointment date.
    Reminder { offset_days: u32 },
    /// "You have been rescheduled" alert.
    Reschedule,
}

impl TemplateKey {
    /// Stable text encoding used by the store (`reminder:7`, `reschedule`).
    pub fn encode(self) -> String {
        match self {
            Self::Reminder { offset_days } => format!("reminder:{offset_days}"),
            Self::Reschedule => "reschedule".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed == "reschedule" {
            return Some(Self::Reschedule);
        }
        let offset = trimmed.strip_prefix("reminder:")?;
        offset
            .parse::<u32>()
            .ok()
            .map(|offset_days| Self::Reminder { offset_days })
    }
}

/// A clinical appointment as mirrored from the external appointment service.
/// Read-only to the notification core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentRecord {
    pub id: i64,
    pub subject_id: i64,
    pub item_name: String,
    pub sequence: u32,
    pub scheduled_date: Option<NaiveDate>,
    pub deleted: bool,
}

impl AppointmentRecord {
    /// True when the appointment can drive reminder planning.
    pub fn is_plannable(&self) -> bool {
        !self.deleted && self.scheduled_date.is_some()
    }
}

/// One outbound reminder or alert with its own delivery lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationMessage {
    pub id: i64,
    pub recipient: String,
    pub body: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempts: u32,
    pub template: TemplateKey,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a new message; the store assigns id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub recipient: String,
    pub body: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub scheduled_at: DateTime<Utc>,
    pub template: TemplateKey,
}

/// Join record: which appointments a message currently represents.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppointmentMessageLink {
    pub message_id: i64,
    pub appointment_id: i64,
}

/// Relationship of the notified contact to the appointment subject; drives
/// the honorific used in rendered bodies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecipientRelationship {
    Mother,
    Father,
    Guardian,
    SelfPatient,
}

impl RecipientRelationship {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mother => "mother",
            Self::Father => "father",
            Self::Guardian => "guardian",
            Self::SelfPatient => "self",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mother" | "mom" => Some(Self::Mother),
            "father" | "dad" => Some(Self::Father),
            "guardian" => Some(Self::Guardian),
            "self" | "patient" => Some(Self::SelfPatient),
            _ => None,
        }
    }

    pub fn honorific(self) -> &'static str {
        match self {
            Self::Mother => "Mrs.",
            Self::Father => "Mr.",
            Self::Guardian | Self::SelfPatient => "",
        }
    }
}

/// Directory entry for the contact notified about a subject's appointments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecipientProfile {
    pub subject_id: i64,
    pub display_name: String,
    pub phone: Option<String>,
    pub relationship: RecipientRelationship,
    pub opted_out: bool,
}

/// Outcome of the atomic manual-send claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualSendClaim {
    /// This caller owns the send; the message is now `sending`.
    Claimed(NotificationMessage),
    /// A concurrent caller already claimed or completed an identical send
    /// inside the dedupe window.
    AlreadyHandled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_message_status_round_trips_and_normalizes() {
        for status in [
            MessageStatus::Pending,
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Failed,
        ] {
            assert_eq!(MessageStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(MessageStatus::parse(" SENT "), Some(MessageStatus::Sent));
        assert_eq!(MessageStatus::parse("delivered"), None);
        assert!(MessageStatus::Sent.is_terminal());
        assert!(MessageStatus::Failed.is_terminal());
        assert!(!MessageStatus::Sending.is_terminal());
    }

    #[test]
    fn unit_template_key_encoding_round_trips() {
        assert_eq!(
            TemplateKey::decode("reminder:7"),
            Some(TemplateKey::Reminder { offset_days: 7 })
        );
        assert_eq!(TemplateKey::decode("reschedule"), Some(TemplateKey::Reschedule));
        assert_eq!(TemplateKey::Reminder { offset_days: 0 }.encode(), "reminder:0");
        assert_eq!(TemplateKey::decode("reminder:x"), None);
    }

    #[test]
    fn unit_relationship_parse_accepts_aliases() {
        assert_eq!(
            RecipientRelationship::parse("Mom"),
            Some(RecipientRelationship::Mother)
        );
        assert_eq!(
            RecipientRelationship::parse("patient"),
            Some(RecipientRelationship::SelfPatient)
        );
        assert_eq!(RecipientRelationship::parse("uncle"), None);
        assert_eq!(RecipientRelationship::Mother.honorific(), "Mrs.");
        assert_eq!(RecipientRelationship::Guardian.honorific(), "");
    }
}
