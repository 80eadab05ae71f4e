use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Returns the current Unix timestamp in milliseconds.
pub fn current_unix_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns true when `expires_unix` is present and no longer in the future.
pub fn is_expired_unix(expires_unix: Option<u64>, now_unix: u64) -> bool {
    matches!(expires_unix, Some(value) if value <= now_unix)
}

/// Reminder scheduling policy: day offsets before an appointment date, the
/// local send time, and the clinic timezone. Loaded once from configuration
/// and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderPolicy {
    offsets_days: Vec<u32>,
    send_time: NaiveTime,
    timezone: Tz,
}

impl ReminderPolicy {
    pub fn new(offsets_days: Vec<u32>, send_time: NaiveTime, timezone: Tz) -> Result<Self> {
        if offsets_days.is_empty() {
            return Err(anyhow!("reminder policy requires at least one day offset"));
        }
        Ok(Self {
            offsets_days,
            send_time,
            timezone,
        })
    }

    pub fn offsets_days(&self) -> &[u32] {
        &self.offsets_days
    }

    pub fn send_time(&self) -> NaiveTime {
        self.send_time
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Computes the absolute delivery instant for a reminder fired
    /// `offset_days` before `appointment_date`, at the policy's local send
    /// time. Ambiguous or skipped local times (DST transitions) resolve to
    /// the earliest valid instant.
    pub fn run_at(&self, appointment_date: NaiveDate, offset_days: u32) -> Option<DateTime<Utc>> {
        let send_date = appointment_date
            .checked_sub_signed(chrono::Duration::days(i64::from(offset_days)))?;
        let local = send_date.and_time(self.send_time);
        match self.timezone.from_local_datetime(&local) {
            chrono::LocalResult::Single(instant) => Some(instant.with_timezone(&Utc)),
            chrono::LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            chrono::LocalResult::None => {
                // Skipped hour: fall forward to the same wall time one hour later.
                let shifted = local + chrono::Duration::hours(1);
                self.timezone
                    .from_local_datetime(&shifted)
                    .earliest()
                    .map(|instant| instant.with_timezone(&Utc))
            }
        }
    }

    /// Returns the calendar date of `instant` in the policy timezone.
    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    /// Formats an appointment date the way reminder bodies present it, for
    /// example `10 June 2025`.
    pub fn format_date(&self, date: NaiveDate) -> String {
        format!(
            "{} {} {}",
            date.day(),
            month_name(date.month()),
            date.year()
        )
    }

    /// Formats the local send time as `HH:MM`.
    pub fn format_send_time(&self) -> String {
        self.send_time.format("%H:%M").to_string()
    }
}

fn month_name(month: u32) -> &'static str {
    match month {
        1 => "January",
        2 => "February",
        3 => "March",
        4 => "April",
        5 => "May",
        6 => "June",
        7 => "July",
        8 => "August",
        9 => "September",
        10 => "October",
        11 => "November",
        _ => "December",
    }
}
