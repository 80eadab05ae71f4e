//! Message body rendering.
//!
//! `render` is a pure token-substitution function over a fixed variable
//! set; it never fails and never panics, so it can be called from any task
//! without coordination. Unknown placeholders resolve to the empty string.

use std::collections::HashMap;

use cura_store::TemplateKey;

pub const GREETING_DAY: &str = "Good day";
pub const GREETING_EVENING: &str = "Good evening";
const EVENING_STARTS_AT_HOUR: u32 = 18;

const DEFAULT_REMINDER_PATTERN: &str = "{greeting} {honorific} {name}, this is a reminder: \
{item_list} (dose {sequence_list}) is scheduled on {date} at {time}, in {days_until} day(s). \
Please arrive on time.";

const DEFAULT_SAME_DAY_PATTERN: &str = "{greeting} {honorific} {name}, today is the schedule \
for {item_list} (dose {sequence_list}) at {time}. Please arrive on time.";

const DEFAULT_RESCHEDULE_PATTERN: &str = "{greeting} {honorific} {name}, your appointment has \
been moved: {item_list} (dose {sequence_list}) is now scheduled on {date} at {time}.";

/// Picks the greeting token for a local hour of day.
pub fn greeting_for_hour(hour: u32) -> &'static str {
    if hour < EVENING_STARTS_AT_HOUR {
        GREETING_DAY
    } else {
        GREETING_EVENING
    }
}

/// The fixed variable set available to body patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateVars {
    pub greeting: String,
    pub honorific: String,
    pub name: String,
    pub item_list: String,
    pub sequence_list: String,
    pub date: String,
    pub time: String,
    pub days_until: String,
}

impl TemplateVars {
    fn value_of(&self, token: &str) -> Option<&str> {
        match token {
            "greeting" => Some(&self.greeting),
            "honorific" => Some(&self.honorific),
            "name" => Some(&self.name),
            "item_list" => Some(&self.item_list),
            "sequence_list" => Some(&self.sequence_list),
            "date" => Some(&self.date),
            "time" => Some(&self.time),
            "days_until" => Some(&self.days_until),
            _ => None,
        }
    }
}

/// Substitutes `{token}` placeholders in `pattern`. Unknown tokens become
/// empty strings; an unterminated brace is kept literally.
pub fn render(pattern: &str, vars: &TemplateVars) -> String {
    let mut output = String::with_capacity(pattern.len());
    let mut rest = pattern;
    while let Some(open) = rest.find('{') {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let token = &after_open[..close];
                if let Some(value) = vars.value_of(token.trim()) {
                    output.push_str(value);
                }
                rest = &after_open[close + 1..];
            }
            None => {
                output.push_str(&rest[open..]);
                return output;
            }
        }
    }
    output.push_str(rest);
    // Collapse the double spaces an empty honorific leaves behind.
    while output.contains("  ") {
        output = output.replace("  ", " ");
    }
    output.trim().to_string()
}

/// Read-only map from trigger type to body pattern. Template CRUD lives
/// outside this core; the catalog is populated from configuration and
/// falls back to built-in patterns for unknown keys.
#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    patterns: HashMap<TemplateKey, String>,
}

impl TemplateCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pattern(mut self, key: TemplateKey, pattern: impl Into<String>) -> Self {
        self.patterns.insert(key, pattern.into());
        self
    }

    pub fn pattern_for(&self, key: TemplateKey) -> &str {
        if let Some(pattern) = self.patterns.get(&key) {
            return pattern;
        }
        match key {
            TemplateKey::Reminder { offset_days: 0 } => DEFAULT_SAME_DAY_PATTERN,
            TemplateKey::Reminder { .. } => DEFAULT_REMINDER_PATTERN,
            TemplateKey::Reschedule => DEFAULT_RESCHEDULE_PATTERN,
        }
    }
}
