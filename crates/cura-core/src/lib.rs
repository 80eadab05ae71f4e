//! Foundational utilities shared across cura crates.
//!
//! Provides unix-time helpers, reminder-policy calendar math in the clinic's
//! timezone, phone-number normalization, and the TOML configuration surface.

pub mod config;
pub mod phone;
pub mod time_utils;

pub use config::{
    CuraConfig, DeliveryConfig, GatewayConfig, GatewayMode, NotifyConfig, PolicyConfig,
    StoreConfig,
};
pub use phone::normalize_msisdn;
pub use time_utils::{
    current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix, ReminderPolicy,
};
