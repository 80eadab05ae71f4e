use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::time_utils::ReminderPolicy;

const GATEWAY_TOKEN_ENV: &str = "CURA_GATEWAY_TOKEN";
const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 10;
const DEFAULT_DEDUPE_WINDOW_SECS: u64 = 300;
const DEFAULT_SEND_TIME: &str = "08:00";
const DEFAULT_TIMEZONE: &str = "UTC";

fn default_offsets_days() -> Vec<u32> {
    vec![7, 0]
}

fn default_send_time() -> String {
    DEFAULT_SEND_TIME.to_string()
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_backoff_base_ms() -> u64 {
    DEFAULT_RETRY_BACKOFF_BASE_MS
}

fn default_max_delivery_attempts() -> u32 {
    DEFAULT_MAX_DELIVERY_ATTEMPTS
}

fn default_dedupe_window_secs() -> u64 {
    DEFAULT_DEDUPE_WINDOW_SECS
}

fn default_gateway_timeout_secs() -> u64 {
    DEFAULT_GATEWAY_TIMEOUT_SECS
}

fn default_store_path() -> PathBuf {
    PathBuf::from("cura.sqlite3")
}

/// Reminder policy section: day offsets, local send time, clinic timezone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyConfig {
    #[serde(default = "default_offsets_days")]
    pub offsets_days: Vec<u32>,
    #[serde(default = "default_send_time")]
    pub send_time: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            offsets_days: default_offsets_days(),
            send_time: default_send_time(),
            timezone: default_timezone(),
        }
    }
}

impl PolicyConfig {
    /// Parses the section into the runtime `ReminderPolicy`.
    pub fn build(&self) -> Result<ReminderPolicy> {
        let send_time = NaiveTime::parse_from_str(&self.send_time, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&self.send_time, "%H:%M:%S"))
            .with_context(|| format!("invalid policy send_time '{}'", self.send_time))?;
        let timezone: Tz = self
            .timezone
            .parse()
            .map_err(|error| anyhow::anyhow!("invalid policy timezone: {error}"))?;
        ReminderPolicy::new(self.offsets_days.clone(), send_time, timezone)
    }
}

/// Delivery scheduler section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Terminal attempt ceiling; 0 disables the ceiling and restores the
    /// retry-forever behavior.
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// When set, `sending` rows older than this are released back to
    /// `pending` at the start of each cycle.
    #[serde(default)]
    pub stale_claim_after_secs: Option<u64>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            max_delivery_attempts: default_max_delivery_attempts(),
            stale_claim_after_secs: None,
        }
    }
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn stale_claim_after(&self) -> Option<chrono::Duration> {
        self.stale_claim_after_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GatewayMode {
    DryRun,
    Provider,
}

impl GatewayMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Provider => "provider",
        }
    }
}

/// SMS gateway section. The bearer credential is never read from the file;
/// it comes from the `CURA_GATEWAY_TOKEN` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    pub mode: GatewayMode,
    #[serde(default)]
    pub api_base: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: GatewayMode::DryRun,
            api_base: String::new(),
            sender_id: String::new(),
            timeout_secs: default_gateway_timeout_secs(),
            token: None,
        }
    }
}

impl GatewayConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Immediate-notification section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotifyConfig {
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            dedupe_window_secs: default_dedupe_window_secs(),
        }
    }
}

impl NotifyConfig {
    pub fn dedupe_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.dedupe_window_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

/// Top-level configuration loaded from a TOML file plus environment.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CuraConfig {
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl CuraConfig {
    /// Loads and validates configuration from `path`, overlaying the gateway
    /// credential from the environment.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: CuraConfig = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        if let Ok(token) = std::env::var(GATEWAY_TOKEN_ENV) {
            let token = token.trim().to_string();
            if !token.is_empty() {
                config.gateway.token = Some(token);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.build().context("invalid [policy] section")?;
        if self.delivery.poll_interval_secs == 0 {
            bail!("delivery poll_interval_secs must be greater than zero");
        }
        if self.delivery.batch_size == 0 {
            bail!("delivery batch_size must be greater than zero");
        }
        if self.notify.dedupe_window_secs == 0 {
            bail!("notify dedupe_window_secs must be greater than zero");
        }
        if self.gateway.mode == GatewayMode::Provider {
            if self.gateway.api_base.trim().is_empty() {
                bail!("gateway provider mode requires api_base");
            }
            if self.gateway.sender_id.trim().is_empty() {
                bail!("gateway provider mode requires sender_id");
            }
            if self.gateway.timeout_secs == 0 {
                bail!("gateway provider mode requires timeout_secs > 0");
            }
        }
        Ok(())
    }
}
