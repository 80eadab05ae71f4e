//! Outbound SMS gateway client.
//!
//! Applies bearer-authenticated JSON delivery with a fixed timeout and
//! classifies failures as retryable or terminal so the delivery scheduler
//! and claim-lock callers can coordinate retries.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use cura_core::config::GatewayConfig;

const REASON_TRANSPORT: &str = "gateway_transport_error";
const REASON_TIMEOUT: &str = "gateway_timeout";
const REASON_HTTP_ERROR: &str = "gateway_http_error";

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "temporarily",
    "unavailable",
    "bad gateway",
    "try again",
];

/// Structured delivery failure. `retryable` drives the in-process backoff
/// loop and the transient-vs-permanent split of the error taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("gateway send failed: reason_code={reason_code} retryable={retryable} detail={detail}")]
pub struct GatewayError {
    pub reason_code: String,
    pub detail: String,
    pub retryable: bool,
    pub http_status: Option<u16>,
}

impl GatewayError {
    pub fn transient(reason_code: &str, detail: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            detail: detail.into(),
            retryable: true,
            http_status: None,
        }
    }

    pub fn terminal(reason_code: &str, detail: impl Into<String>) -> Self {
        Self {
            reason_code: reason_code.to_string(),
            detail: detail.into(),
            retryable: false,
            http_status: None,
        }
    }
}

/// Successful delivery acknowledgment.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub provider_message_id: Option<String>,
    pub http_status: Option<u16>,
}

/// Seam between the delivery machinery and the external messaging service.
#[async_trait]
pub trait SmsGateway: Send + Sync {
    async fn send(&self, recipient: &str, body: &str) -> Result<GatewayReceipt, GatewayError>;
}

/// Provider-mode gateway: JSON POST with bearer credential and fixed
/// timeout against the configured API base.
#[derive(Debug)]
pub struct HttpSmsGateway {
    api_base: String,
    sender_id: String,
    token: String,
    client: reqwest::Client,
}

impl HttpSmsGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let api_base = config.api_base.trim().trim_end_matches('/').to_string();
        if api_base.is_empty() {
            bail!("sms gateway requires a non-empty api_base");
        }
        let sender_id = config.sender_id.trim().to_string();
        if sender_id.is_empty() {
            bail!("sms gateway requires a non-empty sender_id");
        }
        let token = config
            .token
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .context("sms gateway requires CURA_GATEWAY_TOKEN")?
            .to_string();
        if config.timeout_secs == 0 {
            bail!("sms gateway requires timeout_secs > 0");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build sms gateway HTTP client")?;
        Ok(Self {
            api_base,
            sender_id,
            token,
            client,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.api_base)
    }
}

#[async_trait]
impl SmsGateway for HttpSmsGateway {
    async fn send(&self, recipient: &str, body: &str) -> Result<GatewayReceipt, GatewayError> {
        let payload = json!({
            "sender": self.sender_id,
            "to": recipient,
            "message": body,
        });
        let response = self
            .client
            .post(self.endpoint())
            .bearer_auth(&self.token)
            .json(&payload)
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    GatewayError::transient(REASON_TIMEOUT, error.to_string())
                } else {
                    GatewayError::transient(REASON_TRANSPORT, error.to_string())
                }
            })?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        if status.is_success() {
            let provider_message_id = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|value| {
                    value
                        .get("message_id")
                        .or_else(|| value.get("id"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
            return Ok(GatewayReceipt {
                provider_message_id,
                http_status: Some(status.as_u16()),
            });
        }

        let detail = if raw.trim().is_empty() {
            format!("gateway returned status {status}")
        } else {
            format!("gateway returned status {status}: {raw}")
        };
        Err(GatewayError {
            reason_code: REASON_HTTP_ERROR.to_string(),
            retryable: classify_retryable(status.as_u16(), &raw),
            detail,
            http_status: Some(status.as_u16()),
        })
    }
}

/// Transient-vs-permanent split: timeouts, throttling, and server-side
/// statuses retry; remaining client errors (bad recipient, bad request) are
/// terminal.
fn classify_retryable(status: u16, body: &str) -> bool {
    if status == 408 || status == 429 || (500..600).contains(&status) {
        return true;
    }
    let lowered = body.to_ascii_lowercase();
    TRANSIENT_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Record of one dry-run delivery.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DryRunSend {
    pub recipient: String,
    pub body: String,
}

/// No-network gateway: every send succeeds and is recorded for inspection.
/// Used by the CLI's dry-run mode and by tests asserting send counts.
#[derive(Debug, Default)]
pub struct DryRunGateway {
    sent: Mutex<Vec<DryRunSend>>,
}

impl DryRunGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_count(&self) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn sends(&self) -> Vec<DryRunSend> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl SmsGateway for DryRunGateway {
    async fn send(&self, recipient: &str, body: &str) -> Result<GatewayReceipt, GatewayError> {
        let mut sent = self.sent.lock().unwrap_or_else(PoisonError::into_inner);
        sent.push(DryRunSend {
            recipient: recipient.to_string(),
            body: body.to_string(),
        });
        Ok(GatewayReceipt {
            provider_message_id: Some(format!("dry-run-{}", sent.len())),
            http_status: None,
        })
    }
}
