use crate::config::AlertConfig;
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;

const PAGERDUTY_EVENTS_URL: &str = "https://events.pagerduty.com/v2/enqueue";
const ALERT_SOURCE: &str = "Nibiru Oracle Monitor";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// PagerDuty's severity vocabulary; everything else in the codebase maps
/// onto it so an out-of-vocabulary severity cannot be constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Alert {
    pub severity: Severity,
    pub summary: String,
    pub details: Value,
}

impl Alert {
    pub fn new(severity: Severity, summary: impl Into<String>, details: Value) -> Self {
        Self {
            severity,
            summary: summary.into(),
            details,
        }
    }
}

#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// PagerDuty Events API v2.
pub struct PagerDutyChannel {
    routing_key: String,
    http: reqwest::Client,
}

impl PagerDutyChannel {
    pub fn new(routing_key: String) -> Self {
        Self {
            routing_key,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for PagerDutyChannel {
    fn name(&self) -> &'static str {
        "pagerduty"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let event = json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": alert.summary,
                "source": ALERT_SOURCE,
                "severity": alert.severity.as_str(),
                "custom_details": alert.details,
            },
        });
        let response = self
            .http
            .post(PAGERDUTY_EVENTS_URL)
            .timeout(SEND_TIMEOUT)
            .json(&event)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!("PagerDuty rejected the event: HTTP {status}: {body}"));
        }
        let body: Value = response.json().await.unwrap_or(Value::Null);
        tracing::info!(
            dedup_key = body.get("dedup_key").and_then(|v| v.as_str()).unwrap_or(""),
            "PagerDuty alert accepted"
        );
        Ok(())
    }
}

/// Telegram bot sendMessage. The details map is rendered as a YAML code
/// block under the summary line.
pub struct TelegramChannel {
    bot_token: String,
    chat_id: String,
    http: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            bot_token,
            chat_id,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertChannel for TelegramChannel {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn send(&self, alert: &Alert) -> Result<()> {
        let details =
            serde_yaml::to_string(&alert.details).unwrap_or_else(|_| "{}".to_owned());
        let text = format!(
            "[{}] {}\n```\n{}```",
            alert.severity, alert.summary, details
        );
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let response = self
            .http
            .post(&url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "Markdown",
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(eyre!("Telegram rejected the message: HTTP {status}: {body}"));
        }
        tracing::info!("Telegram alert sent");
        Ok(())
    }
}

/// Fan-out dispatcher over the enabled channels.
///
/// Channels are independent: one failing is logged and never blocks the
/// other or the monitor loop. Latches are set by the caller before dispatch,
/// so a lost notification stays lost rather than repeating every tick.
pub struct AlertSink {
    channels: Vec<Box<dyn AlertChannel>>,
}

impl AlertSink {
    pub fn new(channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self { channels }
    }

    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
        if config.pagerduty_alerts {
            let routing_key = config
                .pagerduty_routing_key
                .clone()
                .ok_or_else(|| eyre!("pagerduty_routing_key missing"))?;
            channels.push(Box::new(PagerDutyChannel::new(routing_key)));
        }
        if config.telegram_alerts {
            let bot_token = config
                .telegram_bot_token
                .clone()
                .ok_or_else(|| eyre!("telegram_bot_token missing"))?;
            let chat_id = config
                .telegram_chat_id
                .clone()
                .ok_or_else(|| eyre!("telegram_chat_id missing"))?;
            channels.push(Box::new(TelegramChannel::new(bot_token, chat_id)));
        }
        if channels.is_empty() {
            return Err(eyre!("no alert channel enabled"));
        }
        Ok(Self { channels })
    }

    pub async fn dispatch(&self, alert: &Alert) {
        for channel in &self.channels {
            if let Err(err) = channel.send(alert).await {
                tracing::error!(
                    channel = channel.name(),
                    severity = %alert.severity,
                    summary = %alert.summary,
                    error = %err,
                    "failed to deliver alert"
                );
            } else {
                tracing::debug!(
                    channel = channel.name(),
                    summary = %alert.summary,
                    "alert delivered"
                );
            }
        }
    }
}
