use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::{fs, path::Path};

const DEFAULT_MONITORING_INTERVAL_SECS: u64 = 60;
const DEFAULT_PROMETHEUS_HOST: &str = "127.0.0.1";
const DEFAULT_PROMETHEUS_PORT: u16 = 7130;

/// Nibiru operator addresses are bech32 `nibivaloper1...` (50 chars); account
/// addresses are `nibi1...` (43 chars). A mismatch is almost always a pasted
/// address of the wrong kind, but we only warn: prefixes can change on
/// testnets.
const VALIDATOR_ADDRESS_LEN: usize = 50;
const WALLET_ADDRESS_LEN: usize = 43;

/// `config.yml`: what to monitor and where.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub validator_address: String,
    pub price_feed_addr: String,
    #[serde(rename = "APIs")]
    pub apis: Vec<String>,
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: u64,
}

fn default_monitoring_interval() -> u64 {
    DEFAULT_MONITORING_INTERVAL_SECS
}

impl MonitorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read config file {}", path.display()))?;
        let mut config: MonitorConfig = serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        // REST paths are joined with a leading slash.
        for api in &mut config.apis {
            while api.ends_with('/') {
                api.pop();
            }
        }
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.validator_address.trim().is_empty() {
            return Err(eyre!("validator_address must not be empty"));
        }
        if self.price_feed_addr.trim().is_empty() {
            return Err(eyre!("price_feed_addr must not be empty"));
        }
        if self.apis.is_empty() {
            return Err(eyre!("APIs must list at least one endpoint"));
        }
        if self.monitoring_interval == 0 {
            return Err(eyre!("monitoring_interval must be greater than zero"));
        }
        for api in &self.apis {
            if !api.starts_with("http://") && !api.starts_with("https://") {
                return Err(eyre!("API endpoint '{api}' must be an http(s) URL"));
            }
        }
        if self.validator_address.len() != VALIDATOR_ADDRESS_LEN {
            tracing::warn!(
                address = %self.validator_address,
                expected = VALIDATOR_ADDRESS_LEN,
                "validator_address has an unexpected length; is it a valoper address?"
            );
        }
        if self.price_feed_addr.len() != WALLET_ADDRESS_LEN {
            tracing::warn!(
                address = %self.price_feed_addr,
                expected = WALLET_ADDRESS_LEN,
                "price_feed_addr has an unexpected length; is it an account address?"
            );
        }
        Ok(())
    }
}

/// `alert.yml`: where to send alerts, plus the health-check and metrics
/// surfaces.
#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    pub telegram_alerts: bool,
    pub pagerduty_alerts: bool,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
    #[serde(default)]
    pub pagerduty_routing_key: Option<String>,
    #[serde(default)]
    pub health_check_enabled: bool,
    #[serde(default)]
    pub health_check_url: Option<String>,
    #[serde(default)]
    pub health_check_interval: Option<u64>,
    #[serde(default)]
    pub prometheus_client_enabled: bool,
    #[serde(default = "default_prometheus_host")]
    pub prometheus_host: String,
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

fn default_prometheus_host() -> String {
    DEFAULT_PROMETHEUS_HOST.to_owned()
}

fn default_prometheus_port() -> u16 {
    DEFAULT_PROMETHEUS_PORT
}

impl AlertConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read alert file {}", path.display()))?;
        let config: AlertConfig = serde_yaml::from_str(&raw)
            .wrap_err_with(|| format!("failed to parse alert file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.telegram_alerts && !self.pagerduty_alerts {
            return Err(eyre!(
                "no alert channel enabled; enable telegram_alerts or pagerduty_alerts"
            ));
        }
        if self.telegram_alerts {
            if self.telegram_bot_token.as_deref().unwrap_or("").is_empty() {
                return Err(eyre!("telegram_bot_token is required when telegram_alerts is enabled"));
            }
            if self.telegram_chat_id.as_deref().unwrap_or("").is_empty() {
                return Err(eyre!("telegram_chat_id is required when telegram_alerts is enabled"));
            }
        }
        if self.pagerduty_alerts && self.pagerduty_routing_key.as_deref().unwrap_or("").is_empty() {
            return Err(eyre!(
                "pagerduty_routing_key is required when pagerduty_alerts is enabled"
            ));
        }
        if self.health_check_enabled {
            if self.health_check_url.as_deref().unwrap_or("").is_empty() {
                return Err(eyre!("health_check_url is required when health_check_enabled"));
            }
            match self.health_check_interval {
                Some(interval) if interval > 0 => {}
                _ => {
                    return Err(eyre!(
                        "health_check_interval must be a positive number of seconds"
                    ))
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monitor_config_parses_with_defaults() {
        let raw = "validator_address: nibivaloper1abcdefghijklmnopqrstuvwxyz0123456789abcd\n\
                   price_feed_addr: nibi1abcdefghijklmnopqrstuvwxyz0123456789\n\
                   APIs:\n  - https://lcd-1.example.com/\n  - https://lcd-2.example.com\n";
        let mut config: MonitorConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.monitoring_interval, 60);
        // load() strips trailing slashes; mirror it here for the parsed value
        for api in &mut config.apis {
            while api.ends_with('/') {
                api.pop();
            }
        }
        assert_eq!(config.apis[0], "https://lcd-1.example.com");
    }

    #[test]
    fn monitor_config_rejects_empty_api_list() {
        let raw = "validator_address: v\nprice_feed_addr: w\nAPIs: []\n";
        let config: MonitorConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn alert_config_requires_a_channel() {
        let raw = "telegram_alerts: false\npagerduty_alerts: false\n";
        let config: AlertConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn alert_config_requires_channel_credentials() {
        let raw = "telegram_alerts: true\npagerduty_alerts: false\n";
        let config: AlertConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());

        let raw = "telegram_alerts: true\npagerduty_alerts: false\n\
                   telegram_bot_token: t\ntelegram_chat_id: c\n";
        let config: AlertConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn alert_config_health_check_needs_url_and_interval() {
        let raw = "telegram_alerts: false\npagerduty_alerts: true\n\
                   pagerduty_routing_key: k\nhealth_check_enabled: true\n";
        let config: AlertConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.validate().is_err());

        let raw = "telegram_alerts: false\npagerduty_alerts: true\n\
                   pagerduty_routing_key: k\nhealth_check_enabled: true\n\
                   health_check_url: https://hc.example.com/ping\n\
                   health_check_interval: 300\n";
        let config: AlertConfig = serde_yaml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.prometheus_host, "127.0.0.1");
        assert_eq!(config.prometheus_port, 7130);
    }
}
