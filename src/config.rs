use anyhow::{Context, Result};
use chrono_tz::Tz;
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::rollup::Period;

const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::Bucharest;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_client_id: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_topic_filter: String,
    pub enable_mqtt_listener: bool,
    pub reference_timezone: Tz,
    pub rollup_interval_secs: u64,
    pub rollup_lookback_hours: i64,
    pub rollup_periods: Vec<Period>,
    pub alert_email_to: Option<String>,
    pub mail_relay_url: Option<String>,
    pub mail_relay_token: Option<String>,
    pub chat_webhook_url: Option<String>,
    pub chat_webhook_token: Option<String>,
    /// Hook for a future repeated-alert debounce; 0 disables it and no
    /// suppression is performed (every crossing alerts).
    pub alert_debounce_seconds: u64,
    pub insights_read_timeout_secs: u64,
    pub insights_log_interval_secs: u64,
    pub topology_path: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let database_url = env::var("HUB_DATABASE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("HUB_DATABASE_URL or DATABASE_URL is required")?;

        let db_pool_size = env::var("HUB_DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);

        let mqtt_host = env::var("HUB_MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let mqtt_port = env::var("HUB_MQTT_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(1883);
        let mqtt_username = env::var("HUB_MQTT_USERNAME").ok();
        let mqtt_password = env::var("HUB_MQTT_PASSWORD").ok();
        let mqtt_client_id = env::var("HUB_MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("telemetry-hub-{}", std::process::id()));
        let mqtt_keepalive_secs = env::var("HUB_MQTT_KEEPALIVE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let mqtt_topic_filter =
            env::var("HUB_MQTT_TOPIC_FILTER").unwrap_or_else(|_| "iot/#".to_string());
        let enable_mqtt_listener = env::var("HUB_ENABLE_MQTT")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let reference_timezone = match env::var("HUB_TIMEZONE") {
            Ok(raw) => match raw.trim().parse::<Tz>() {
                Ok(tz) => tz,
                Err(_) => {
                    tracing::warn!(timezone = %raw, "unknown HUB_TIMEZONE; using default");
                    DEFAULT_TIMEZONE
                }
            },
            Err(_) => DEFAULT_TIMEZONE,
        };

        let rollup_interval_secs = env::var("HUB_ROLLUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);
        let rollup_lookback_hours = env::var("HUB_ROLLUP_LOOKBACK_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(48);
        let rollup_periods = parse_periods(
            env::var("HUB_ROLLUP_PERIODS")
                .unwrap_or_else(|_| "hour".to_string())
                .as_str(),
        );

        let alert_email_to = non_empty(env::var("HUB_ALERT_EMAIL_TO").ok());
        let mail_relay_url = non_empty(env::var("HUB_MAIL_RELAY_URL").ok());
        let mail_relay_token = non_empty(env::var("HUB_MAIL_RELAY_TOKEN").ok());
        let chat_webhook_url = non_empty(env::var("HUB_CHAT_WEBHOOK_URL").ok());
        let chat_webhook_token = non_empty(env::var("HUB_CHAT_WEBHOOK_TOKEN").ok());

        let alert_debounce_seconds = env::var("HUB_ALERT_DEBOUNCE_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let insights_read_timeout_secs = env::var("HUB_INSIGHTS_READ_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10);
        let insights_log_interval_secs = env::var("HUB_INSIGHTS_LOG_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);
        let topology_path = non_empty(env::var("HUB_TOPOLOGY_PATH").ok()).map(PathBuf::from);

        Ok(Self {
            database_url,
            db_pool_size,
            mqtt_host,
            mqtt_port,
            mqtt_username,
            mqtt_password,
            mqtt_client_id,
            mqtt_keepalive_secs,
            mqtt_topic_filter,
            enable_mqtt_listener,
            reference_timezone,
            rollup_interval_secs,
            rollup_lookback_hours,
            rollup_periods,
            alert_email_to,
            mail_relay_url,
            mail_relay_token,
            chat_webhook_url,
            chat_webhook_token,
            alert_debounce_seconds,
            insights_read_timeout_secs,
            insights_log_interval_secs,
            topology_path,
        })
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn rollup_interval(&self) -> Duration {
        Duration::from_secs(self.rollup_interval_secs.max(60))
    }

    pub fn insights_read_timeout(&self) -> Duration {
        Duration::from_secs(self.insights_read_timeout_secs.max(1))
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_periods(raw: &str) -> Vec<Period> {
    let mut periods: Vec<Period> = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<Period>() {
            Ok(period) => {
                if !periods.contains(&period) {
                    periods.push(period);
                }
            }
            Err(_) => tracing::warn!(period = %part, "ignoring unknown rollup period"),
        }
    }
    if periods.is_empty() {
        periods.push(Period::Hour);
    }
    periods
}
