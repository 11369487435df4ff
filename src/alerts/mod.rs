use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::json;
use sqlx::{FromRow, PgPool};
use std::str::FromStr;

use crate::store::{Reading, Sensor};

pub mod notify;

pub use notify::{AlertChannels, HttpChannels};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Above => "above",
            Self::Below => "below",
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "above" => Ok(Self::Above),
            "below" => Ok(Self::Below),
            other => Err(format!("unknown threshold direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct ThresholdRow {
    id: i64,
    direction: String,
    value: f64,
    notify_email: bool,
    notify_chat: bool,
}

pub fn crossed(direction: Direction, value: f64, bound: f64) -> bool {
    match direction {
        Direction::Above => value > bound,
        Direction::Below => value < bound,
    }
}

/// Evaluate every enabled threshold matching a freshly persisted reading and
/// create one alert per crossing. Returns the number of alerts created.
///
/// Matching is sensor-specific OR type-fallback; when both kinds match they
/// fire independently. Repeated crossings are not deduplicated: every
/// qualifying reading produces a new alert.
pub async fn evaluate_reading<C: AlertChannels>(
    pool: &PgPool,
    channels: &C,
    sensor: &Sensor,
    reading: &Reading,
    tz: Tz,
) -> Result<usize> {
    let thresholds: Vec<ThresholdRow> = sqlx::query_as(
        r#"
        SELECT id, direction, value, notify_email, notify_chat
        FROM sensor_thresholds
        WHERE enabled = TRUE
          AND (sensor_id = $1 OR (sensor_id IS NULL AND sensor_type = $2))
        ORDER BY id ASC
        "#,
    )
    .bind(sensor.id)
    .bind(&sensor.sensor_type)
    .fetch_all(pool)
    .await?;

    let mut created = 0usize;
    for threshold in thresholds {
        let direction = match threshold.direction.parse::<Direction>() {
            Ok(direction) => direction,
            Err(err) => {
                tracing::warn!(threshold = threshold.id, %err, "skipping threshold");
                continue;
            }
        };
        if !crossed(direction, reading.value, threshold.value) {
            continue;
        }

        let alert_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO alerts
                (sensor_id, sensor_reading_id, sensor_type, direction,
                 threshold_value, actual_value, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'new', $7)
            RETURNING id
            "#,
        )
        .bind(sensor.id)
        .bind(reading.id)
        .bind(&sensor.sensor_type)
        .bind(direction.as_str())
        .bind(threshold.value)
        .bind(reading.value)
        .bind(Utc::now())
        .fetch_one(pool)
        .await?;
        created += 1;

        notify_alert(
            pool,
            channels,
            sensor,
            reading,
            direction,
            threshold.value,
            threshold.notify_email,
            threshold.notify_chat,
            alert_id,
            tz,
        )
        .await?;
    }

    Ok(created)
}

/// Attempt every enabled channel, isolating per-channel failures, then
/// persist the succeeded set in a single write once all attempts are done.
#[allow(clippy::too_many_arguments)]
async fn notify_alert<C: AlertChannels>(
    pool: &PgPool,
    channels: &C,
    sensor: &Sensor,
    reading: &Reading,
    direction: Direction,
    threshold_value: f64,
    notify_email: bool,
    notify_chat: bool,
    alert_id: i64,
    tz: Tz,
) -> Result<()> {
    let mut notified: Vec<&str> = Vec::new();

    if notify_email {
        if let Some(to) = channels.email_recipient() {
            let subject = alert_subject(sensor, direction, threshold_value, reading.value);
            let body = alert_body(
                sensor,
                direction,
                threshold_value,
                reading.value,
                reading.created_at,
                tz,
            );
            match channels.send_email(to, &subject, &body).await {
                Ok(()) => notified.push("email"),
                Err(err) => {
                    tracing::warn!(alert = alert_id, error = %err, "email notification failed")
                }
            }
        }
    }

    if notify_chat && channels.chat_enabled() {
        let text = chat_text(
            sensor,
            direction,
            threshold_value,
            reading.value,
            reading.created_at,
            tz,
        );
        match channels.send_chat(&text).await {
            Ok(()) => notified.push("chat"),
            Err(err) => {
                tracing::warn!(alert = alert_id, error = %err, "chat notification failed")
            }
        }
    }

    sqlx::query("UPDATE alerts SET notified_channels = $2 WHERE id = $1")
        .bind(alert_id)
        .bind(json!(notified))
        .execute(pool)
        .await?;

    Ok(())
}

fn alert_subject(sensor: &Sensor, direction: Direction, bound: f64, actual: f64) -> String {
    format!(
        "[ALERT] {} {} threshold {} {} (actual: {} {})",
        sensor.name,
        sensor.sensor_type,
        direction.as_str(),
        bound,
        actual,
        sensor.unit
    )
}

fn alert_body(
    sensor: &Sensor,
    direction: Direction,
    bound: f64,
    actual: f64,
    when: DateTime<Utc>,
    tz: Tz,
) -> String {
    format!(
        "Sensor: {} ({})\nDirection: {}\nThreshold: {}\nActual: {} {}\nWhen: {}\n",
        sensor.name,
        sensor.sensor_type,
        direction.as_str(),
        bound,
        actual,
        sensor.unit,
        when.with_timezone(&tz).format("%d.%m.%Y %H:%M:%S")
    )
}

fn chat_text(
    sensor: &Sensor,
    direction: Direction,
    bound: f64,
    actual: f64,
    when: DateTime<Utc>,
    tz: Tz,
) -> String {
    format!(
        "ALERT {}: {} {} {} (actual: {} {}) at {}",
        sensor.name,
        sensor.sensor_type,
        direction.as_str(),
        bound,
        actual,
        sensor.unit,
        when.with_timezone(&tz).format("%d.%m.%Y %H:%M:%S")
    )
}
