use anyhow::Result;
use chrono_tz::Tz;
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

use crate::alerts::{self, AlertChannels};
use crate::live::{LiveFeed, ReadingEvent};
use crate::store;

pub mod mqtt;
#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("payload has no numeric value field")]
    MissingValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { sensor_id: i64, alerts: usize },
    UnknownTopic,
    BadPayload,
}

/// Decode a transport payload into its numeric `value` and the full decoded
/// object, preserved verbatim as the reading's raw side-channel.
pub(crate) fn decode_payload(payload: &mut [u8]) -> Result<(f64, JsonValue), DecodeError> {
    let raw: JsonValue = simd_json::serde::from_slice(payload)
        .map_err(|err| DecodeError::Malformed(err.to_string()))?;
    if !raw.is_object() {
        return Err(DecodeError::NotAnObject);
    }
    let value = raw
        .get("value")
        .and_then(JsonValue::as_f64)
        .ok_or(DecodeError::MissingValue)?;
    Ok((value, raw))
}

/// Routes one transport message to completion: decode, resolve the sensor by
/// routing key, persist the reading, evaluate alerts, publish the live event.
pub struct ReadingIngestor<C> {
    pool: PgPool,
    channels: Arc<C>,
    live: LiveFeed,
    tz: Tz,
}

impl<C> Clone for ReadingIngestor<C> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            channels: self.channels.clone(),
            live: self.live.clone(),
            tz: self.tz,
        }
    }
}

impl<C: AlertChannels> ReadingIngestor<C> {
    pub fn new(pool: PgPool, channels: Arc<C>, live: LiveFeed, tz: Tz) -> Self {
        Self {
            pool,
            channels,
            live,
            tz,
        }
    }

    /// Contract begins at "message received": decode failures and unknown
    /// routing keys drop the message with a warning and never fail the loop.
    /// Only a store failure surfaces as an error to the caller.
    pub async fn handle_message(&self, topic: &str, payload: &mut [u8]) -> Result<IngestOutcome> {
        let (value, raw) = match decode_payload(payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                tracing::warn!(topic, error = %err, "dropping message");
                return Ok(IngestOutcome::BadPayload);
            }
        };

        let sensor = match store::find_active_sensor_by_topic(&self.pool, topic).await? {
            Some(sensor) => sensor,
            None => {
                tracing::warn!(topic, "no active sensor for topic");
                return Ok(IngestOutcome::UnknownTopic);
            }
        };

        let reading = store::insert_reading(&self.pool, sensor.id, value, &raw).await?;

        // The reading is already persisted; a failed evaluation must not
        // undo it or stall the loop.
        let alerts = match alerts::evaluate_reading(
            &self.pool,
            self.channels.as_ref(),
            &sensor,
            &reading,
            self.tz,
        )
        .await
        {
            Ok(count) => count,
            Err(err) => {
                tracing::warn!(sensor = sensor.id, error = %err, "alert evaluation failed");
                0
            }
        };

        self.live.publish(ReadingEvent {
            sensor_id: sensor.id,
            sensor_type: sensor.sensor_type.clone(),
            name: sensor.name.clone(),
            unit: sensor.unit.clone(),
            value,
            recorded_at: reading.created_at,
        });

        tracing::debug!(
            sensor = sensor.id,
            topic,
            value,
            alerts,
            "stored reading"
        );
        Ok(IngestOutcome::Stored {
            sensor_id: sensor.id,
            alerts,
        })
    }
}
