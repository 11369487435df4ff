use super::{IngestOutcome, ReadingIngestor};
use crate::alerts::AlertChannels;
use crate::live::LiveFeed;
use crate::rollup::{aggregate_all, Period};
use anyhow::Result;
use chrono::{Duration, DurationRound, Utc};
use chrono_tz::Tz;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::env;
use std::future::Future;
use std::sync::{Arc, Mutex};

const TZ: Tz = chrono_tz::Europe::Bucharest;

/// In-memory channels that record every delivery attempt and can be told
/// to fail a channel.
#[derive(Default)]
struct RecordingChannels {
    email_to: Option<String>,
    chat: bool,
    fail_email: bool,
    fail_chat: bool,
    emails: Mutex<Vec<(String, String, String)>>,
    chats: Mutex<Vec<String>>,
}

impl RecordingChannels {
    fn with_email(to: &str) -> Self {
        Self {
            email_to: Some(to.to_string()),
            ..Self::default()
        }
    }
}

impl AlertChannels for RecordingChannels {
    fn email_recipient(&self) -> Option<&str> {
        self.email_to.as_deref()
    }

    fn chat_enabled(&self) -> bool {
        self.chat
    }

    fn send_email(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> impl Future<Output = Result<()>> + Send {
        let record = (to.to_string(), subject.to_string(), body.to_string());
        async move {
            if self.fail_email {
                anyhow::bail!("simulated mail relay outage");
            }
            self.emails.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn send_chat(&self, text: &str) -> impl Future<Output = Result<()>> + Send {
        let text = text.to_string();
        async move {
            if self.fail_chat {
                anyhow::bail!("simulated webhook outage");
            }
            self.chats.lock().unwrap().push(text);
            Ok(())
        }
    }
}

fn test_database_url() -> Option<String> {
    if env::var("HUB_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("HUB_TEST_DATABASE_URL").ok()
}

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {}", schema))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensors (
            id bigserial primary key,
            node_id text not null,
            sensor_type text not null,
            name text not null,
            description text null,
            unit text not null default '',
            mqtt_topic text not null unique,
            is_active boolean null
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_readings (
            id bigserial primary key,
            sensor_id bigint not null,
            value double precision not null,
            raw_data jsonb null,
            created_at timestamptz not null default now()
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_thresholds (
            id bigserial primary key,
            sensor_id bigint null,
            sensor_type text null,
            direction text not null,
            value double precision not null,
            notify_email boolean not null default false,
            notify_chat boolean not null default false,
            enabled boolean not null default true
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id bigserial primary key,
            sensor_id bigint not null,
            sensor_reading_id bigint not null,
            sensor_type text not null,
            direction text not null,
            threshold_value double precision not null,
            actual_value double precision not null,
            status text not null,
            notified_channels jsonb null,
            created_at timestamptz not null default now()
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS aggregated_readings (
            id bigserial primary key,
            sensor_id bigint not null,
            period text not null,
            bucket_start timestamptz not null,
            avg_value double precision not null,
            min_value double precision not null,
            max_value double precision not null,
            sample_count bigint not null,
            unique (sensor_id, period, bucket_start)
        )
        "#,
    )
    .execute(&pool)
    .await?;
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS app_settings (
            key text primary key,
            value jsonb not null
        )
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

async fn drop_test_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    Ok(())
}

async fn seed_sensor(
    pool: &PgPool,
    node_id: &str,
    sensor_type: &str,
    name: &str,
    unit: &str,
    topic: &str,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sensors (node_id, sensor_type, name, description, unit, mqtt_topic, is_active)
        VALUES ($1, $2, $3, $6, $4, $5, TRUE)
        RETURNING id
        "#,
    )
    .bind(node_id)
    .bind(sensor_type)
    .bind(name)
    .bind(unit)
    .bind(topic)
    .bind(format!("{name} on {node_id}"))
    .fetch_one(pool)
    .await?;
    Ok(id)
}

fn ingestor(pool: PgPool, channels: Arc<RecordingChannels>) -> ReadingIngestor<RecordingChannels> {
    ReadingIngestor::new(pool, channels, LiveFeed::new(16), TZ)
}

#[tokio::test]
async fn test_ingest_crossing_creates_one_alert() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("hub_test_ingest_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let sensor_id = seed_sensor(
        &pool,
        "esp32_node1",
        "temperatura",
        "temp-1",
        "°C",
        "iot/esp32_node1/temperatura",
    )
    .await?;
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_id, direction, value, notify_email) VALUES ($1, 'above', 28.0, TRUE)",
    )
    .bind(sensor_id)
    .execute(&pool)
    .await?;

    let channels = Arc::new(RecordingChannels::with_email("ops@example.com"));
    let ingestor = ingestor(pool.clone(), channels.clone());

    let mut payload = br#"{"value": 30.0, "rssi": -61}"#.to_vec();
    let outcome = ingestor
        .handle_message("iot/esp32_node1/temperatura", &mut payload)
        .await?;
    assert_eq!(
        outcome,
        IngestOutcome::Stored {
            sensor_id,
            alerts: 1
        }
    );

    let raw: JsonValue =
        sqlx::query_scalar("SELECT raw_data FROM sensor_readings WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(raw["value"], 30.0);
    assert_eq!(raw["rssi"], -61);

    let alert = sqlx::query(
        r#"
        SELECT direction, threshold_value, actual_value, status, notified_channels
        FROM alerts WHERE sensor_id = $1
        "#,
    )
    .bind(sensor_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(alert.get::<String, _>("direction"), "above");
    assert_eq!(alert.get::<f64, _>("threshold_value"), 28.0);
    assert_eq!(alert.get::<f64, _>("actual_value"), 30.0);
    assert_eq!(alert.get::<String, _>("status"), "new");
    assert_eq!(
        alert.get::<JsonValue, _>("notified_channels"),
        serde_json::json!(["email"])
    );

    let emails = channels.emails.lock().unwrap();
    assert_eq!(emails.len(), 1);
    assert_eq!(emails[0].0, "ops@example.com");
    assert!(emails[0].1.contains("temp-1"));

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_specific_and_type_thresholds_fire_independently() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("hub_test_thresholds_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let sensor_id = seed_sensor(
        &pool,
        "esp32_node1",
        "temperatura",
        "temp-1",
        "°C",
        "iot/esp32_node1/temperatura",
    )
    .await?;
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_id, direction, value) VALUES ($1, 'above', 28.0)",
    )
    .bind(sensor_id)
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_type, direction, value) VALUES ('temperatura', 'above', 25.0)",
    )
    .execute(&pool)
    .await?;
    // Disabled and non-crossing thresholds stay silent.
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_id, direction, value, enabled) VALUES ($1, 'above', 1.0, FALSE)",
    )
    .bind(sensor_id)
    .execute(&pool)
    .await?;
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_id, direction, value) VALUES ($1, 'below', 10.0)",
    )
    .bind(sensor_id)
    .execute(&pool)
    .await?;

    let ingestor = ingestor(pool.clone(), Arc::new(RecordingChannels::default()));
    let mut payload = br#"{"value": 30}"#.to_vec();
    let outcome = ingestor
        .handle_message("iot/esp32_node1/temperatura", &mut payload)
        .await?;
    assert_eq!(
        outcome,
        IngestOutcome::Stored {
            sensor_id,
            alerts: 2
        }
    );

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts WHERE sensor_id = $1")
        .bind(sensor_id)
        .fetch_one(&pool)
        .await?;
    assert_eq!(count, 2);

    // No channels were configured, so the succeeded set is empty but
    // persisted.
    let channels: Vec<JsonValue> =
        sqlx::query_scalar("SELECT notified_channels FROM alerts WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_all(&pool)
            .await?;
    for value in channels {
        assert_eq!(value, serde_json::json!([]));
    }

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_failed_channel_leaves_alert_with_empty_channels() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("hub_test_chanfail_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let sensor_id = seed_sensor(
        &pool,
        "esp32_node3",
        "curent",
        "acs-1",
        "A",
        "iot/esp32_node3/curent",
    )
    .await?;
    sqlx::query(
        "INSERT INTO sensor_thresholds (sensor_id, direction, value, notify_email, notify_chat) VALUES ($1, 'above', 5.0, TRUE, TRUE)",
    )
    .bind(sensor_id)
    .execute(&pool)
    .await?;

    let channels = Arc::new(RecordingChannels {
        email_to: Some("ops@example.com".to_string()),
        chat: true,
        fail_email: true,
        fail_chat: false,
        ..RecordingChannels::default()
    });
    let ingestor = ingestor(pool.clone(), channels.clone());

    let mut payload = br#"{"value": 9.5}"#.to_vec();
    let outcome = ingestor
        .handle_message("iot/esp32_node3/curent", &mut payload)
        .await?;
    assert_eq!(
        outcome,
        IngestOutcome::Stored {
            sensor_id,
            alerts: 1
        }
    );

    // Email failed but chat still went through and only chat is recorded.
    let notified: JsonValue =
        sqlx::query_scalar("SELECT notified_channels FROM alerts WHERE sensor_id = $1")
            .bind(sensor_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(notified, serde_json::json!(["chat"]));
    assert_eq!(channels.chats.lock().unwrap().len(), 1);
    assert!(channels.emails.lock().unwrap().is_empty());

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_unroutable_messages_store_nothing() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("hub_test_unroutable_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    seed_sensor(
        &pool,
        "esp32_node2",
        "umiditate_sol",
        "soil-1",
        "ADC",
        "iot/esp32_node2/umiditate_sol",
    )
    .await?;
    // Inactive sensors are not routable.
    sqlx::query("UPDATE sensors SET is_active = FALSE WHERE mqtt_topic = $1")
        .bind("iot/esp32_node2/umiditate_sol")
        .execute(&pool)
        .await?;

    let ingestor = ingestor(pool.clone(), Arc::new(RecordingChannels::default()));

    let mut unknown = br#"{"value": 1.0}"#.to_vec();
    assert_eq!(
        ingestor.handle_message("iot/nowhere/temp", &mut unknown).await?,
        IngestOutcome::UnknownTopic
    );

    let mut inactive = br#"{"value": 1.0}"#.to_vec();
    assert_eq!(
        ingestor
            .handle_message("iot/esp32_node2/umiditate_sol", &mut inactive)
            .await?,
        IngestOutcome::UnknownTopic
    );

    let mut malformed = b"{not json".to_vec();
    assert_eq!(
        ingestor
            .handle_message("iot/esp32_node2/umiditate_sol", &mut malformed)
            .await?,
        IngestOutcome::BadPayload
    );

    let mut no_value = br#"{"reading": 4}"#.to_vec();
    assert_eq!(
        ingestor
            .handle_message("iot/esp32_node2/umiditate_sol", &mut no_value)
            .await?,
        IngestOutcome::BadPayload
    );

    let readings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_readings")
        .fetch_one(&pool)
        .await?;
    assert_eq!(readings, 0);

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn test_rollup_is_idempotent() -> Result<()> {
    let Some(database_url) = test_database_url() else {
        return Ok(());
    };
    let schema = format!("hub_test_rollup_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let sensor_id = seed_sensor(
        &pool,
        "esp32_node1",
        "temperatura",
        "temp-1",
        "°C",
        "iot/esp32_node1/temperatura",
    )
    .await?;

    // Anchor on an hour boundary so the first three readings share a bucket.
    let base = (Utc::now() - Duration::hours(2)).duration_trunc(Duration::hours(1))?;
    for (offset_minutes, value) in [(0i64, 10.0f64), (10, 20.0), (20, 30.0), (70, 5.0)] {
        sqlx::query(
            "INSERT INTO sensor_readings (sensor_id, value, created_at) VALUES ($1, $2, $3)",
        )
        .bind(sensor_id)
        .bind(value)
        .bind(base + Duration::minutes(offset_minutes))
        .execute(&pool)
        .await?;
    }

    let cutoff = Utc::now() - Duration::hours(48);
    let first = aggregate_all(&pool, Period::Hour, cutoff, TZ).await?;
    assert_eq!(first.failed, 0);
    assert!(first.buckets >= 2);

    async fn snapshot(pool: &PgPool) -> sqlx::Result<Vec<(i64, String, f64, f64, f64, i64)>> {
        sqlx::query_as(
            r#"
            SELECT sensor_id, period, avg_value, min_value, max_value, sample_count
            FROM aggregated_readings
            ORDER BY sensor_id, period, bucket_start
            "#,
        )
        .fetch_all(pool)
        .await
    }

    let rows_first = snapshot(&pool).await?;
    let second = aggregate_all(&pool, Period::Hour, cutoff, TZ).await?;
    assert_eq!(second.failed, 0);
    let rows_second = snapshot(&pool).await?;
    assert_eq!(rows_first, rows_second);

    // The two-hour-old bucket averaged its three readings.
    let full_bucket = rows_first
        .iter()
        .find(|row| row.5 == 3)
        .expect("expected a three-sample bucket");
    assert_eq!(full_bucket.2, 20.0);
    assert_eq!(full_bucket.3, 10.0);
    assert_eq!(full_bucket.4, 30.0);

    drop_test_schema(&database_url, &schema).await
}
