use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};

/// A logical measurement source, uniquely routable by its MQTT topic.
#[derive(Debug, Clone, FromRow)]
pub struct Sensor {
    pub id: i64,
    pub node_id: String,
    pub sensor_type: String,
    pub name: String,
    pub description: Option<String>,
    pub unit: String,
    pub mqtt_topic: String,
    // NULL is tolerated and treated as active; older seeders left it unset.
    pub is_active: Option<bool>,
}

/// One immutable timestamped observation. `created_at` is truth-of-record.
#[derive(Debug, Clone, FromRow)]
pub struct Reading {
    pub id: i64,
    pub sensor_id: i64,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

pub async fn build_pool(database_url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn find_active_sensor_by_topic(pool: &PgPool, topic: &str) -> Result<Option<Sensor>> {
    let sensor: Option<Sensor> = sqlx::query_as(
        r#"
        SELECT id, node_id, sensor_type, name, description, unit, mqtt_topic, is_active
        FROM sensors
        WHERE mqtt_topic = $1
          AND is_active IS DISTINCT FROM FALSE
        "#,
    )
    .bind(topic)
    .fetch_optional(pool)
    .await?;
    Ok(sensor)
}

pub async fn list_sensors(pool: &PgPool) -> Result<Vec<Sensor>> {
    let sensors: Vec<Sensor> = sqlx::query_as(
        r#"
        SELECT id, node_id, sensor_type, name, description, unit, mqtt_topic, is_active
        FROM sensors
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(sensors)
}

pub async fn list_active_sensors(pool: &PgPool) -> Result<Vec<Sensor>> {
    let sensors: Vec<Sensor> = sqlx::query_as(
        r#"
        SELECT id, node_id, sensor_type, name, description, unit, mqtt_topic, is_active
        FROM sensors
        WHERE is_active IS DISTINCT FROM FALSE
        ORDER BY id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(sensors)
}

pub async fn insert_reading(
    pool: &PgPool,
    sensor_id: i64,
    value: f64,
    raw_data: &JsonValue,
) -> Result<Reading> {
    let reading: Reading = sqlx::query_as(
        r#"
        INSERT INTO sensor_readings (sensor_id, value, raw_data, created_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id, sensor_id, value, created_at
        "#,
    )
    .bind(sensor_id)
    .bind(value)
    .bind(raw_data)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;
    Ok(reading)
}

/// All readings at or after `start`, oldest first, across every sensor.
pub async fn readings_since(pool: &PgPool, start: DateTime<Utc>) -> Result<Vec<Reading>> {
    let readings: Vec<Reading> = sqlx::query_as(
        r#"
        SELECT id, sensor_id, value, created_at
        FROM sensor_readings
        WHERE created_at >= $1
        ORDER BY created_at ASC
        "#,
    )
    .bind(start)
    .fetch_all(pool)
    .await?;
    Ok(readings)
}

pub async fn sensor_values_since(
    pool: &PgPool,
    sensor_id: i64,
    start: DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, f64)>> {
    let rows: Vec<(DateTime<Utc>, f64)> = sqlx::query_as(
        r#"
        SELECT created_at, value
        FROM sensor_readings
        WHERE sensor_id = $1
          AND created_at >= $2
        ORDER BY created_at ASC
        "#,
    )
    .bind(sensor_id)
    .bind(start)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
