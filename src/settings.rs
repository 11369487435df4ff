use serde_json::{json, Value as JsonValue};
use sqlx::{PgPool, Row};

/// Process-wide key/value settings backed by the `app_settings` table.
///
/// Every getter is tolerant of a missing table or an unreachable store and
/// falls back to the caller-supplied default instead of failing. Scalars are
/// stored wrapped as `{"v": <scalar>}`; structured values are stored as-is.
#[derive(Clone, Debug)]
pub struct AppSettings {
    pool: PgPool,
}

impl AppSettings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let row = match sqlx::query("SELECT value FROM app_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(err) => {
                tracing::debug!(key, error = %err, "settings lookup failed; using default");
                return None;
            }
        };

        let value: JsonValue = row?.try_get("value").ok()?;
        Some(unwrap_scalar(value))
    }

    pub async fn get_f64(&self, key: &str, default: f64) -> f64 {
        match self.get(key).await {
            Some(value) => coerce_f64(&value).unwrap_or(default),
            None => default,
        }
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get(key).await {
            Some(value) => coerce_f64(&value).map(|v| v as i64).unwrap_or(default),
            None => default,
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.get(key).await {
            Some(JsonValue::String(value)) => value,
            _ => default.to_string(),
        }
    }

    pub async fn set(&self, key: &str, value: JsonValue) -> anyhow::Result<()> {
        let payload = if value.is_object() || value.is_array() {
            value
        } else {
            json!({ "v": value })
        };
        sqlx::query(
            r#"
            INSERT INTO app_settings (key, value)
            VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_many(&self, values: Vec<(String, JsonValue)>) -> anyhow::Result<()> {
        for (key, value) in values {
            self.set(&key, value).await?;
        }
        Ok(())
    }
}

fn unwrap_scalar(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(ref map) if map.contains_key("v") => map
            .get("v")
            .cloned()
            .unwrap_or(JsonValue::Null),
        other => other,
    }
}

fn coerce_f64(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod pg_tests {
    use super::AppSettings;
    use anyhow::Result;
    use serde_json::json;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::PgPool;
    use std::env;

    fn test_database_url() -> Option<String> {
        if env::var("HUB_INTEGRATION_TEST").ok().as_deref() != Some("1") {
            return None;
        }
        env::var("HUB_TEST_DATABASE_URL").ok()
    }

    async fn setup_schema_pool(database_url: &str, schema: &str) -> Result<PgPool> {
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
            .max_connections(2)
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

    #[tokio::test]
    async fn test_missing_table_falls_back_to_defaults() -> Result<()> {
        let Some(database_url) = test_database_url() else {
            return Ok(());
        };
        let schema = format!("hub_test_settings_bare_{}", std::process::id());
        // The schema is created empty: no app_settings table anywhere on
        // the search path.
        let pool = setup_schema_pool(&database_url, &schema).await?;
        let settings = AppSettings::new(pool);

        assert_eq!(settings.get("distributed.z_warn").await, None);
        assert_eq!(settings.get_f64("distributed.z_warn", 2.0).await, 2.0);
        assert_eq!(
            settings.get_i64("distributed.window_minutes", 60).await,
            60
        );
        assert_eq!(settings.get_string("report.mode", "full").await, "full");

        drop_test_schema(&database_url, &schema).await
    }

    #[tokio::test]
    async fn test_set_round_trips_and_overwrites() -> Result<()> {
        let Some(database_url) = test_database_url() else {
            return Ok(());
        };
        let schema = format!("hub_test_settings_rw_{}", std::process::id());
        let pool = setup_schema_pool(&database_url, &schema).await?;
        sqlx::query("CREATE TABLE app_settings (key text primary key, value jsonb not null)")
            .execute(&pool)
            .await?;
        let settings = AppSettings::new(pool);

        settings.set("distributed.z_warn", json!(1.5)).await?;
        assert_eq!(settings.get_f64("distributed.z_warn", 2.0).await, 1.5);

        // Upsert overwrites in place.
        settings.set("distributed.z_warn", json!(4.0)).await?;
        assert_eq!(settings.get_f64("distributed.z_warn", 2.0).await, 4.0);

        settings
            .set_many(vec![
                ("distributed.window_minutes".to_string(), json!(120)),
                ("report.mode".to_string(), json!("compact")),
                ("report.layout".to_string(), json!({"columns": 2})),
            ])
            .await?;
        assert_eq!(
            settings.get_i64("distributed.window_minutes", 60).await,
            120
        );
        assert_eq!(
            settings.get_string("report.mode", "full").await,
            "compact"
        );
        // Structured values are stored unwrapped and come back as-is.
        assert_eq!(
            settings.get("report.layout").await,
            Some(json!({"columns": 2}))
        );

        drop_test_schema(&database_url, &schema).await
    }
}
