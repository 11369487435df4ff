use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Hour,
    Day,
    Week,
}

impl Period {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
        }
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            "week" => Ok(Self::Week),
            other => Err(format!("unknown rollup period: {other}")),
        }
    }
}

/// Floor a timestamp to its period boundary in the reference timezone.
/// Hour buckets floor to the top of the hour, day buckets to local midnight,
/// week buckets to the ISO week's Monday midnight.
pub fn bucket_start(ts: DateTime<Utc>, period: Period, tz: Tz) -> DateTime<Utc> {
    let local = ts.with_timezone(&tz);
    let date = local.date_naive();
    let naive = match period {
        Period::Hour => date.and_hms_opt(local.hour(), 0, 0),
        Period::Day => date.and_hms_opt(0, 0, 0),
        Period::Week => {
            let monday = date - ChronoDuration::days(date.weekday().num_days_from_monday() as i64);
            monday.and_hms_opt(0, 0, 0)
        }
    };
    naive
        .and_then(|naive| tz.from_local_datetime(&naive).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or(ts)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct BucketAgg {
    sum: f64,
    min: f64,
    max: f64,
    count: i64,
}

impl BucketAgg {
    fn mean(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }
}

fn fold_buckets(
    rows: &[(DateTime<Utc>, f64)],
    period: Period,
    tz: Tz,
) -> BTreeMap<DateTime<Utc>, BucketAgg> {
    let mut buckets: BTreeMap<DateTime<Utc>, BucketAgg> = BTreeMap::new();
    for (created_at, value) in rows {
        let start = bucket_start(*created_at, period, tz);
        buckets
            .entry(start)
            .and_modify(|agg| {
                agg.sum += value;
                agg.min = agg.min.min(*value);
                agg.max = agg.max.max(*value);
                agg.count += 1;
            })
            .or_insert(BucketAgg {
                sum: *value,
                min: *value,
                max: *value,
                count: 1,
            });
    }
    buckets
}

async fn aggregate_sensor(
    pool: &PgPool,
    sensor_id: i64,
    period: Period,
    cutoff: DateTime<Utc>,
    tz: Tz,
) -> Result<usize> {
    let rows = store::sensor_values_since(pool, sensor_id, cutoff).await?;
    let buckets = fold_buckets(&rows, period, tz);

    for (start, agg) in &buckets {
        sqlx::query(
            r#"
            INSERT INTO aggregated_readings
                (sensor_id, period, bucket_start, avg_value, min_value, max_value, sample_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (sensor_id, period, bucket_start)
            DO UPDATE SET
                avg_value = EXCLUDED.avg_value,
                min_value = EXCLUDED.min_value,
                max_value = EXCLUDED.max_value,
                sample_count = EXCLUDED.sample_count
            "#,
        )
        .bind(sensor_id)
        .bind(period.as_str())
        .bind(start)
        .bind(agg.mean())
        .bind(agg.min)
        .bind(agg.max)
        .bind(agg.count)
        .execute(pool)
        .await?;
    }

    Ok(buckets.len())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupRun {
    pub sensors: usize,
    pub failed: usize,
    pub buckets: usize,
}

/// Aggregate every sensor's readings at or after `cutoff` into period
/// buckets. Per-sensor failures are logged and do not abort the remaining
/// sensors; re-running over an unchanged window is a no-op on final state.
pub async fn aggregate_all(
    pool: &PgPool,
    period: Period,
    cutoff: DateTime<Utc>,
    tz: Tz,
) -> Result<RollupRun> {
    let sensors = store::list_sensors(pool).await?;
    let mut run = RollupRun {
        sensors: sensors.len(),
        ..RollupRun::default()
    };

    for sensor in &sensors {
        match aggregate_sensor(pool, sensor.id, period, cutoff, tz).await {
            Ok(buckets) => run.buckets += buckets,
            Err(err) => {
                run.failed += 1;
                tracing::warn!(sensor = sensor.id, period = period.as_str(), error = %err,
                    "sensor aggregation failed");
            }
        }
    }

    tracing::info!(
        period = period.as_str(),
        sensors = run.sensors,
        failed = run.failed,
        buckets = run.buckets,
        "rollup pass complete"
    );
    Ok(run)
}

/// Scheduled driver for the aggregator: one tick runs every configured
/// period over the lookback window.
#[derive(Debug, Clone)]
pub struct RollupService {
    pool: PgPool,
    periods: Vec<Period>,
    lookback_hours: i64,
    interval: Duration,
    tz: Tz,
}

impl RollupService {
    pub fn new(
        pool: PgPool,
        periods: Vec<Period>,
        lookback_hours: i64,
        interval: Duration,
        tz: Tz,
    ) -> Self {
        Self {
            pool,
            periods,
            lookback_hours: lookback_hours.max(1),
            interval,
            tz,
        }
    }

    pub fn start(self, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cutoff = Utc::now() - ChronoDuration::hours(self.lookback_hours);
                        for period in &self.periods {
                            if let Err(err) = aggregate_all(&self.pool, *period, cutoff, self.tz).await {
                                tracing::warn!(period = period.as_str(), error = %err, "rollup tick failed");
                            }
                        }
                    }
                }
            }
        });
    }
}
