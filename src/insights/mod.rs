pub mod params;
pub mod report;
pub mod series;
pub mod topology;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use sqlx::PgPool;
use std::time::Duration;

use crate::settings::AppSettings;
use crate::store;

pub use params::InsightsParams;
pub use report::Report;
pub use topology::Topology;

/// Computes fleet-health reports on demand. Reads are bounded by a timeout;
/// the analysis itself is a pure function of what was read.
#[derive(Clone)]
pub struct InsightsEngine {
    pool: PgPool,
    settings: AppSettings,
    topology: Topology,
    tz: Tz,
    read_timeout: Duration,
}

impl InsightsEngine {
    pub fn new(
        pool: PgPool,
        settings: AppSettings,
        topology: Topology,
        tz: Tz,
        read_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            settings,
            topology,
            tz,
            read_timeout,
        }
    }

    /// Compute a report for the trailing window ending now. `None` overrides
    /// fall back to stored settings, then to built-in defaults; everything
    /// is clamped before use.
    pub async fn compute(
        &self,
        window_minutes: Option<i64>,
        tz: Option<Tz>,
        z_warn: Option<f64>,
        z_critical: Option<f64>,
        staleness_threshold_s: Option<i64>,
    ) -> Result<Report> {
        let params = InsightsParams::resolve(
            &self.settings,
            window_minutes,
            z_warn,
            z_critical,
            staleness_threshold_s,
        )
        .await;
        let tz = tz.unwrap_or(self.tz);

        let now = Utc::now();
        let start = now - ChronoDuration::minutes(params.window_minutes);

        let (sensors, readings) = tokio::time::timeout(self.read_timeout, async {
            let sensors = store::list_active_sensors(&self.pool).await?;
            let readings = store::readings_since(&self.pool, start).await?;
            Ok::<_, anyhow::Error>((sensors, readings))
        })
        .await
        .context("insights read phase timed out")??;

        Ok(report::build(
            now,
            &sensors,
            &readings,
            &params,
            &self.topology,
            tz,
        ))
    }
}
