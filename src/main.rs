use anyhow::Result;
use futures::future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use telemetry_hub::alerts::notify::HttpChannels;
use telemetry_hub::config::Config;
use telemetry_hub::ingest::{mqtt, ReadingIngestor};
use telemetry_hub::insights::{InsightsEngine, Topology};
use telemetry_hub::live::LiveFeed;
use telemetry_hub::rollup::RollupService;
use telemetry_hub::settings::AppSettings;
use telemetry_hub::store;

fn init_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telemetry_hub=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn load_topology(config: &Config) -> Topology {
    match &config.topology_path {
        Some(path) => match Topology::from_file(path) {
            Ok(topology) => topology,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err,
                    "failed to load topology file; using built-in layout");
                Topology::default()
            }
        },
        None => Topology::default(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Config parsing warns about bad values, so the subscriber goes first.
    init_tracing()?;
    let config = Config::from_env()?;

    let pool = store::build_pool(&config.database_url, config.db_pool_size).await?;
    let settings = AppSettings::new(pool.clone());
    let live = LiveFeed::new(256);
    let channels = Arc::new(HttpChannels::from_config(&config));
    let ingestor = ReadingIngestor::new(
        pool.clone(),
        channels,
        live.clone(),
        config.reference_timezone,
    );

    let cancel = CancellationToken::new();

    RollupService::new(
        pool.clone(),
        config.rollup_periods.clone(),
        config.rollup_lookback_hours,
        config.rollup_interval(),
        config.reference_timezone,
    )
    .start(cancel.clone());

    let insights = InsightsEngine::new(
        pool.clone(),
        settings.clone(),
        load_topology(&config),
        config.reference_timezone,
        config.insights_read_timeout(),
    );
    let insights_handle = {
        let interval = std::time::Duration::from_secs(config.insights_log_interval_secs.max(30));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match insights.compute(None, None, None, None, None).await {
                    Ok(report) => tracing::info!(
                        score = report.distributed_health.score,
                        completeness = report.distributed_health.completeness,
                        skew_seconds = report.distributed_health.skew_seconds,
                        warn = report.anomalies.warn_count,
                        critical = report.anomalies.critical_count,
                        "fleet health"
                    ),
                    Err(err) => tracing::warn!(error = %err, "fleet health computation failed"),
                }
            }
        })
    };

    let mqtt_handle = if config.enable_mqtt_listener {
        let config_clone = config.clone();
        let ingestor_clone = ingestor.clone();
        Some(tokio::spawn(async move {
            mqtt::run_listener(config_clone, ingestor_clone).await
        }))
    } else {
        None
    };

    tokio::select! {
        _ = async {
            if let Some(handle) = mqtt_handle {
                if let Err(err) = handle.await { tracing::warn!(error=%err, "MQTT task failed"); }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    insights_handle.abort();

    Ok(())
}
