use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::insights::params::InsightsParams;
use crate::insights::series::{self, MinuteSeries};
use crate::insights::topology::Topology;
use crate::store::{Reading, Sensor};

const MICROCLIMATE_TYPE: &str = "microclimate";
const MICROCLIMATE_NAME: &str = "Microclimate Index (Temp + 0.1×Hum)";
const MICROCLIMATE_UNIT: &str = "index";
const MICROCLIMATE_LABEL: &str = "Microclimate";

const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Ok,
    Warn,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSummary {
    pub sensor_type: String,
    pub sensor_name: String,
    pub unit: String,
    pub latest: Option<f64>,
    pub mean: Option<f64>,
    pub std: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub z: Option<f64>,
    pub severity: Option<Severity>,
    pub count: usize,
    pub availability: f64,
    pub missing_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSummary {
    pub node_id: String,
    pub label: String,
    /// Rendered in the reference timezone; "Never" when the window holds no
    /// reading for this node.
    pub last_update: String,
    pub staleness_seconds: Option<i64>,
    pub throughput_rpm: f64,
    pub availability: f64,
    pub missing_minutes: i64,
    pub metrics: Vec<MetricSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOffset {
    pub node_id: String,
    pub label: String,
    pub offset_from_freshest_seconds: Option<i64>,
    pub staleness_seconds: Option<i64>,
    pub availability: f64,
    pub missing_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeDiagnostics {
    pub freshest_node_timestamp: Option<String>,
    pub node_offsets: Vec<NodeOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationRow {
    pub a: String,
    pub b: String,
    pub r: f64,
    pub n: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnomalyCounts {
    pub warn_count: usize,
    pub critical_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ThresholdBlock {
    pub z_warn: f64,
    pub z_critical: f64,
    pub staleness_threshold_s: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthBlock {
    pub score: i64,
    pub completeness: f64,
    pub skew_seconds: i64,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub computed_at: String,
    pub window_minutes: i64,
    pub thresholds: ThresholdBlock,
    pub anomalies: AnomalyCounts,
    pub raw_readings_count: usize,
    pub bucket_count: usize,
    pub node_summaries: Vec<NodeSummary>,
    pub node_diagnostics: NodeDiagnostics,
    pub correlations: Vec<CorrelationRow>,
    pub distributed_health: HealthBlock,
}

fn format_ts(ts: DateTime<Utc>, tz: Tz) -> String {
    ts.with_timezone(&tz).format(TIMESTAMP_FORMAT).to_string()
}

struct SeverityTally {
    warn: usize,
    critical: usize,
}

impl SeverityTally {
    fn classify(&mut self, z: Option<f64>, params: &InsightsParams) -> Option<Severity> {
        let z = z?;
        let az = z.abs();
        Some(if az >= params.z_critical {
            self.critical += 1;
            Severity::Critical
        } else if az >= params.z_warn {
            self.warn += 1;
            Severity::Warn
        } else {
            Severity::Ok
        })
    }
}

fn availability(minutes_with_data: usize, window_minutes: i64) -> f64 {
    if window_minutes > 0 {
        series::round_to(
            (minutes_with_data as f64 / window_minutes as f64).min(1.0),
            3,
        )
    } else {
        0.0
    }
}

fn missing_minutes(minutes_with_data: usize, window_minutes: i64) -> i64 {
    (window_minutes - minutes_with_data as i64).max(0)
}

fn correlation_row(
    a_label: &str,
    a_series: &MinuteSeries,
    b_label: &str,
    b_series: &MinuteSeries,
) -> Option<CorrelationRow> {
    let keys = series::common_keys(&[a_series, b_series]);
    if keys.len() < 5 {
        return None;
    }

    let xs: Vec<f64> = keys.iter().filter_map(|k| a_series.get(k).copied()).collect();
    let ys: Vec<f64> = keys.iter().filter_map(|k| b_series.get(k).copied()).collect();
    let r = series::pearson(&xs, &ys)?;

    Some(CorrelationRow {
        a: a_label.to_string(),
        b: b_label.to_string(),
        r,
        n: keys.len(),
    })
}

fn signal_series<'a>(
    sensor_index: &HashMap<String, HashMap<&str, &Sensor>>,
    series_by_sensor: &'a HashMap<i64, MinuteSeries>,
    empty: &'a MinuteSeries,
    node: &str,
    sensor_type: &str,
) -> &'a MinuteSeries {
    sensor_index
        .get(node)
        .and_then(|sensors| sensors.get(sensor_type))
        .and_then(|sensor| series_by_sensor.get(&sensor.id))
        .unwrap_or(empty)
}

/// Build a fleet-health report from a window of readings. Pure: performs no
/// I/O, and identical inputs yield an identical report.
pub fn build(
    now: DateTime<Utc>,
    sensors: &[Sensor],
    readings: &[Reading],
    params: &InsightsParams,
    topology: &Topology,
    tz: Tz,
) -> Report {
    let window = params.window_minutes;

    // Minute-mean series, latest reading and raw count per sensor.
    let mut sums: HashMap<i64, MinuteSeries> = HashMap::new();
    let mut counts: HashMap<i64, HashMap<String, u32>> = HashMap::new();
    let mut latest_by_sensor: HashMap<i64, &Reading> = HashMap::new();
    let mut readings_per_sensor: HashMap<i64, usize> = HashMap::new();

    for reading in readings {
        let key = series::minute_key(reading.created_at, tz);
        *sums.entry(reading.sensor_id).or_default().entry(key.clone()).or_insert(0.0) +=
            reading.value;
        *counts.entry(reading.sensor_id).or_default().entry(key).or_insert(0) += 1;
        *readings_per_sensor.entry(reading.sensor_id).or_insert(0) += 1;

        let newer = latest_by_sensor
            .get(&reading.sensor_id)
            .map(|prev| reading.created_at >= prev.created_at)
            .unwrap_or(true);
        if newer {
            latest_by_sensor.insert(reading.sensor_id, reading);
        }
    }

    let mut series_by_sensor: HashMap<i64, MinuteSeries> = HashMap::new();
    let mut bucket_count = 0usize;
    for (sensor_id, minute_sums) in &sums {
        let minute_counts = &counts[sensor_id];
        let series: MinuteSeries = minute_sums
            .iter()
            .map(|(key, sum)| (key.clone(), sum / f64::from(minute_counts[key])))
            .collect();
        bucket_count += series.len();
        series_by_sensor.insert(*sensor_id, series);
    }

    // Sensor catalog indexed by (node key, sensor type); later entries win.
    let mut sensor_index: HashMap<String, HashMap<&str, &Sensor>> = HashMap::new();
    for sensor in sensors {
        if sensor.sensor_type.is_empty() {
            continue;
        }
        if let Some(node_key) = topology.normalize_node_key(&sensor.node_id, &sensor.mqtt_topic) {
            sensor_index
                .entry(node_key)
                .or_default()
                .insert(sensor.sensor_type.as_str(), sensor);
        }
    }

    let empty_series = MinuteSeries::new();

    // Derived microclimate series, restricted to minutes where both base
    // series have a value.
    let micro_pair = sensor_index.get(&topology.microclimate_node).and_then(|node| {
        Some((
            *node.get(topology.temperature_type.as_str())?,
            *node.get(topology.humidity_type.as_str())?,
        ))
    });

    let mut micro_series = MinuteSeries::new();
    let mut micro_latest: Option<f64> = None;
    if let Some((temp, hum)) = micro_pair {
        let temp_series = series_by_sensor.get(&temp.id).unwrap_or(&empty_series);
        let hum_series = series_by_sensor.get(&hum.id).unwrap_or(&empty_series);
        for (key, t) in temp_series {
            if let Some(h) = hum_series.get(key) {
                micro_series.insert(key.clone(), t + 0.1 * h);
            }
        }
        if let (Some(latest_t), Some(latest_h)) =
            (latest_by_sensor.get(&temp.id), latest_by_sensor.get(&hum.id))
        {
            micro_latest = Some(latest_t.value + 0.1 * latest_h.value);
        }
    }

    let mut tally = SeverityTally { warn: 0, critical: 0 };
    let mut node_summaries: Vec<NodeSummary> = Vec::with_capacity(topology.nodes.len());
    let mut freshest: Option<DateTime<Utc>> = None;
    let empty_node: HashMap<&str, &Sensor> = HashMap::new();

    for node in &topology.nodes {
        let node_sensors = sensor_index.get(&node.key).unwrap_or(&empty_node);

        let mut node_latest_at: Option<DateTime<Utc>> = None;
        let mut node_readings_count = 0usize;
        let mut metrics: Vec<MetricSummary> = Vec::new();

        for spec in &node.metrics {
            let Some(sensor) = node_sensors.get(spec.sensor_type.as_str()) else {
                metrics.push(MetricSummary {
                    sensor_type: spec.sensor_type.clone(),
                    sensor_name: spec.label.clone(),
                    unit: spec.unit.clone(),
                    latest: None,
                    mean: None,
                    std: None,
                    min: None,
                    max: None,
                    z: None,
                    severity: None,
                    count: 0,
                    availability: 0.0,
                    missing_minutes: window.max(0),
                });
                continue;
            };

            let latest = latest_by_sensor.get(&sensor.id);
            if let Some(latest) = latest {
                node_latest_at = Some(match node_latest_at {
                    Some(at) => at.max(latest.created_at),
                    None => latest.created_at,
                });
            }

            let sensor_series = series_by_sensor.get(&sensor.id).unwrap_or(&empty_series);
            let stats = series::stats(sensor_series);
            let z = latest.and_then(|latest| series::z_score(latest.value, &stats));
            let severity = tally.classify(z, params);

            metrics.push(MetricSummary {
                sensor_type: spec.sensor_type.clone(),
                sensor_name: sensor.name.clone(),
                unit: sensor.unit.clone(),
                latest: latest.map(|r| r.value),
                mean: stats.mean,
                std: stats.std,
                min: stats.min,
                max: stats.max,
                z,
                severity,
                count: stats.count,
                availability: availability(sensor_series.len(), window),
                missing_minutes: missing_minutes(sensor_series.len(), window),
            });

            node_readings_count += readings_per_sensor.get(&sensor.id).copied().unwrap_or(0);
        }

        if node.key == topology.microclimate_node {
            let stats = series::stats(&micro_series);
            let z = micro_latest.and_then(|latest| series::z_score(latest, &stats));
            let severity = tally.classify(z, params);

            metrics.push(MetricSummary {
                sensor_type: MICROCLIMATE_TYPE.to_string(),
                sensor_name: MICROCLIMATE_NAME.to_string(),
                unit: MICROCLIMATE_UNIT.to_string(),
                latest: micro_latest,
                mean: stats.mean,
                std: stats.std,
                min: stats.min,
                max: stats.max,
                z,
                severity,
                count: stats.count,
                availability: availability(micro_series.len(), window),
                missing_minutes: missing_minutes(micro_series.len(), window),
            });
        }

        let staleness_seconds =
            node_latest_at.map(|at| (now - at).num_seconds().max(0));

        if let Some(at) = node_latest_at {
            freshest = Some(match freshest {
                Some(best) => best.max(at),
                None => at,
            });
        }

        // Node availability over the union of minute keys across all of
        // the node's sensors, not just the configured metrics.
        let mut node_minutes: BTreeSet<&str> = BTreeSet::new();
        for sensor in node_sensors.values() {
            if let Some(series) = series_by_sensor.get(&sensor.id) {
                node_minutes.extend(series.keys().map(String::as_str));
            }
        }

        node_summaries.push(NodeSummary {
            node_id: node.key.clone(),
            label: node.label.clone(),
            last_update: node_latest_at
                .map(|at| format_ts(at, tz))
                .unwrap_or_else(|| "Never".to_string()),
            staleness_seconds,
            throughput_rpm: series::round_to(
                node_readings_count as f64 / window.max(1) as f64,
                2,
            ),
            availability: availability(node_minutes.len(), window),
            missing_minutes: missing_minutes(node_minutes.len(), window),
            metrics,
        });
    }

    // Fixed cross-node signal pairs.
    let soil_series = signal_series(
        &sensor_index,
        &series_by_sensor,
        &empty_series,
        &topology.soil.node,
        &topology.soil.sensor_type,
    );
    let current_series = signal_series(
        &sensor_index,
        &series_by_sensor,
        &empty_series,
        &topology.current.node,
        &topology.current.sensor_type,
    );

    let correlations: Vec<CorrelationRow> = [
        correlation_row(MICROCLIMATE_LABEL, &micro_series, &topology.soil.label, soil_series),
        correlation_row(&topology.current.label, current_series, &topology.soil.label, soil_series),
        correlation_row(MICROCLIMATE_LABEL, &micro_series, &topology.current.label, current_series),
    ]
    .into_iter()
    .flatten()
    .collect();

    // Completeness over minutes shared by all three analyzed signals.
    let common = series::common_keys(&[&micro_series, soil_series, current_series]);
    let completeness = if window > 0 {
        (common.len() as f64 / window as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // Reconstruct per-node latest timestamps from staleness for the skew
    // estimate.
    let latest_times: Vec<i64> = node_summaries
        .iter()
        .filter_map(|node| node.staleness_seconds)
        .map(|staleness| now.timestamp() - staleness)
        .collect();
    let skew_seconds = match (latest_times.iter().max(), latest_times.iter().min()) {
        (Some(max), Some(min)) if latest_times.len() >= 2 => max - min,
        _ => 0,
    };

    let freshest_ts = freshest.map(|at| at.timestamp());
    let node_offsets: Vec<NodeOffset> = node_summaries
        .iter()
        .map(|node| {
            let offset = match (freshest_ts, node.staleness_seconds) {
                (Some(freshest_ts), Some(staleness)) => {
                    let node_ts = now.timestamp() - staleness;
                    Some((freshest_ts - node_ts).max(0))
                }
                _ => None,
            };
            NodeOffset {
                node_id: node.node_id.clone(),
                label: node.label.clone(),
                offset_from_freshest_seconds: offset,
                staleness_seconds: node.staleness_seconds,
                availability: node.availability,
                missing_minutes: node.missing_minutes,
            }
        })
        .collect();

    let mut score = (100.0 * completeness).round() as i64;
    score -= (skew_seconds / 10).min(30);
    for node in &node_summaries {
        // A node with no data in the window counts as stale.
        let stale = node
            .staleness_seconds
            .map(|s| s > params.staleness_threshold_s)
            .unwrap_or(true);
        if stale {
            score -= 10;
        }
    }
    score -= ((tally.warn as i64) * 2 + (tally.critical as i64) * 5).min(20);
    score = score.clamp(0, 100);

    let mut notes: Vec<String> = Vec::new();
    if completeness < 0.5 {
        notes.push("Low alignment across nodes (missing minute-level overlaps)".to_string());
    }
    if skew_seconds > 60 {
        notes.push("Clock skew / ingestion lag between nodes is noticeable".to_string());
    }
    if tally.critical > 0 {
        notes.push("One or more signals are in critical anomaly range (z-score)".to_string());
    } else if tally.warn > 0 {
        notes.push("Some signals are in warning anomaly range (z-score)".to_string());
    }

    Report {
        computed_at: format_ts(now, tz),
        window_minutes: window,
        thresholds: ThresholdBlock {
            z_warn: params.z_warn,
            z_critical: params.z_critical,
            staleness_threshold_s: params.staleness_threshold_s,
        },
        anomalies: AnomalyCounts {
            warn_count: tally.warn,
            critical_count: tally.critical,
        },
        raw_readings_count: readings.len(),
        bucket_count,
        node_summaries,
        node_diagnostics: NodeDiagnostics {
            freshest_node_timestamp: freshest.map(|at| format_ts(at, tz)),
            node_offsets,
        },
        correlations,
        distributed_health: HealthBlock {
            score,
            completeness: series::round_to(completeness, 3),
            skew_seconds,
            notes,
        },
    }
}
