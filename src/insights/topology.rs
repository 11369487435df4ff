use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// One expected metric on a node: the sensor type we look for plus the
/// label/unit to report when the sensor itself is missing from the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricSpec {
    pub sensor_type: String,
    pub label: String,
    pub unit: String,
}

/// A logical node and the naming conventions that map sensors onto it.
/// A sensor matches when its topic contains one of `topic_substrings`, or
/// failing that when its node id equals the key or one of the aliases.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeSpec {
    pub key: String,
    pub label: String,
    pub metrics: Vec<MetricSpec>,
    #[serde(default)]
    pub topic_substrings: Vec<String>,
    #[serde(default)]
    pub node_id_aliases: Vec<String>,
}

/// A (node, sensor type) pair referenced by label in derived signals and
/// correlation rows.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalRef {
    pub node: String,
    pub sensor_type: String,
    pub label: String,
}

/// The fleet layout the insights engine analyzes. Injected so a new
/// deployment reshapes the analysis with configuration, not code.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub nodes: Vec<NodeSpec>,
    /// Node carrying the temperature/humidity pair the microclimate index
    /// is derived from.
    pub microclimate_node: String,
    pub temperature_type: String,
    pub humidity_type: String,
    pub soil: SignalRef,
    pub current: SignalRef,
}

impl Topology {
    /// Resolve a sensor to a node key. Topic substrings win because topics
    /// are stable across the different node id conventions seeders used.
    pub fn normalize_node_key(&self, node_id: &str, mqtt_topic: &str) -> Option<String> {
        if !mqtt_topic.is_empty() {
            for node in &self.nodes {
                if node
                    .topic_substrings
                    .iter()
                    .any(|needle| mqtt_topic.contains(needle.as_str()))
                {
                    return Some(node.key.clone());
                }
            }
        }

        if node_id.is_empty() {
            return None;
        }
        for node in &self.nodes {
            if node.key == node_id || node.node_id_aliases.iter().any(|alias| alias == node_id) {
                return Some(node.key.clone());
            }
        }
        None
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let mut raw = std::fs::read(path)
            .with_context(|| format!("reading topology file {}", path.display()))?;
        let topology: Self = simd_json::serde::from_slice(&mut raw)
            .with_context(|| format!("parsing topology file {}", path.display()))?;
        Ok(topology)
    }
}

impl Default for Topology {
    fn default() -> Self {
        let node = |key: &str, label: &str, alias: &str, metrics: Vec<MetricSpec>| NodeSpec {
            key: key.to_string(),
            label: label.to_string(),
            metrics,
            topic_substrings: vec![key.to_string()],
            node_id_aliases: vec![alias.to_string()],
        };
        let metric = |sensor_type: &str, label: &str, unit: &str| MetricSpec {
            sensor_type: sensor_type.to_string(),
            label: label.to_string(),
            unit: unit.to_string(),
        };

        Self {
            nodes: vec![
                node(
                    "esp32_node1",
                    "ESP32 Node 1 (DHT11)",
                    "node-1",
                    vec![
                        metric("temperatura", "Temperatura", "°C"),
                        metric("umiditate", "Umiditate", "%"),
                    ],
                ),
                node(
                    "esp32_node2",
                    "ESP32 Node 2 (Soil)",
                    "node-2",
                    vec![metric("umiditate_sol", "Umiditate Sol", "ADC")],
                ),
                node(
                    "esp32_node3",
                    "ESP32 Node 3 (ACS712)",
                    "node-3",
                    vec![metric("curent", "Curent", "A")],
                ),
            ],
            microclimate_node: "esp32_node1".to_string(),
            temperature_type: "temperatura".to_string(),
            humidity_type: "umiditate".to_string(),
            soil: SignalRef {
                node: "esp32_node2".to_string(),
                sensor_type: "umiditate_sol".to_string(),
                label: "Soil Moisture".to_string(),
            },
            current: SignalRef {
                node: "esp32_node3".to_string(),
                sensor_type: "curent".to_string(),
                label: "Current".to_string(),
            },
        }
    }
}
