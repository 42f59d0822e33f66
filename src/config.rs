//! # Configuration Surface
//!
//! TOML-backed configuration for the analyzer: broker connections, database
//! URL, API bind address for the external HTTP/WS layer, custom operator
//! rules and hide rules. Unknown keys are ignored.

use serde::Deserialize;

use crate::chirpstack::PayloadFormat;
use crate::error::TraceError;
use crate::operators::CustomOperator;

fn default_topic() -> String {
    "#".to_string()
}

fn default_format() -> String {
    "protobuf".to_string()
}

/// One broker connection.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct MqttServerConfig {
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscription pattern; the default `#` covers both topic trees.
    #[serde(default = "default_topic")]
    pub topic: String,
    /// `protobuf` (gateway bridge default) or `json`.
    #[serde(default = "default_format")]
    pub format: String,
}

impl MqttServerConfig {
    pub fn payload_format(&self) -> PayloadFormat {
        match self.format.as_str() {
            "json" => PayloadFormat::Json,
            _ => PayloadFormat::Protobuf,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    pub url: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Listen address consumed by the external HTTP/WS layer.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            bind: default_bind(),
        }
    }
}

/// `prefix` accepts a single string or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

/// A custom operator rule from the config file. Entries without a prefix
/// are color-only and attach to same-named rules.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    pub prefix: Option<OneOrMany>,
    pub name: String,
    pub priority: Option<i32>,
    /// Advertised device count, carried through to readers.
    pub known_devices: Option<i64>,
    pub color: Option<String>,
}

impl OperatorConfig {
    pub fn to_rule(&self) -> CustomOperator {
        CustomOperator {
            prefixes: self.prefix.clone().map(OneOrMany::into_vec).unwrap_or_default(),
            name: self.name.clone(),
            priority: self.priority,
            color: self.color.clone(),
        }
    }
}

/// Packet-suppression rule consumed by the read queries.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HideRuleConfig {
    /// `dev_addr` or `join_eui`.
    #[serde(rename = "type")]
    pub rule_type: String,
    pub prefix: String,
    pub description: Option<String>,
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    2000
}

fn default_session_sweep_days() -> i64 {
    9
}

/// Writer and session-tracker tuning, all optional.
#[derive(Debug, Clone, Deserialize)]
pub struct TuningConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Sessions idle longer than this are swept; defaults to one day past
    /// the packet retention.
    #[serde(default = "default_session_sweep_days")]
    pub session_sweep_days: i64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            session_sweep_days: default_session_sweep_days(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub mqtt: MqttServerConfig,
    /// Additional brokers, same shape as `mqtt`.
    #[serde(default)]
    pub mqtt_servers: Vec<MqttServerConfig>,
    pub postgres: PostgresConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    #[serde(default)]
    pub hide_rules: Vec<HideRuleConfig>,
    #[serde(default)]
    pub tuning: TuningConfig,
}

impl AppConfig {
    pub fn from_file(path: &std::path::Path) -> Result<Self, TraceError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TraceError::Config(format!("cannot read {}: {e}", path.display())))?;
        toml::from_str(&raw).map_err(|e| TraceError::Config(e.to_string()))
    }

    /// All broker connections, primary first.
    pub fn all_brokers(&self) -> Vec<MqttServerConfig> {
        let mut brokers = vec![self.mqtt.clone()];
        brokers.extend(self.mqtt_servers.iter().cloned());
        brokers
    }

    pub fn custom_operators(&self) -> Vec<CustomOperator> {
        self.operators.iter().map(OperatorConfig::to_rule).collect()
    }
}
