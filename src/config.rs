//! Configuration for a single pipeline instance.
//!
//! Loaded from a TOML or YAML file with environment-variable overrides, in
//! the same layered fashion the ingestion pipeline's config loader uses:
//! a file source plus a `GFCORE__`-prefixed, double-underscore-separated
//! environment source, validated once at construction.

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub pipeline_id: String,
    pub kafka: KafkaConfig,
    pub jetstream: JetStreamConfig,
    pub clickhouse: ClickHouseConfig,
    pub operator: OperatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: String,
    pub topics: Vec<String>,
    pub consumer_group: String,
    #[serde(default = "default_initial_offset")]
    pub initial_offset: InitialOffset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialOffset {
    Earliest,
    Latest,
}

fn default_initial_offset() -> InitialOffset {
    InitialOffset::Earliest
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JetStreamConfig {
    pub url: String,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_poll_timeout_ms() -> u64 {
    5_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClickHouseConfig {
    #[serde(default = "default_ch_host")]
    pub host: String,
    #[serde(default = "default_ch_port")]
    pub port: u16,
    pub database: String,
    pub table: String,
    pub username: String,
    /// Base64-encoded; decoded once at startup (§6).
    pub password: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_ch_host() -> String {
    "127.0.0.1".to_string()
}
fn default_ch_port() -> u16 {
    9000
}
fn default_max_batch_size() -> usize {
    10_000
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl ClickHouseConfig {
    pub fn url(&self) -> String {
        let scheme = if self.tls_enabled { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host, self.port)
    }

    pub fn decoded_password(&self) -> Result<String, CoreError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&self.password)
            .map_err(|e| CoreError::config(format!("password is not valid base64: {e}")))?;
        String::from_utf8(bytes).map_err(|e| CoreError::config(format!("password is not valid utf-8: {e}")))
    }
}

/// One operator configuration: Passthrough, Deduplicator, Joiner, or the
/// combined DeduplicatingJoiner.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorConfig {
    Passthrough,
    Deduplicator(DedupConfig),
    Joiner(JoinConfig),
    DeduplicatingJoiner { left: DedupConfig, right: DedupConfig, join_window_ms: u64 },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DedupConfig {
    pub topic: String,
    pub key_path: String,
    pub key_type: KeyType,
    pub window_ms: u64,
    /// Hard cap on the dedup map's size; `None` means unbounded (default).
    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinSideConfig {
    pub topic: String,
    pub key_path: String,
    pub key_type: KeyType,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JoinConfig {
    pub left: JoinSideConfig,
    pub right: JoinSideConfig,
    pub window_ms: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    String,
    I64,
    U64,
    F64,
    Bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `GFCORE_CONFIG_PATH` (default `config.toml`), then layer
    /// `GFCORE__`-prefixed environment variables on top.
    pub fn load_with_overrides() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        let config_path = std::env::var("GFCORE_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        if Path::new(&config_path).exists() {
            let format = if config_path.ends_with(".yaml") || config_path.ends_with(".yml") {
                FileFormat::Yaml
            } else {
                FileFormat::Toml
            };
            builder = builder.add_source(File::new(&config_path, format));
        }

        builder = builder.add_source(config::Environment::with_prefix("GFCORE").separator("__").try_parsing(true));

        let config: Config = builder.build()?.try_deserialize()?;
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {path}"))?;
        let config: Config = if path.ends_with(".toml") {
            toml::from_str(&content).with_context(|| format!("failed to parse TOML config: {path}"))?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content).with_context(|| format!("failed to parse YAML config: {path}"))?
        } else {
            anyhow::bail!("unsupported config file format, use .toml or .yaml");
        };
        config.validate().map_err(anyhow::Error::from)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.pipeline_id.trim().is_empty() {
            return Err(CoreError::config("pipeline_id must not be empty"));
        }
        if self.kafka.topics.is_empty() {
            return Err(CoreError::config("kafka.topics must name at least one topic"));
        }
        if self.clickhouse.max_batch_size == 0 {
            return Err(CoreError::config("clickhouse.max_batch_size must be >= 1"));
        }
        if let OperatorConfig::Joiner(join) = &self.operator {
            if join.left.topic == join.right.topic {
                return Err(CoreError::config("joiner left and right topics must differ"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml() -> &'static str {
        r#"
pipeline_id = "p1"

[kafka]
brokers = "localhost:9092"
topics = ["events"]
consumer_group = "gf-core"

[jetstream]
url = "nats://localhost:4222"

[clickhouse]
database = "default"
table = "events"
username = "default"
password = ""

[operator]
kind = "passthrough"
"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg: Config = toml::from_str(sample_toml()).unwrap();
        assert_eq!(cfg.pipeline_id, "p1");
        assert_eq!(cfg.clickhouse.max_batch_size, 10_000);
        assert_eq!(cfg.kafka.initial_offset, InitialOffset::Earliest);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_empty_pipeline_id() {
        let mut cfg: Config = toml::from_str(sample_toml()).unwrap();
        cfg.pipeline_id = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_identical_join_topics() {
        let mut cfg: Config = toml::from_str(sample_toml()).unwrap();
        cfg.operator = OperatorConfig::Joiner(JoinConfig {
            left: JoinSideConfig { topic: "a".into(), key_path: "/id".into(), key_type: KeyType::String },
            right: JoinSideConfig { topic: "a".into(), key_path: "/id".into(), key_type: KeyType::String },
            window_ms: 1000,
            max_entries: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn loads_from_temp_file() {
        use std::io::Write;
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(sample_toml().as_bytes()).unwrap();
        let cfg = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(cfg.pipeline_id, "p1");
    }
}
