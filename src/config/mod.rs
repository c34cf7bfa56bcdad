use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::db::DEFAULT_BATCH_LIMIT;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Maximum writes per atomic batch commit
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: default_data_dir(),
            max_connections: default_max_connections(),
            batch_limit: default_batch_limit(),
        }
    }
}

fn default_backend() -> StorageBackend {
    StorageBackend::Sqlite
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_max_connections() -> u32 {
    5
}

fn default_batch_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineConfig {
    /// Offset from UTC used to decide "today" and the current hour (default: 0)
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

impl EngineConfig {
    /// Falls back to UTC when the configured offset is out of range
    pub fn utc_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    /// Purge old daily records after writes (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Days of daily records kept per user (default: 90)
    #[serde(default = "default_retention_days")]
    pub days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            days: default_retention_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> u32 {
    90
}

#[derive(Debug, Clone, Deserialize)]
pub struct SamplerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between sampling passes in seconds (default: 3600)
    #[serde(default = "default_sampler_interval")]
    pub interval_seconds: u64,
    /// Users sampled concurrently (default: 8)
    #[serde(default = "default_sampler_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: default_sampler_interval(),
            max_concurrency: default_sampler_concurrency(),
        }
    }
}

fn default_sampler_interval() -> u64 {
    3600
}

fn default_sampler_concurrency() -> usize {
    8
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    /// Seed categories and preset templates at startup (default: true)
    #[serde(default = "default_true")]
    pub on_startup: bool,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self { on_startup: true }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "Failed to parse configuration file")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.storage.batch_limit, 500);
        assert_eq!(config.retention.days, 90);
        assert!(config.retention.enabled);
        assert_eq!(config.sampler.interval_seconds, 3600);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.engine.utc_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_partial_sections_keep_field_defaults() {
        let config = Config::parse(
            r#"
            [storage]
            backend = "memory"
            batch_limit = 100

            [retention]
            days = 30

            [engine]
            utc_offset_minutes = 120
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.storage.batch_limit, 100);
        assert_eq!(config.storage.max_connections, 5);
        assert_eq!(config.retention.days, 30);
        assert!(config.retention.enabled);
        assert_eq!(config.engine.utc_offset().local_minus_utc(), 7200);
    }

    #[test]
    fn test_out_of_range_offset_falls_back_to_utc() {
        let engine = EngineConfig {
            utc_offset_minutes: 24 * 60,
        };
        assert_eq!(engine.utc_offset().local_minus_utc(), 0);
    }

    #[test]
    fn test_rejects_unknown_backend() {
        assert!(Config::parse("[storage]\nbackend = \"mongo\"").is_err());
    }
}
