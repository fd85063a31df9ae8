//! Configuration for the recovery core.
//!
//! Loads configuration from a TOML file; every field has a default so a
//! partial file (or none at all) is valid.

use crate::engine::retention::RetentionPolicy;
use crate::retry::RetryPolicy;
use crate::utils::{RecoveryError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Incrementals allowed under one FULL before a new FULL is forced
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// Bounded wait on the primary store before falling back to the ledger
    #[serde(default = "default_primary_timeout_ms")]
    pub primary_timeout_ms: u64,

    /// Per-call timeout for storage and ledger calls
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Mirror attempts before a LEDGER_PENDING record is marked FAILED
    #[serde(default = "default_mirror_max_attempts")]
    pub mirror_max_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<i64>,

    #[serde(default)]
    pub max_count_per_type: Option<usize>,

    /// Remove DELETED rows from the primary store after the ledger records the change
    #[serde(default)]
    pub purge_primary: bool,

    /// Cron expression for scheduled cleanup (seconds field first)
    #[serde(default = "default_retention_cron")]
    pub cron: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// zstd level for stored payloads
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_chain_depth() -> usize {
    8
}

fn default_primary_timeout_ms() -> u64 {
    2_000
}

fn default_op_timeout_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_mirror_max_attempts() -> u32 {
    5
}

fn default_max_age_days() -> Option<i64> {
    Some(30)
}

fn default_retention_cron() -> String {
    "0 0 3 * * *".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_depth: default_max_chain_depth(),
            primary_timeout_ms: default_primary_timeout_ms(),
            op_timeout_ms: default_op_timeout_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            mirror_max_attempts: default_mirror_max_attempts(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            max_count_per_type: None,
            purge_primary: false,
            cron: default_retention_cron(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| RecoveryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_chain_depth == 0 {
            return Err(RecoveryError::Config(
                "engine.max_chain_depth must be at least 1".into(),
            ));
        }
        if self.retry.mirror_max_attempts == 0 {
            return Err(RecoveryError::Config(
                "retry.mirror_max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(RecoveryError::Config(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.storage.data_dir.join("blobs")
    }

    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join("recovery.db")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.storage.data_dir.join("ledger.jsonl")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            max_chain_depth: self.engine.max_chain_depth,
            primary_timeout: Duration::from_millis(self.engine.primary_timeout_ms),
            op_timeout: Duration::from_millis(self.engine.op_timeout_ms),
            mirror_max_attempts: self.retry.mirror_max_attempts,
            retry: RetryPolicy {
                max_retries: self.retry.max_retries,
                base_delay_ms: self.retry.base_delay_ms,
                max_delay_ms: self.retry.max_delay_ms,
            },
        }
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: self.retention.max_age_days,
            max_count_per_type: self.retention.max_count_per_type,
            purge_primary: self.retention.purge_primary,
        }
    }
}

/// Runtime knobs handed to each engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_chain_depth: usize,
    pub primary_timeout: Duration,
    pub op_timeout: Duration,
    pub mirror_max_attempts: u32,
    pub retry: RetryPolicy,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Config::default().engine_settings()
    }
}
