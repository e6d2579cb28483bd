//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (TIERCACHE_*)
//! 2. TOML config file (if TIERCACHE_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::cache::{KvOptions, RetryPolicy};

mod validation;

pub use validation::ConfigError;

/// Cache engine configuration with layered loading.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (TIERCACHE_*)
/// 2. TOML config file (if TIERCACHE_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding the database files and the legacy snapshot.
    ///
    /// Set via TIERCACHE_DATA_DIR environment variable.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// File name of the runtime cache database, relative to `data_dir`.
    #[serde(default = "default_runtime_db")]
    pub runtime_db: PathBuf,

    /// File name of the chat session database, relative to `data_dir`.
    #[serde(default = "default_chat_db")]
    pub chat_db: PathBuf,

    /// File name of the legacy chat JSON snapshot, relative to `data_dir`.
    #[serde(default = "default_chat_snapshot")]
    pub chat_snapshot: PathBuf,

    /// SQLite busy timeout in milliseconds.
    ///
    /// Set via TIERCACHE_BUSY_TIMEOUT_MS environment variable.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Memory tier capacity. Zero or negative keeps a single entry.
    #[serde(default = "default_memory_max_entries")]
    pub memory_max_entries: i64,

    /// Row budget for each persistent table.
    #[serde(default = "default_persistent_max_rows")]
    pub persistent_max_rows: usize,

    /// Force a prune every N writes even when no novel key was written.
    #[serde(default = "default_prune_interval")]
    pub prune_interval: u64,

    /// Capacity of the per-table known-keys set.
    #[serde(default = "default_known_keys_capacity")]
    pub known_keys_capacity: usize,

    /// Retries on lock contention.
    #[serde(default = "default_retry_max")]
    pub retry_max: u32,

    /// Fixed delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Minimum seconds between two unforced legacy snapshot writes.
    #[serde(default = "default_mirror_interval_secs")]
    pub mirror_interval_secs: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_runtime_db() -> PathBuf {
    PathBuf::from("runtime_cache.db")
}

fn default_chat_db() -> PathBuf {
    PathBuf::from("chat_storage.db")
}

fn default_chat_snapshot() -> PathBuf {
    PathBuf::from("chat_history.json")
}

fn default_busy_timeout_ms() -> u64 {
    10_000
}

fn default_memory_max_entries() -> i64 {
    256
}

fn default_persistent_max_rows() -> usize {
    500
}

fn default_prune_interval() -> u64 {
    64
}

fn default_known_keys_capacity() -> usize {
    4096
}

fn default_retry_max() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    50
}

fn default_mirror_interval_secs() -> u64 {
    20
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            runtime_db: default_runtime_db(),
            chat_db: default_chat_db(),
            chat_snapshot: default_chat_snapshot(),
            busy_timeout_ms: default_busy_timeout_ms(),
            memory_max_entries: default_memory_max_entries(),
            persistent_max_rows: default_persistent_max_rows(),
            prune_interval: default_prune_interval(),
            known_keys_capacity: default_known_keys_capacity(),
            retry_max: default_retry_max(),
            retry_delay_ms: default_retry_delay_ms(),
            mirror_interval_secs: default_mirror_interval_secs(),
        }
    }
}

impl CacheConfig {
    /// Busy timeout as Duration for the SQLite connection.
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Minimum interval between unforced snapshot writes.
    pub fn mirror_interval(&self) -> Duration {
        Duration::from_secs(self.mirror_interval_secs)
    }

    /// Retry policy built from `retry_max` and `retry_delay_ms`.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max, Duration::from_millis(self.retry_delay_ms))
    }

    /// Options for a persistent KV table.
    pub fn kv_options(&self) -> KvOptions {
        KvOptions {
            max_rows: self.persistent_max_rows,
            prune_interval: self.prune_interval,
            known_keys_capacity: self.known_keys_capacity,
        }
    }

    pub fn runtime_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.runtime_db)
    }

    pub fn chat_db_path(&self) -> PathBuf {
        self.data_dir.join(&self.chat_db)
    }

    pub fn chat_snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.chat_snapshot)
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `TIERCACHE_`
    /// 2. TOML file from `TIERCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("TIERCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("TIERCACHE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.runtime_db_path(), PathBuf::from("./data/runtime_cache.db"));
        assert_eq!(config.chat_db_path(), PathBuf::from("./data/chat_storage.db"));
        assert_eq!(config.busy_timeout_ms, 10_000);
        assert_eq!(config.memory_max_entries, 256);
        assert_eq!(config.persistent_max_rows, 500);
        assert_eq!(config.mirror_interval_secs, 20);
    }

    #[test]
    fn test_durations() {
        let config = CacheConfig::default();
        assert_eq!(config.busy_timeout(), Duration::from_millis(10_000));
        assert_eq!(config.mirror_interval(), Duration::from_secs(20));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = CacheConfig { retry_max: 5, retry_delay_ms: 10, ..Default::default() };
        let policy = config.retry_policy();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_kv_options_from_config() {
        let config = CacheConfig { persistent_max_rows: 10, prune_interval: 3, ..Default::default() };
        let options = config.kv_options();
        assert_eq!(options.max_rows, 10);
        assert_eq!(options.prune_interval, 3);
    }
}
