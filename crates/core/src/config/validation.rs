//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::CacheConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if:
    /// - `busy_timeout_ms` is outside 1s..=30s
    /// - `persistent_max_rows`, `prune_interval` or `known_keys_capacity` is 0
    /// - `retry_delay_ms` exceeds 5 seconds
    /// - `mirror_interval_secs` is outside 1..=3600
    /// - any database or snapshot file name is empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1_000..=30_000).contains(&self.busy_timeout_ms) {
            return Err(ConfigError::Invalid {
                field: "busy_timeout_ms".into(),
                reason: "must be between 1000 and 30000".into(),
            });
        }

        if self.persistent_max_rows == 0 {
            return Err(ConfigError::Invalid {
                field: "persistent_max_rows".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.prune_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "prune_interval".into(),
                reason: "must be greater than 0".into(),
            });
        }
        if self.known_keys_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "known_keys_capacity".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if self.retry_delay_ms > 5_000 {
            return Err(ConfigError::Invalid {
                field: "retry_delay_ms".into(),
                reason: "must not exceed 5 seconds (5000ms)".into(),
            });
        }

        if !(1..=3600).contains(&self.mirror_interval_secs) {
            return Err(ConfigError::Invalid {
                field: "mirror_interval_secs".into(),
                reason: "must be between 1 and 3600".into(),
            });
        }

        for (field, value) in [
            ("runtime_db", &self.runtime_db),
            ("chat_db", &self.chat_db),
            ("chat_snapshot", &self.chat_snapshot),
        ] {
            if value.as_os_str().is_empty() {
                return Err(ConfigError::Missing { field: field.into(), hint: "file name must not be empty".into() });
            }
        }

        if self.memory_max_entries > 0 && self.memory_max_entries as usize > self.persistent_max_rows {
            tracing::warn!(
                memory_max_entries = self.memory_max_entries,
                persistent_max_rows = self.persistent_max_rows,
                "Memory tier is larger than the persistent row budget; \
                 entries may outlive their persisted rows"
            );
        }

        Ok(())
    }
}
