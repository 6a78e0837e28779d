/// Session tunables
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

use crate::PROXIMITY_THRESHOLD;

/// Collaborators editing with no activity for this long become idle
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// How often the idle check runs
pub const DEFAULT_IDLE_CHECK_INTERVAL_MS: u64 = 10_000;

/// Synchronization settings, loadable from the environment or a host config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Text edits closer than this many positions conflict
    pub proximity_threshold: usize,
    /// Idle timeout in milliseconds
    pub idle_timeout_ms: u64,
    /// Idle check period in milliseconds
    pub idle_check_interval_ms: u64,
}

impl SyncConfig {
    /// Load configuration from `DOC_COLLAB_*` environment variables,
    /// falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let proximity_threshold = read_var("DOC_COLLAB_PROXIMITY_THRESHOLD")?
            .unwrap_or(defaults.proximity_threshold as u64) as usize;

        let idle_timeout_ms =
            read_var("DOC_COLLAB_IDLE_TIMEOUT_MS")?.unwrap_or(defaults.idle_timeout_ms);

        let idle_check_interval_ms = read_var("DOC_COLLAB_IDLE_CHECK_INTERVAL_MS")?
            .unwrap_or(defaults.idle_check_interval_ms);

        let config = Self {
            proximity_threshold,
            idle_timeout_ms,
            idle_check_interval_ms,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.idle_check_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_millis(self.idle_check_interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            proximity_threshold: PROXIMITY_THRESHOLD,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            idle_check_interval_ms: DEFAULT_IDLE_CHECK_INTERVAL_MS,
        }
    }
}

fn read_var(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a non-negative integer, got '{value}'")]
    InvalidNumber { name: &'static str, value: String },

    #[error("idle check interval must be greater than zero")]
    ZeroInterval,
}
