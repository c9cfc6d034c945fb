//! Configuration types for setstore
//!
//! This module defines the configuration of a single settings table and
//! of the background writer that persists it.

use crate::error::{Error, Result};
use crate::types::QuotaLimit;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one persisted settings table
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the durable state file
    pub path: PathBuf,
    /// Numeric identity of the table, used to tag log output
    pub key: u32,
    /// Per-namespace byte ceiling
    pub quota: QuotaLimit,
    /// Debounce settings for the background writer
    pub scheduler: SchedulerConfig,
    /// Names that survive a namespace purge regardless of owner
    pub protected_names: HashSet<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("settings.xml"),
            key: 0,
            quota: QuotaLimit::default(),
            scheduler: SchedulerConfig::default(),
            protected_names: HashSet::new(),
        }
    }
}

impl StoreConfig {
    /// Create config for the given state file
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set the quota ceiling
    #[must_use]
    pub const fn quota(mut self, quota: QuotaLimit) -> Self {
        self.quota = quota;
        self
    }

    /// Set the scheduler timings
    #[must_use]
    pub const fn scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Add names that a namespace purge must never remove
    #[must_use]
    pub fn protect<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.protected_names.extend(names.into_iter().map(Into::into));
        self
    }

    /// Check the configuration for values the engine cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::Configuration("state file path is empty".into()));
        }
        if self.path.file_name().is_none() {
            return Err(Error::Configuration(format!(
                "state file path {} has no file name",
                self.path.display()
            )));
        }
        self.scheduler.validate()
    }
}

/// Debounce timings for the background writer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period after the last mutation before writing (milliseconds)
    pub debounce_ms: u64,
    /// Upper bound on how long a mutation may stay unwritten (milliseconds)
    pub max_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 200,
            max_delay_ms: 2000,
        }
    }
}

impl SchedulerConfig {
    /// Quiet period as a `Duration`
    #[must_use]
    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Latency ceiling as a `Duration`
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(Error::Configuration("debounce_ms must be positive".into()));
        }
        if self.max_delay_ms < self.debounce_ms {
            return Err(Error::Configuration(format!(
                "max_delay_ms ({}) must not be below debounce_ms ({})",
                self.max_delay_ms, self.debounce_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.quota, QuotaLimit::Unlimited);
        assert_eq!(config.scheduler.debounce(), Duration::from_millis(200));
        assert_eq!(config.scheduler.max_delay(), Duration::from_millis(2000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_timings() {
        let config = StoreConfig::with_path("/tmp/s.xml").scheduler(SchedulerConfig {
            debounce_ms: 500,
            max_delay_ms: 100,
        });
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));

        let config = StoreConfig::with_path("/tmp/s.xml").scheduler(SchedulerConfig {
            debounce_ms: 0,
            max_delay_ms: 100,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let config = StoreConfig::with_path("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: StoreConfig = serde_json::from_str(
            r#"{"path":"/data/system.xml","quota":{"limited":100},"protected_names":["volume_ring"]}"#,
        )
        .unwrap();
        assert_eq!(config.quota, QuotaLimit::Limited(100));
        assert!(config.protected_names.contains("volume_ring"));
        assert_eq!(config.scheduler, SchedulerConfig::default());
    }
}
