//! Process-level factory configuration.
//!
//! The values here tune the factory itself rather than any single pool. They
//! can be built in code or loaded from the `[pool]` table of a TOML file:
//!
//! ```rust
//! use prax_pool::FactoryConfig;
//! use std::time::Duration;
//!
//! let config = FactoryConfig::from_toml_str(r#"
//!     [pool]
//!     prune_period = "10s"
//!     max_open_retries = 5
//! "#).unwrap();
//!
//! assert_eq!(config.prune_period, Duration::from_secs(10));
//! assert_eq!(config.max_open_retries, 5);
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{PoolError, PoolResult};

/// Configuration for [`ConnectionFactory`](crate::ConnectionFactory).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Delay before the first pruning pass.
    #[serde(with = "duration_str")]
    pub prune_initial_delay: Duration,
    /// Interval between pruning passes.
    #[serde(with = "duration_str")]
    pub prune_period: Duration,
    /// Attempts made by the open retry loop.
    pub max_open_retries: u32,
    /// First sleep of the retry backoff; doubles on every retry.
    #[serde(with = "duration_str")]
    pub initial_retry_delay: Duration,
    /// Width of the non-pooled creation throttle.
    pub throttle_slots: usize,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            prune_initial_delay: Duration::from_secs(4 * 60),
            prune_period: Duration::from_secs(30),
            max_open_retries: 10,
            initial_retry_delay: Duration::from_millis(1),
            throttle_slots: num_cpus::get().max(1),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    pool: FactoryConfig,
}

impl FactoryConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from the `[pool]` table of a TOML document.
    pub fn from_toml_str(source: &str) -> PoolResult<Self> {
        let file: ConfigFile = toml::from_str(source)
            .map_err(|e| PoolError::config(format!("invalid pool configuration: {}", e)))?;
        file.pool.validate()?;
        info!(
            prune_period_ms = file.pool.prune_period.as_millis() as u64,
            throttle_slots = file.pool.throttle_slots,
            "FactoryConfig loaded"
        );
        Ok(file.pool)
    }

    /// Set the delay before the first pruning pass.
    pub fn prune_initial_delay(mut self, delay: Duration) -> Self {
        self.prune_initial_delay = delay;
        self
    }

    /// Set the pruning interval.
    pub fn prune_period(mut self, period: Duration) -> Self {
        self.prune_period = period;
        self
    }

    /// Set the number of open attempts.
    pub fn max_open_retries(mut self, retries: u32) -> Self {
        self.max_open_retries = retries;
        self
    }

    /// Set the first backoff delay.
    pub fn initial_retry_delay(mut self, delay: Duration) -> Self {
        self.initial_retry_delay = delay;
        self
    }

    /// Set the throttle width.
    pub fn throttle_slots(mut self, slots: usize) -> Self {
        self.throttle_slots = slots;
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> PoolResult<()> {
        if self.prune_period.is_zero() {
            return Err(PoolError::config("prune_period must be greater than zero"));
        }
        if self.max_open_retries == 0 {
            return Err(PoolError::config("max_open_retries must be at least 1"));
        }
        if self.throttle_slots == 0 {
            return Err(PoolError::config("throttle_slots must be at least 1"));
        }
        Ok(())
    }
}

/// Durations written as `"250ms"`, `"30s"`, `"4m"` or `"1h"`.
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {}", raw)))
    }

    pub(super) fn parse(raw: &str) -> Option<Duration> {
        let raw = raw.trim();
        let split = raw.find(|c: char| !c.is_ascii_digit())?;
        let (digits, unit) = raw.split_at(split);
        let value: u64 = digits.parse().ok()?;
        match unit.trim() {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => Some(Duration::from_secs(value * 60)),
            "h" => Some(Duration::from_secs(value * 3600)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FactoryConfig::default();
        assert_eq!(config.prune_initial_delay, Duration::from_secs(240));
        assert_eq!(config.prune_period, Duration::from_secs(30));
        assert_eq!(config.max_open_retries, 10);
        assert_eq!(config.initial_retry_delay, Duration::from_millis(1));
        assert!(config.throttle_slots >= 1);
    }

    #[test]
    fn test_builder() {
        let config = FactoryConfig::new()
            .prune_period(Duration::from_secs(5))
            .max_open_retries(3)
            .throttle_slots(2);
        assert_eq!(config.prune_period, Duration::from_secs(5));
        assert_eq!(config.max_open_retries, 3);
        assert_eq!(config.throttle_slots, 2);
    }

    #[test]
    fn test_from_toml() {
        let config = FactoryConfig::from_toml_str(
            r#"
            [pool]
            prune_initial_delay = "1m"
            initial_retry_delay = "2ms"
            throttle_slots = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.prune_initial_delay, Duration::from_secs(60));
        assert_eq!(config.initial_retry_delay, Duration::from_millis(2));
        assert_eq!(config.throttle_slots, 4);
        assert_eq!(config.prune_period, Duration::from_secs(30));
    }

    #[test]
    fn test_from_toml_without_table() {
        let config = FactoryConfig::from_toml_str("").unwrap();
        assert_eq!(config.max_open_retries, 10);
    }

    #[test]
    fn test_invalid_toml() {
        assert!(FactoryConfig::from_toml_str("[pool]\nprune_period = \"soon\"").is_err());
        assert!(FactoryConfig::from_toml_str("[pool]\nthrottle_slots = 0").is_err());
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(duration_str::parse("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(duration_str::parse("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(duration_str::parse("10"), None);
        assert_eq!(duration_str::parse("ms"), None);
    }
}
