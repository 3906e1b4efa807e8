//! Engine configuration.

use crate::{error::Result, Error};
use std::env;
use std::time::Duration;

/// Default number of pull handler attempts before giving up.
const DEFAULT_PULL_MAX_ATTEMPTS: u32 = 5;

/// Default delay before the first pull retry.
const DEFAULT_PULL_RETRY_BASE_MS: u64 = 100;

/// Default upper bound for the pull retry delay.
const DEFAULT_PULL_RETRY_MAX_MS: u64 = 5_000;

/// Tunables shared by every replication of a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pull handler attempts per round-trip (at least 1)
    pub pull_max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry
    pub pull_retry_base: Duration,
    /// Upper bound for the retry delay
    pub pull_retry_max: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pull_max_attempts: DEFAULT_PULL_MAX_ATTEMPTS,
            pull_retry_base: Duration::from_millis(DEFAULT_PULL_RETRY_BASE_MS),
            pull_retry_max: Duration::from_millis(DEFAULT_PULL_RETRY_MAX_MS),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to defaults.
    ///
    /// - `TETHER_PULL_MAX_ATTEMPTS`
    /// - `TETHER_PULL_RETRY_BASE_MS`
    /// - `TETHER_PULL_RETRY_MAX_MS`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let pull_max_attempts = read_var("TETHER_PULL_MAX_ATTEMPTS")?
            .unwrap_or(defaults.pull_max_attempts);
        let pull_retry_base = read_var("TETHER_PULL_RETRY_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.pull_retry_base);
        let pull_retry_max = read_var("TETHER_PULL_RETRY_MAX_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.pull_retry_max);

        let config = Self {
            pull_max_attempts,
            pull_retry_base,
            pull_retry_max,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.pull_max_attempts == 0 {
            return Err(Error::Config("pull_max_attempts must be at least 1".into()));
        }
        if self.pull_retry_base > self.pull_retry_max {
            return Err(Error::Config(
                "pull_retry_base must not exceed pull_retry_max".into(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.pull_retry_base
            .saturating_mul(factor)
            .min(self.pull_retry_max)
    }
}

fn read_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("invalid value for {name}: {raw}"))),
        Err(_) => Ok(None),
    }
}
