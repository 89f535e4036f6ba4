use std::env;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

use crate::bus::DEFAULT_CAPACITY;
use crate::queue::QueueStrategy;
use crate::snapshot::DEFAULT_SNAPSHOT_CAPACITY;

/// Side-effect timeout used when neither the definition nor the caller sets one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine configuration
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Snapshots kept before the oldest is evicted.
    pub snapshot_capacity: usize,
    pub default_timeout: Duration,
    pub result_channel_capacity: usize,
    pub queue_strategy: QueueStrategy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
            default_timeout: DEFAULT_TIMEOUT,
            result_channel_capacity: DEFAULT_CAPACITY,
            queue_strategy: QueueStrategy::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_result_channel_capacity(mut self, capacity: usize) -> Self {
        self.result_channel_capacity = capacity;
        self
    }

    pub fn with_queue_strategy(mut self, strategy: QueueStrategy) -> Self {
        self.queue_strategy = strategy;
        self
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any key lookup (environment, map, ...).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            snapshot_capacity: match lookup("COUNTERWEIGHT_SNAPSHOT_CAPACITY") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .context("COUNTERWEIGHT_SNAPSHOT_CAPACITY must be a valid number")?,
                None => defaults.snapshot_capacity,
            },
            default_timeout: match lookup("COUNTERWEIGHT_DEFAULT_TIMEOUT_MS") {
                Some(raw) => Duration::from_millis(
                    raw.trim()
                        .parse()
                        .context("COUNTERWEIGHT_DEFAULT_TIMEOUT_MS must be a number of milliseconds")?,
                ),
                None => defaults.default_timeout,
            },
            result_channel_capacity: match lookup("COUNTERWEIGHT_RESULT_CAPACITY") {
                Some(raw) => raw
                    .trim()
                    .parse()
                    .context("COUNTERWEIGHT_RESULT_CAPACITY must be a valid number")?,
                None => defaults.result_channel_capacity,
            },
            queue_strategy: match lookup("COUNTERWEIGHT_QUEUE_STRATEGY") {
                Some(raw) => raw
                    .parse()
                    .map_err(anyhow::Error::msg)
                    .context("COUNTERWEIGHT_QUEUE_STRATEGY is invalid")?,
                None => defaults.queue_strategy,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.snapshot_capacity == 0 {
            bail!("snapshot capacity must be greater than zero");
        }
        if self.result_channel_capacity == 0 {
            bail!("result channel capacity must be greater than zero");
        }
        if self.default_timeout.is_zero() {
            bail!("default timeout must be greater than zero");
        }
        Ok(())
    }
}
