//! # Courier Configuration System
//!
//! Typed configuration for the delivery engine. Every field has a default so a
//! partial file (or none at all) yields a usable [`BusConfig`]; values are
//! checked by [`BusConfig::validate`] before anything is started.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use courier_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file("config/courier.toml")?;
//! let permits = manager.config().delivery.permits_per_worker;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{default_worker_count, defaults};

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Queued delivery engine settings
    pub delivery: DeliveryConfig,

    /// Fan-out defaults for new delivery records
    pub router: RouterConfig,

    /// Generic worker pool settings
    pub worker_pool: WorkerPoolConfig,

    /// Two-way publish settings
    pub correlation: CorrelationConfig,

    /// Notification channel settings
    pub events: EventsConfig,
}

impl BusConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        self.delivery.validate()?;
        self.worker_pool.validate()?;

        if self.events.channel_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "events.channel_capacity",
                0,
                "broadcast capacity must be positive",
            ));
        }

        Ok(())
    }
}

/// Queued delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    pub dequeue_timeout_ms: u64,
    pub deferred_retry_sleep_ms: u64,
    pub retry_poll_interval_ms: u64,
    pub permits_per_worker: usize,
    /// Defaults to the logical CPU count when unset
    pub worker_count: Option<usize>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            exponential_backoff: false,
            dequeue_timeout_ms: defaults::DEQUEUE_TIMEOUT_MS,
            deferred_retry_sleep_ms: defaults::DEFERRED_RETRY_SLEEP_MS,
            retry_poll_interval_ms: defaults::RETRY_POLL_INTERVAL_MS,
            permits_per_worker: defaults::PERMITS_PER_WORKER,
            worker_count: None,
        }
    }
}

impl DeliveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn deferred_retry_sleep(&self) -> Duration {
        Duration::from_millis(self.deferred_retry_sleep_ms)
    }

    pub fn retry_poll_interval(&self) -> Duration {
        Duration::from_millis(self.retry_poll_interval_ms)
    }

    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(default_worker_count)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.permits_per_worker == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.permits_per_worker",
                0,
                "each delivery worker needs at least one permit",
            ));
        }
        if self.worker_count == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "delivery.worker_count",
                0,
                "worker count must be positive when set",
            ));
        }
        if self.dequeue_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "delivery.dequeue_timeout_ms",
                0,
                "dequeue must be bounded by a positive timeout",
            ));
        }
        Ok(())
    }
}

/// Router configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Retry ceiling stamped on every fan-out record
    pub default_max_retries: u32,
    /// When set, fan-out records expire this many seconds after routing
    pub default_time_to_live_seconds: Option<u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_max_retries: defaults::MAX_RETRIES,
            default_time_to_live_seconds: None,
        }
    }
}

impl RouterConfig {
    pub fn default_time_to_live(&self) -> Option<Duration> {
        self.default_time_to_live_seconds.map(Duration::from_secs)
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub stop_timeout_ms: u64,
    pub unit_of_work_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: defaults::WORKER_STOP_TIMEOUT_MS,
            unit_of_work_timeout_ms: defaults::UNIT_OF_WORK_TIMEOUT_MS,
        }
    }
}

impl WorkerPoolConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn unit_of_work_timeout(&self) -> Duration {
        Duration::from_millis(self.unit_of_work_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.unit_of_work_timeout_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker_pool.unit_of_work_timeout_ms",
                0,
                "unit of work must be bounded by a positive timeout",
            ));
        }
        Ok(())
    }
}

/// Correlation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub default_reply_timeout_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            default_reply_timeout_ms: defaults::REPLY_TIMEOUT_MS,
        }
    }
}

impl CorrelationConfig {
    pub fn default_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.default_reply_timeout_ms)
    }
}

/// Event channel configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}
