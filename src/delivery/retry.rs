//! Retry delay policy for failed delivery attempts.
//!
//! Either a fixed delay, or a quadratic backoff of `base_delay × retry_count²`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::DeliveryConfig;

/// Upper bound on the squared factor so large retry counts cannot overflow.
const MAX_BACKOFF_FACTOR: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn fixed(base_delay: Duration) -> Self {
        Self {
            base_delay,
            exponential_backoff: false,
        }
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self {
            base_delay,
            exponential_backoff: true,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            base_delay: config.retry_delay(),
            exponential_backoff: config.exponential_backoff,
        }
    }

    /// Delay before the attempt numbered `retry_count`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        let factor = retry_count
            .saturating_mul(retry_count)
            .min(MAX_BACKOFF_FACTOR);
        self.base_delay.saturating_mul(factor)
    }
}
