//! # Bus Error Types
//!
//! Top-level error for the message bus. Layer-specific errors
//! ([`MessagingError`], [`DispatchError`], [`ConfigurationError`]) convert into
//! [`BusError`] so callers of the runtime deal with a single type.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::errors::MessagingError;
use crate::registry::subscription::DispatchError;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Subscription not found: {subscription_id}")]
    SubscriptionNotFound { subscription_id: Uuid },

    #[error("Subscription already registered: {subscription_id}")]
    DuplicateSubscription { subscription_id: Uuid },

    #[error("No delivery core available for subscription {subscription_id}")]
    NoDeliveryCore { subscription_id: Uuid },

    #[error("Routing failed: {message}")]
    Routing { message: String },

    #[error("Timed out after {timeout:?} waiting for reply to correlation id {correlation_id}")]
    CorrelationTimeout {
        correlation_id: String,
        timeout: Duration,
    },

    #[error("Wait for correlation id {correlation_id} was cancelled")]
    CorrelationCancelled { correlation_id: String },

    #[error("{component} is already running")]
    AlreadyStarted { component: String },

    #[error("{component} is not running")]
    NotStarted { component: String },

    #[error("Worker {worker_id} not found in pool {pool}")]
    WorkerNotFound { pool: String, worker_id: u64 },
}

impl BusError {
    /// Create a routing error
    pub fn routing(message: impl Into<String>) -> Self {
        Self::Routing {
            message: message.into(),
        }
    }

    /// Create an already-started error for a component
    pub fn already_started(component: impl Into<String>) -> Self {
        Self::AlreadyStarted {
            component: component.into(),
        }
    }

    /// Create a not-started error for a component
    pub fn not_started(component: impl Into<String>) -> Self {
        Self::NotStarted {
            component: component.into(),
        }
    }

    /// Whether the error came out of a correlated wait that never got a reply
    pub fn is_correlation_timeout(&self) -> bool {
        matches!(self, Self::CorrelationTimeout { .. })
    }
}

pub type BusResult<T> = std::result::Result<T, BusError>;
