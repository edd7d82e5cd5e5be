//! # Subscriptions and Dispatchers
//!
//! A [`SubscriptionEndpoint`] is a routing target: a filter deciding which
//! published messages it receives, and a [`Dispatcher`] that hands each
//! delivery to its ultimate consumer.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use super::filters::SubscriptionFilter;
use crate::messaging::{MessageDelivery, PublishRequest};

/// Failure of a single dispatch attempt, classified for retry routing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// May succeed if attempted again
    #[error("Retryable dispatch failure: {message}")]
    Retryable { message: String },

    /// Will never succeed; skips remaining retries
    #[error("Permanent dispatch failure: {message}")]
    Permanent { message: String },
}

impl DispatchError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Retryable { message } | Self::Permanent { message } => message,
        }
    }
}

/// Per-attempt information handed to [`Dispatcher::dispatch`]
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub subscription_id: Uuid,
    pub subscription_name: String,
    /// Name of the delivery core performing the attempt
    pub delivery_core: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub dispatched_at: DateTime<Utc>,
}

impl DispatchContext {
    pub fn new(
        endpoint: &SubscriptionEndpoint,
        delivery: &MessageDelivery,
        delivery_core: impl Into<String>,
    ) -> Self {
        Self {
            subscription_id: endpoint.id,
            subscription_name: endpoint.name.clone(),
            delivery_core: delivery_core.into(),
            attempt: delivery.retry_count.saturating_add(1),
            dispatched_at: Utc::now(),
        }
    }
}

/// Hands a delivery to its ultimate consumer.
///
/// `start`/`stop` are driven by the runtime; delivery cores only call
/// `dispatch` between them.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        context: &DispatchContext,
    ) -> Result<(), DispatchError>;

    async fn start(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), DispatchError> {
        Ok(())
    }

    fn dispatcher_name(&self) -> &str {
        "unnamed_dispatcher"
    }
}

/// A routing target
#[derive(Clone)]
pub struct SubscriptionEndpoint {
    pub id: Uuid,
    pub name: String,
    pub contract_type: String,
    /// `None` accepts everything as a normal subscription
    pub filter: Option<SubscriptionFilter>,
    /// `None` is a misconfiguration surfaced at dispatch time
    pub dispatcher: Option<Arc<dyn Dispatcher>>,
    /// Not persisted across restarts
    pub transient: bool,
    pub expiration: Option<DateTime<Utc>>,
    /// Named delivery core; the runtime default is used when unset
    pub delivery_core: Option<String>,
}

impl SubscriptionEndpoint {
    pub fn new(
        name: impl Into<String>,
        contract_type: impl Into<String>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            contract_type: contract_type.into(),
            filter: None,
            dispatcher: Some(dispatcher),
            transient: false,
            expiration: None,
            delivery_core: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn with_filter(mut self, filter: SubscriptionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_expiration(mut self, expiration: DateTime<Utc>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_delivery_core(mut self, core: impl Into<String>) -> Self {
        self.delivery_core = Some(core.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn without_dispatcher(mut self) -> Self {
        self.dispatcher = None;
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    pub fn is_unhandled_fallback(&self) -> bool {
        self.filter
            .as_ref()
            .is_some_and(SubscriptionFilter::is_unhandled_fallback)
    }

    /// An absent filter accepts every request
    pub fn accepts(&self, request: &PublishRequest) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |filter| filter.include(request))
    }

    /// Dispatch through the configured dispatcher
    pub async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.dispatch(delivery, context).await,
            None => Err(DispatchError::retryable(format!(
                "no dispatcher configured for subscription '{}' ({})",
                self.name, self.id
            ))),
        }
    }
}

impl fmt::Debug for SubscriptionEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEndpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("contract_type", &self.contract_type)
            .field("filter", &self.filter)
            .field(
                "dispatcher",
                &self.dispatcher.as_ref().map(|d| d.dispatcher_name().to_string()),
            )
            .field("transient", &self.transient)
            .field("expiration", &self.expiration)
            .field("delivery_core", &self.delivery_core)
            .finish()
    }
}
