//! # Subscription Router
//!
//! Fans one [`PublishRequest`] out into per-subscription
//! [`MessageDelivery`] records and hands each to its delivery core.
//!
//! Routing is two-tier. Normal subscriptions are matched first; fallback
//! subscriptions (filters tagged [`FilterKind::UnhandledFallback`]) receive
//! the message only when no normal subscription accepted it. Fallbacks never
//! receive anything when a normal subscription matched.
//!
//! The whole fan-out runs inside one [`DeliveryTransaction`]: if any core
//! rejects its record the transaction is rolled back and nothing is recorded.
//!
//! [`FilterKind::UnhandledFallback`]: crate::registry::FilterKind::UnhandledFallback

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::RouterConfig;
use crate::delivery::DeliveryCore;
use crate::error::{BusError, BusResult};
use crate::messaging::{DeliveryTransaction, MessageDelivery, PublishRequest};
use crate::registry::{SubscriptionEndpoint, SubscriptionRegistry};

/// Selects the delivery core for each routed record
pub trait DeliveryCoreLookup: Send + Sync {
    fn core_for(
        &self,
        endpoint: &SubscriptionEndpoint,
        delivery: &MessageDelivery,
    ) -> Option<Arc<dyn DeliveryCore>>;
}

/// Routes every record through the same core
#[derive(Debug, Clone)]
pub struct SingleCoreLookup {
    core: Arc<dyn DeliveryCore>,
}

impl SingleCoreLookup {
    pub fn new(core: Arc<dyn DeliveryCore>) -> Self {
        Self { core }
    }
}

impl DeliveryCoreLookup for SingleCoreLookup {
    fn core_for(
        &self,
        _endpoint: &SubscriptionEndpoint,
        _delivery: &MessageDelivery,
    ) -> Option<Arc<dyn DeliveryCore>> {
        Some(Arc::clone(&self.core))
    }
}

/// One fan-out record and the endpoint it targets
#[derive(Debug, Clone)]
pub struct RoutedDelivery {
    pub endpoint: Arc<SubscriptionEndpoint>,
    pub delivery: MessageDelivery,
}

/// Result of matching a request against the active subscriptions
#[derive(Debug, Clone, Default)]
pub struct RoutePlan {
    /// At least one normal subscription accepted the request
    pub handled: bool,
    pub deliveries: Vec<RoutedDelivery>,
}

impl RoutePlan {
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    pub fn subscription_ids(&self) -> Vec<Uuid> {
        self.deliveries
            .iter()
            .map(|routed| routed.endpoint.id)
            .collect()
    }
}

pub struct SubscriptionRouter {
    registry: Arc<SubscriptionRegistry>,
    lookup: Arc<dyn DeliveryCoreLookup>,
    config: RouterConfig,
}

impl SubscriptionRouter {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        lookup: Arc<dyn DeliveryCoreLookup>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            lookup,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Match `request` against the subscriptions active at `now`
    pub fn route(&self, request: &PublishRequest, now: DateTime<Utc>) -> RoutePlan {
        let (fallbacks, normal): (Vec<_>, Vec<_>) = self
            .registry
            .active_snapshot(now)
            .into_iter()
            .partition(|endpoint| endpoint.is_unhandled_fallback());

        let mut selected: Vec<_> = normal
            .into_iter()
            .filter(|endpoint| endpoint.accepts(request))
            .collect();
        let handled = !selected.is_empty();

        if !handled {
            selected = fallbacks
                .into_iter()
                .filter(|endpoint| endpoint.accepts(request))
                .collect();
            if !selected.is_empty() {
                debug!(
                    contract_type = %request.contract_type,
                    action = %request.action,
                    fallbacks = selected.len(),
                    "Message unhandled; routing to fallback subscriptions"
                );
            }
        }

        let deadline = self
            .config
            .default_time_to_live()
            .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| now + ttl);

        let deliveries = selected
            .into_iter()
            .map(|endpoint| {
                let mut delivery = MessageDelivery::for_subscription(
                    request,
                    endpoint.id,
                    self.config.default_max_retries,
                );
                if let Some(deadline) = deadline {
                    delivery = delivery.with_must_deliver_by(deadline);
                }
                RoutedDelivery { endpoint, delivery }
            })
            .collect();

        RoutePlan {
            handled,
            deliveries,
        }
    }

    /// Route and deliver `request` in its own transaction.
    ///
    /// Returns the delivery ids recorded, one per matched subscription.
    pub async fn publish(&self, request: &PublishRequest) -> BusResult<Vec<Uuid>> {
        let mut tx = DeliveryTransaction::new();
        match self.publish_in(request, &mut tx).await {
            Ok(ids) => {
                tx.commit().await?;
                Ok(ids)
            }
            Err(e) => {
                warn!(
                    transaction_id = %tx.id(),
                    contract_type = %request.contract_type,
                    error = %e,
                    "Fan-out failed; rolling back"
                );
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    /// Route and deliver `request` inside a caller-owned transaction
    pub async fn publish_in(
        &self,
        request: &PublishRequest,
        tx: &mut DeliveryTransaction,
    ) -> BusResult<Vec<Uuid>> {
        let plan = self.route(request, Utc::now());
        if plan.is_empty() {
            debug!(
                contract_type = %request.contract_type,
                action = %request.action,
                "No subscription accepted message"
            );
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(plan.deliveries.len());
        for RoutedDelivery { endpoint, delivery } in plan.deliveries {
            let core = self
                .lookup
                .core_for(&endpoint, &delivery)
                .ok_or(BusError::NoDeliveryCore {
                    subscription_id: endpoint.id,
                })?;
            ids.push(delivery.delivery_id);
            core.deliver(delivery, tx).await?;
        }
        Ok(ids)
    }
}

impl fmt::Debug for SubscriptionRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRouter")
            .field("subscriptions", &self.registry.len())
            .field("config", &self.config)
            .finish()
    }
}
