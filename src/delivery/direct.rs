//! # Direct Delivery
//!
//! Dispatches synchronously inside `deliver`. No queue, no retries: a failed
//! dispatch is reported as a permanent failure and returned to the caller,
//! which rolls back the surrounding fan-out.
//!
//! Suited to local, low-risk targets or dispatchers that queue on their own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::core::{dispatch_guarded, DeliveryCore};
use crate::constants::cores;
use crate::error::BusResult;
use crate::events::{BusEvent, EventPublisher};
use crate::logging::log_delivery_operation;
use crate::messaging::{DeliveryTransaction, MessageDelivery};
use crate::registry::{DispatchContext, SubscriptionRegistry};

#[derive(Debug)]
pub struct DirectDeliveryCore {
    name: String,
    registry: Arc<SubscriptionRegistry>,
    events: EventPublisher,
}

impl DirectDeliveryCore {
    pub fn new(registry: Arc<SubscriptionRegistry>, events: EventPublisher) -> Self {
        Self::named(cores::DIRECT, registry, events)
    }

    pub fn named(
        name: impl Into<String>,
        registry: Arc<SubscriptionRegistry>,
        events: EventPublisher,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            events,
        }
    }
}

#[async_trait]
impl DeliveryCore for DirectDeliveryCore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(
        &self,
        delivery: MessageDelivery,
        _tx: &mut DeliveryTransaction,
    ) -> BusResult<()> {
        if delivery.is_expired_at(Utc::now()) {
            let failure = delivery.create_failure("delivery expired before dispatch");
            log_delivery_operation(
                "direct_deliver",
                failure.delivery_id,
                failure.subscription_id,
                failure.retry_count,
                "expired",
                None,
            );
            self.events
                .publish(BusEvent::failed(failure, "delivery expired before dispatch", true));
            return Ok(());
        }

        let Some(endpoint) = self.registry.get(delivery.subscription_id) else {
            debug!(
                delivery_id = %delivery.delivery_id,
                subscription_id = %delivery.subscription_id,
                "Subscription removed before dispatch; skipping"
            );
            self.events.publish(BusEvent::delivered(delivery, &self.name));
            return Ok(());
        };

        let context = DispatchContext::new(&endpoint, &delivery, &self.name);
        match dispatch_guarded(&endpoint, &delivery, &context).await {
            Ok(()) => {
                log_delivery_operation(
                    "direct_deliver",
                    delivery.delivery_id,
                    delivery.subscription_id,
                    delivery.retry_count,
                    "delivered",
                    None,
                );
                self.events.publish(BusEvent::delivered(delivery, &self.name));
                Ok(())
            }
            Err(err) => {
                let failure = delivery.create_failure(err.message());
                log_delivery_operation(
                    "direct_deliver",
                    failure.delivery_id,
                    failure.subscription_id,
                    failure.retry_count,
                    "failed",
                    Some(err.message()),
                );
                self.events
                    .publish(BusEvent::failed(failure, err.message(), true));
                Err(err.into())
            }
        }
    }
}
