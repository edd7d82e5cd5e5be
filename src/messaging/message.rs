//! # Message Structures
//!
//! [`PublishRequest`] is what a producer hands to the bus; [`MessageDelivery`]
//! is the durable per-subscription unit of work the router fans it out into.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use super::context::{ContextKey, MessageDeliveryContext};
use crate::delivery::retry::RetryPolicy;

/// Ephemeral publish request, consumed immediately by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Logical message category
    pub contract_type: String,
    /// Operation name
    pub action: String,
    /// Opaque payload
    pub message: Value,
    pub context: MessageDeliveryContext,
}

impl PublishRequest {
    pub fn new(contract_type: impl Into<String>, action: impl Into<String>, message: Value) -> Self {
        Self {
            contract_type: contract_type.into(),
            action: action.into(),
            message,
            context: MessageDeliveryContext::new(),
        }
    }

    pub fn with_context(mut self, context: MessageDeliveryContext) -> Self {
        self.context = context;
        self
    }

    /// Reply-shaped requests carry the correlation id they answer
    pub fn is_reply(&self) -> bool {
        self.context.relates_to().is_some()
    }
}

/// Durable attempt-to-deliver unit for one subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDelivery {
    /// Stable across every retry of the same logical delivery
    pub delivery_id: Uuid,
    pub subscription_id: Uuid,
    pub contract_type: String,
    pub action: String,
    pub message: Value,
    /// Attempts that have already failed
    pub retry_count: u32,
    pub max_retries: u32,
    /// Not eligible for dispatch before this instant
    pub time_to_process: Option<DateTime<Utc>>,
    /// Expired, and never dispatched, after this instant
    pub must_deliver_by: Option<DateTime<Utc>>,
    pub context: MessageDeliveryContext,
}

impl MessageDelivery {
    /// Create a fresh delivery record with a new identity
    pub fn new(
        subscription_id: Uuid,
        contract_type: impl Into<String>,
        action: impl Into<String>,
        message: Value,
        max_retries: u32,
        context: MessageDeliveryContext,
    ) -> Self {
        Self {
            delivery_id: Uuid::new_v4(),
            subscription_id,
            contract_type: contract_type.into(),
            action: action.into(),
            message,
            retry_count: 0,
            max_retries,
            time_to_process: None,
            must_deliver_by: None,
            context,
        }
    }

    /// Fan-out record for one subscription
    pub fn for_subscription(
        request: &PublishRequest,
        subscription_id: Uuid,
        max_retries: u32,
    ) -> Self {
        Self::new(
            subscription_id,
            request.contract_type.clone(),
            request.action.clone(),
            request.message.clone(),
            max_retries,
            request.context.clone(),
        )
    }

    pub fn with_must_deliver_by(mut self, deadline: DateTime<Utc>) -> Self {
        self.must_deliver_by = Some(deadline);
        self
    }

    pub fn with_time_to_process(mut self, at: DateTime<Utc>) -> Self {
        self.time_to_process = Some(at);
        self
    }

    /// True when no retry may follow a failure of the current attempt
    pub fn is_retries_maxed(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.must_deliver_by.is_some_and(|deadline| deadline <= now)
    }

    /// Whether dispatch must be deferred because the record is not yet due
    pub fn is_deferred_at(&self, now: DateTime<Utc>) -> bool {
        self.time_to_process.is_some_and(|at| at > now)
    }

    /// Derive the successor of a failed attempt.
    ///
    /// The source record is left untouched. The successor keeps `delivery_id`,
    /// has its retry count incremented (or reset to zero), becomes eligible
    /// after the policy's delay and carries `error` in its failure history.
    pub fn create_retry(
        &self,
        reset_retry_count: bool,
        policy: &RetryPolicy,
        error: Option<&str>,
    ) -> MessageDelivery {
        let retry_count = if reset_retry_count {
            0
        } else {
            self.retry_count.saturating_add(1)
        };
        let delay = policy.delay_for(retry_count.max(1));

        let context = match error {
            Some(error) => self.context.with_exception(error),
            None => self.context.clone(),
        };

        MessageDelivery {
            retry_count,
            time_to_process: Some(Utc::now() + to_chrono(delay)),
            context,
            ..self.clone()
        }
    }

    /// Derive the record parked in the failure queue once a delivery can no
    /// longer be attempted.
    pub fn create_failure(&self, error: &str) -> MessageDelivery {
        MessageDelivery {
            retry_count: self.retry_count.saturating_add(1),
            time_to_process: None,
            context: self.context.with_exception(error),
            ..self.clone()
        }
    }

    /// Build the reply to this delivery for a two-way publish.
    ///
    /// `None` when the delivery carries no correlation id.
    pub fn reply(&self, action: impl Into<String>, message: Value) -> Option<PublishRequest> {
        let correlation_id = self.context.correlation_id()?;
        let context = self
            .context
            .without(&ContextKey::correlation_id())
            .with(ContextKey::relates_to(), Value::String(correlation_id.to_string()));
        Some(PublishRequest {
            contract_type: self.contract_type.clone(),
            action: action.into(),
            message,
            context,
        })
    }
}

// Sub-millisecond delays are rounded up so a derived record is always due
// strictly after the moment it was created.
fn to_chrono(delay: Duration) -> ChronoDuration {
    let delay = delay.max(Duration::from_millis(1));
    ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::days(365))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MessageDelivery {
        MessageDelivery::new(
            Uuid::new_v4(),
            "orders",
            "Created",
            json!({"order_id": 42}),
            3,
            MessageDeliveryContext::new(),
        )
    }

    #[test]
    fn test_new_delivery_defaults() {
        let delivery = sample();
        assert_eq!(delivery.retry_count, 0);
        assert!(delivery.time_to_process.is_none());
        assert!(delivery.must_deliver_by.is_none());
        assert!(!delivery.is_retries_maxed());
    }

    #[test]
    fn test_create_retry_preserves_identity() {
        let original = sample();
        let policy = RetryPolicy::fixed(Duration::from_millis(50));
        let retry = original.create_retry(false, &policy, Some("timeout"));

        assert_eq!(retry.delivery_id, original.delivery_id);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.context.exceptions(), vec!["timeout"]);
        assert_eq!(original.retry_count, 0);
        assert!(original.context.exceptions().is_empty());
    }

    #[test]
    fn test_create_retry_with_reset() {
        let mut original = sample();
        original.retry_count = 2;
        let retry = original.create_retry(true, &RetryPolicy::default(), None);
        assert_eq!(retry.retry_count, 0);
        assert!(retry.time_to_process.is_some());
    }

    #[test]
    fn test_expiry_and_deferral() {
        let now = Utc::now();
        let delivery = sample()
            .with_must_deliver_by(now - ChronoDuration::seconds(1))
            .with_time_to_process(now + ChronoDuration::seconds(10));
        assert!(delivery.is_expired_at(now));
        assert!(delivery.is_deferred_at(now));
    }

    #[test]
    fn test_failure_record_is_terminal() {
        let mut delivery = sample();
        delivery.retry_count = 3;
        assert!(delivery.is_retries_maxed());
        let failure = delivery.create_failure("boom");
        assert_eq!(failure.retry_count, 4);
        assert!(failure.time_to_process.is_none());
        assert_eq!(failure.context.exceptions(), vec!["boom"]);
    }

    #[test]
    fn test_reply_detection() {
        let request = PublishRequest::new("orders", "Reply", json!(null)).with_context(
            MessageDeliveryContext::new()
                .with(crate::messaging::ContextKey::relates_to(), json!("c-1")),
        );
        assert!(request.is_reply());
    }

    #[test]
    fn test_reply_swaps_correlation_for_relates_to() {
        let delivery = sample();
        assert!(delivery.reply("Reply", json!(1)).is_none());

        let request = MessageDelivery {
            context: MessageDeliveryContext::new()
                .with(ContextKey::correlation_id(), json!("c-9")),
            ..delivery
        };
        let reply = request.reply("Reply", json!({"echo": true})).unwrap();
        assert!(reply.is_reply());
        assert_eq!(reply.context.relates_to(), Some("c-9"));
        assert!(reply.context.correlation_id().is_none());
        assert_eq!(reply.contract_type, "orders");
    }
}
