use std::time::Duration;

use proptest::prelude::*;
use serde_json::json;
use uuid::Uuid;

use courier_core::delivery::RetryPolicy;
use courier_core::{MessageDelivery, MessageDeliveryContext};

/// Strategy for contract type names
pub fn contract_type_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_.]{0,31}"
}

/// Strategy for action names
pub fn action_strategy() -> impl Strategy<Value = String> {
    "[A-Z][a-zA-Z]{0,15}"
}

/// Strategy for error messages recorded in failure history
pub fn error_message_strategy() -> impl Strategy<Value = String> {
    "[a-z ]{1,40}"
}

/// Strategy for retry policies with delays small enough to stay in range
pub fn retry_policy_strategy() -> impl Strategy<Value = RetryPolicy> {
    (1u64..5_000, any::<bool>()).prop_map(|(millis, exponential)| RetryPolicy {
        base_delay: Duration::from_millis(millis),
        exponential_backoff: exponential,
    })
}

/// Strategy for delivery records at an arbitrary point of their retry history
pub fn delivery_strategy() -> impl Strategy<Value = MessageDelivery> {
    (
        contract_type_strategy(),
        action_strategy(),
        0u32..10,
        0u32..10,
        any::<i64>(),
    )
        .prop_map(|(contract_type, action, retry_count, max_retries, id)| {
            let mut delivery = MessageDelivery::new(
                Uuid::new_v4(),
                contract_type,
                action,
                json!({"id": id}),
                max_retries,
                MessageDeliveryContext::new(),
            );
            delivery.retry_count = retry_count;
            delivery
        })
}
