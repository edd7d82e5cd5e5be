//! # Delivery
//!
//! Strategies that turn a routed [`MessageDelivery`](crate::messaging::MessageDelivery)
//! into dispatch calls.
//!
//! - [`DirectDeliveryCore`]: dispatches synchronously, no durability
//! - [`QueuedDeliveryCore`]: queue-backed with retries, backoff and a failure queue

pub mod core;
pub mod direct;
pub mod queued;
pub mod retry;

pub use self::core::DeliveryCore;
pub use direct::DirectDeliveryCore;
pub use queued::{DeliveryQueues, QueuedDeliveryCore};
pub use retry::RetryPolicy;
