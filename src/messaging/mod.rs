//! # Messaging
//!
//! Message data model, the delivery queue contract with its explicit
//! transaction handle, and the in-memory queue implementation.

pub mod context;
pub mod errors;
pub mod in_memory_queue;
pub mod message;
pub mod queue;

pub use context::{ContextKey, MessageDeliveryContext};
pub use errors::{MessagingError, MessagingResult};
pub use in_memory_queue::InMemoryDeliveryQueue;
pub use message::{MessageDelivery, PublishRequest};
pub use queue::{ClaimedDelivery, DeliveryQueue, DeliveryTransaction};
