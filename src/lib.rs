#![allow(clippy::doc_markdown)] // Allow technical terms in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Courier Core
//!
//! Delivery and routing engine of a durable, pluggable message bus.
//!
//! ## Overview
//!
//! Producers publish typed messages. The [`routing`] layer fans each message
//! out to the subscriptions whose filters accept it, and a delivery core hands
//! every resulting record to the subscription's dispatcher. The queued core
//! retries failed attempts with backoff and parks exhausted records in a
//! failure queue. Two-way publish waits for a correlated reply.
//!
//! ## Architecture
//!
//! ```text
//! publish ─▶ SubscriptionRouter ─▶ DeliveryCore ─┬─▶ DirectDeliveryCore ─▶ Dispatcher
//!                 │  (one transaction)           └─▶ QueuedDeliveryCore
//!                 ▼                                     primary ─▶ workers ─▶ Dispatcher
//!           SubscriptionRegistry                           ├─▶ retry queue (backoff)
//!                                                          └─▶ failure queue
//! reply  ─▶ Correlator ─▶ publish_two_way caller
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - Records, context, queue contract and transactions
//! - [`registry`] - Subscriptions, filters and dispatchers
//! - [`routing`] - Two-tier fan-out router
//! - [`delivery`] - Direct and queued delivery cores, retry policy
//! - [`correlation`] - Request/response correlator
//! - [`execution`] - Generic worker pool
//! - [`events`] - Delivery notifications
//! - [`runtime`] - Lifecycle owner and publish entry point
//! - [`config`] - Configuration management
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_core::config::BusConfig;
//! use courier_core::delivery::DeliveryQueues;
//! use courier_core::dispatchers::FnDispatcher;
//! use courier_core::messaging::PublishRequest;
//! use courier_core::registry::{DispatchContext, SubscriptionEndpoint};
//! use courier_core::MessageBusRuntime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! courier_core::logging::init_structured_logging();
//!
//! let runtime = MessageBusRuntime::new(BusConfig::default())?;
//! runtime.use_queued_delivery(DeliveryQueues::in_memory("orders"));
//! runtime
//!     .subscribe(SubscriptionEndpoint::new(
//!         "billing",
//!         "orders",
//!         Arc::new(FnDispatcher::new("billing", |delivery, _ctx: DispatchContext| async move {
//!             println!("billing {}", delivery.message);
//!             Ok::<(), anyhow::Error>(())
//!         })),
//!     ))
//!     .await?;
//!
//! runtime.start().await?;
//! runtime
//!     .publish(PublishRequest::new("orders", "Created", serde_json::json!({"id": 1})))
//!     .await?;
//! runtime.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod constants;
pub mod correlation;
pub mod delivery;
pub mod dispatchers;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod messaging;
pub mod registry;
pub mod routing;
pub mod runtime;

pub use config::{BusConfig, ConfigManager, ConfigurationError};
pub use correlation::{CorrelationWaiter, Correlator};
pub use delivery::{DeliveryCore, DeliveryQueues, DirectDeliveryCore, QueuedDeliveryCore, RetryPolicy};
pub use error::{BusError, BusResult};
pub use events::{BusEvent, EventPublisher};
pub use execution::{StopOutcome, WorkerHandle, WorkerPool};
pub use messaging::{
    ContextKey, DeliveryQueue, DeliveryTransaction, InMemoryDeliveryQueue, MessageDelivery,
    MessageDeliveryContext, MessagingError, PublishRequest,
};
pub use registry::{
    DispatchContext, DispatchError, Dispatcher, FilterKind, MessageFilter, SubscriptionEndpoint,
    SubscriptionFilter, SubscriptionRegistry,
};
pub use routing::SubscriptionRouter;
pub use runtime::MessageBusRuntime;
