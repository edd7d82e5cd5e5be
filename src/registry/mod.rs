//! # Subscription Registry
//!
//! Subscription endpoints, the filters that select their messages, the
//! dispatcher capability that delivers to consumers, and the registry that
//! holds them.
//!
//! ```text
//! Registry
//! ├── SubscriptionEndpoint   (filter + dispatcher + expiry + core)
//! ├── SubscriptionFilter     (Normal | UnhandledFallback predicate)
//! └── SubscriptionRegistry   (versioned, snapshot-read store)
//! ```

pub mod filters;
pub mod subscriber_registry;
pub mod subscription;

pub use filters::{
    ActionFilter, ContractTypeFilter, ExclusionFilter, FilterKind, MessageFilter, NotFilter,
    PassThroughFilter, PredicateFilter, SubscriptionFilter,
};
pub use subscriber_registry::{RegistryStats, SubscriptionRegistry};
pub use subscription::{DispatchContext, DispatchError, Dispatcher, SubscriptionEndpoint};
