//! # Subscription Registry
//!
//! Thread-safe store of [`SubscriptionEndpoint`]s shared by the router and
//! the delivery cores.
//!
//! Readers take a snapshot (an `Arc` of the current endpoint list) and route
//! against it without holding any lock, so publishes never contend with each
//! other. Writers replace the list wholesale and bump a version counter.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use courier_core::registry::{SubscriptionEndpoint, SubscriptionRegistry};
//! # use courier_core::registry::{DispatchContext, DispatchError, Dispatcher};
//! # use courier_core::messaging::MessageDelivery;
//! # struct Audit;
//! # #[async_trait::async_trait]
//! # impl Dispatcher for Audit {
//! #     async fn dispatch(&self, _: &MessageDelivery, _: &DispatchContext) -> Result<(), DispatchError> { Ok(()) }
//! # }
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SubscriptionRegistry::new();
//! let endpoint = SubscriptionEndpoint::new("audit", "orders", Arc::new(Audit));
//! let id = registry.subscribe(endpoint)?;
//!
//! let snapshot = registry.active_snapshot(Utc::now());
//! assert_eq!(snapshot.len(), 1);
//! registry.unsubscribe(id)?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::subscription::SubscriptionEndpoint;
use crate::error::{BusError, BusResult};
use crate::logging::log_subscription_operation;

#[derive(Debug, Default)]
struct RegistryState {
    version: u64,
    endpoints: Arc<Vec<Arc<SubscriptionEndpoint>>>,
}

/// Registry of subscription endpoints
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    state: RwLock<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint, rejecting a repeated id
    pub fn subscribe(&self, endpoint: SubscriptionEndpoint) -> BusResult<Uuid> {
        let id = endpoint.id;
        let mut state = self.state.write();
        if state.endpoints.iter().any(|existing| existing.id == id) {
            return Err(BusError::DuplicateSubscription {
                subscription_id: id,
            });
        }

        let mut endpoints = Vec::with_capacity(state.endpoints.len() + 1);
        endpoints.extend(state.endpoints.iter().cloned());
        log_subscription_operation(
            "subscribe",
            id,
            &endpoint.name,
            &endpoint.contract_type,
            "registered",
        );
        endpoints.push(Arc::new(endpoint));

        state.endpoints = Arc::new(endpoints);
        state.version += 1;
        Ok(id)
    }

    /// Remove an endpoint, returning it so the caller can stop its dispatcher
    pub fn unsubscribe(&self, subscription_id: Uuid) -> BusResult<Arc<SubscriptionEndpoint>> {
        let mut state = self.state.write();
        let position = state
            .endpoints
            .iter()
            .position(|existing| existing.id == subscription_id)
            .ok_or(BusError::SubscriptionNotFound { subscription_id })?;

        let mut endpoints: Vec<_> = state.endpoints.iter().cloned().collect();
        let removed = endpoints.remove(position);
        state.endpoints = Arc::new(endpoints);
        state.version += 1;

        log_subscription_operation(
            "unsubscribe",
            removed.id,
            &removed.name,
            &removed.contract_type,
            "removed",
        );
        Ok(removed)
    }

    pub fn get(&self, subscription_id: Uuid) -> Option<Arc<SubscriptionEndpoint>> {
        self.state
            .read()
            .endpoints
            .iter()
            .find(|endpoint| endpoint.id == subscription_id)
            .cloned()
    }

    /// Every registered endpoint, expired or not
    pub fn snapshot(&self) -> Arc<Vec<Arc<SubscriptionEndpoint>>> {
        Arc::clone(&self.state.read().endpoints)
    }

    /// Endpoints not expired at `now`
    pub fn active_snapshot(&self, now: DateTime<Utc>) -> Vec<Arc<SubscriptionEndpoint>> {
        self.snapshot()
            .iter()
            .filter(|endpoint| !endpoint.is_expired_at(now))
            .cloned()
            .collect()
    }

    /// Incremented on every change
    pub fn version(&self) -> u64 {
        self.state.read().version
    }

    pub fn len(&self) -> usize {
        self.state.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every endpoint expired at `now`, returning the removed endpoints
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<Arc<SubscriptionEndpoint>> {
        let mut state = self.state.write();
        let (expired, kept): (Vec<_>, Vec<_>) = state
            .endpoints
            .iter()
            .cloned()
            .partition(|endpoint| endpoint.is_expired_at(now));

        if expired.is_empty() {
            debug!("No expired subscriptions to purge");
            return expired;
        }

        state.endpoints = Arc::new(kept);
        state.version += 1;
        info!(purged = expired.len(), "🧹 Purged expired subscriptions");
        expired
    }

    pub fn stats(&self, now: DateTime<Utc>) -> RegistryStats {
        let state = self.state.read();
        let mut stats = RegistryStats {
            version: state.version,
            total_subscriptions: state.endpoints.len(),
            ..RegistryStats::default()
        };
        for endpoint in state.endpoints.iter() {
            if endpoint.is_expired_at(now) {
                stats.expired_subscriptions += 1;
            }
            if endpoint.is_unhandled_fallback() {
                stats.fallback_subscriptions += 1;
            }
            if endpoint.transient {
                stats.transient_subscriptions += 1;
            }
        }
        stats
    }
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub version: u64,
    pub total_subscriptions: usize,
    pub expired_subscriptions: usize,
    pub fallback_subscriptions: usize,
    pub transient_subscriptions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageDelivery;
    use crate::registry::filters::SubscriptionFilter;
    use crate::registry::subscription::{DispatchContext, DispatchError, Dispatcher};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl Dispatcher for Noop {
        async fn dispatch(
            &self,
            _delivery: &MessageDelivery,
            _context: &DispatchContext,
        ) -> Result<(), DispatchError> {
            Ok(())
        }
    }

    fn endpoint(name: &str) -> SubscriptionEndpoint {
        SubscriptionEndpoint::new(name, "orders", Arc::new(Noop))
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let registry = SubscriptionRegistry::new();
        let id = registry.subscribe(endpoint("audit")).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.version(), 1);
        assert!(registry.get(id).is_some());

        let removed = registry.unsubscribe(id).unwrap();
        assert_eq!(removed.name, "audit");
        assert!(registry.is_empty());
        assert_eq!(registry.version(), 2);
    }

    #[test]
    fn test_duplicate_and_unknown_ids_rejected() {
        let registry = SubscriptionRegistry::new();
        let first = endpoint("audit");
        let id = first.id;
        registry.subscribe(first).unwrap();

        let err = registry.subscribe(endpoint("copy").with_id(id)).unwrap_err();
        assert!(matches!(err, BusError::DuplicateSubscription { .. }));

        let err = registry.unsubscribe(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, BusError::SubscriptionNotFound { .. }));
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_changes() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe(endpoint("a")).unwrap();
        let snapshot = registry.snapshot();
        registry.subscribe(endpoint("b")).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_expired_endpoints_are_skipped_and_purged() {
        let now = Utc::now();
        let registry = SubscriptionRegistry::new();
        registry
            .subscribe(endpoint("stale").with_expiration(now - chrono::Duration::seconds(1)))
            .unwrap();
        registry
            .subscribe(endpoint("fallback").with_filter(SubscriptionFilter::unhandled_any()))
            .unwrap();

        assert_eq!(registry.active_snapshot(now).len(), 1);
        let stats = registry.stats(now);
        assert_eq!(stats.expired_subscriptions, 1);
        assert_eq!(stats.fallback_subscriptions, 1);

        let purged = registry.purge_expired(now);
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].name, "stale");
        assert_eq!(registry.len(), 1);
        assert!(registry.purge_expired(now).is_empty());
    }
}
