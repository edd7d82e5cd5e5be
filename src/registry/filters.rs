//! # Message Filters
//!
//! Predicates deciding whether a subscription receives a published message.
//! A [`SubscriptionFilter`] pairs a predicate with an explicit [`FilterKind`]
//! so the router can tell normal subscriptions from unhandled-message
//! fallbacks without inspecting concrete types.
//!
//! Filters run concurrently from every publishing task and must be pure.

use std::fmt;
use std::sync::Arc;

use crate::messaging::PublishRequest;

/// Pure predicate over a publish request
pub trait MessageFilter: Send + Sync + fmt::Debug {
    fn include(&self, request: &PublishRequest) -> bool;
}

/// Routing tier of a filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterKind {
    Normal,
    /// Only considered when no normal subscription accepted the message
    UnhandledFallback,
}

/// Tagged filter attached to a subscription
#[derive(Debug, Clone)]
pub struct SubscriptionFilter {
    kind: FilterKind,
    predicate: Arc<dyn MessageFilter>,
}

impl SubscriptionFilter {
    pub fn normal(predicate: impl MessageFilter + 'static) -> Self {
        Self {
            kind: FilterKind::Normal,
            predicate: Arc::new(predicate),
        }
    }

    pub fn fallback(predicate: impl MessageFilter + 'static) -> Self {
        Self {
            kind: FilterKind::UnhandledFallback,
            predicate: Arc::new(predicate),
        }
    }

    /// Catch messages of `contract_type` that no normal subscription accepted
    pub fn unhandled(contract_type: impl Into<String>) -> Self {
        Self::fallback(ContractTypeFilter::new(contract_type))
    }

    /// Catch every message no normal subscription accepted
    pub fn unhandled_any() -> Self {
        Self::fallback(PassThroughFilter)
    }

    pub fn pass_through() -> Self {
        Self::normal(PassThroughFilter)
    }

    pub fn exclude_all() -> Self {
        Self::normal(ExclusionFilter)
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&PublishRequest) -> bool + Send + Sync + 'static,
    {
        Self::normal(PredicateFilter::new(f))
    }

    pub fn kind(&self) -> FilterKind {
        self.kind
    }

    pub fn is_unhandled_fallback(&self) -> bool {
        self.kind == FilterKind::UnhandledFallback
    }

    pub fn include(&self, request: &PublishRequest) -> bool {
        self.predicate.include(request)
    }
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughFilter;

impl MessageFilter for PassThroughFilter {
    fn include(&self, _request: &PublishRequest) -> bool {
        true
    }
}

/// Rejects everything
#[derive(Debug, Clone, Copy, Default)]
pub struct ExclusionFilter;

impl MessageFilter for ExclusionFilter {
    fn include(&self, _request: &PublishRequest) -> bool {
        false
    }
}

/// Matches on the request's contract type
#[derive(Debug, Clone)]
pub struct ContractTypeFilter {
    contract_type: String,
}

impl ContractTypeFilter {
    pub fn new(contract_type: impl Into<String>) -> Self {
        Self {
            contract_type: contract_type.into(),
        }
    }
}

impl MessageFilter for ContractTypeFilter {
    fn include(&self, request: &PublishRequest) -> bool {
        request.contract_type == self.contract_type
    }
}

/// Matches on one of a set of action names
#[derive(Debug, Clone)]
pub struct ActionFilter {
    actions: Vec<String>,
}

impl ActionFilter {
    pub fn new<I, S>(actions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            actions: actions.into_iter().map(Into::into).collect(),
        }
    }
}

impl MessageFilter for ActionFilter {
    fn include(&self, request: &PublishRequest) -> bool {
        self.actions.iter().any(|action| *action == request.action)
    }
}

/// Closure-backed predicate
pub struct PredicateFilter<F> {
    predicate: F,
}

impl<F> PredicateFilter<F>
where
    F: Fn(&PublishRequest) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self { predicate }
    }
}

impl<F> fmt::Debug for PredicateFilter<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PredicateFilter")
    }
}

impl<F> MessageFilter for PredicateFilter<F>
where
    F: Fn(&PublishRequest) -> bool + Send + Sync,
{
    fn include(&self, request: &PublishRequest) -> bool {
        (self.predicate)(request)
    }
}

/// Inverts another filter
#[derive(Debug)]
pub struct NotFilter {
    inner: Arc<dyn MessageFilter>,
}

impl NotFilter {
    pub fn new(inner: impl MessageFilter + 'static) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl MessageFilter for NotFilter {
    fn include(&self, request: &PublishRequest) -> bool {
        !self.inner.include(request)
    }
}
