//! # Message Delivery Context
//!
//! Immutable, ordered key/value metadata carried by publish requests and
//! delivery records. Deriving a context (adding a key, appending a failure)
//! always produces a new instance; the source is never touched.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::constants::context_keys;

/// Key into a [`MessageDeliveryContext`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextKey(String);

impl ContextKey {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn correlation_id() -> Self {
        Self::new(context_keys::CORRELATION_ID)
    }

    pub fn relates_to() -> Self {
        Self::new(context_keys::RELATES_TO)
    }

    pub fn exceptions() -> Self {
        Self::new(context_keys::EXCEPTIONS)
    }

    pub fn caller_identity() -> Self {
        Self::new(context_keys::CALLER_IDENTITY)
    }

    pub fn transformations() -> Self {
        Self::new(context_keys::TRANSFORMATIONS)
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ContextKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Ordered, unique-keyed, copy-on-derive metadata bag.
///
/// Entries keep insertion order; replacing an existing key keeps its position.
/// Cloning is cheap since the entries are shared.
#[derive(Clone, Default, PartialEq)]
pub struct MessageDeliveryContext {
    entries: Arc<Vec<(ContextKey, Value)>>,
}

impl MessageDeliveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a context from pairs; later duplicates replace earlier ones
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<ContextKey>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut entries: Vec<(ContextKey, Value)> = Vec::new();
        for (key, value) in pairs {
            upsert(&mut entries, key.into(), value);
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, key: &ContextKey) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn get_str(&self, key: &ContextKey) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn contains_key(&self, key: &ContextKey) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContextKey, &Value)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    /// New context with `key` set to `value`
    pub fn with(&self, key: impl Into<ContextKey>, value: Value) -> Self {
        let mut entries = self.entries.as_ref().clone();
        upsert(&mut entries, key.into(), value);
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New context without `key`
    pub fn without(&self, key: &ContextKey) -> Self {
        let entries = self
            .entries
            .iter()
            .filter(|(existing, _)| existing != key)
            .cloned()
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New context with every entry of `other` layered on top
    pub fn merged(&self, other: &MessageDeliveryContext) -> Self {
        let mut entries = self.entries.as_ref().clone();
        for (key, value) in other.entries.iter() {
            upsert(&mut entries, key.clone(), value.clone());
        }
        Self {
            entries: Arc::new(entries),
        }
    }

    /// New context with `error` appended to the failure history
    pub fn with_exception(&self, error: impl Into<String>) -> Self {
        let mut history = self.exceptions();
        history.push(error.into());
        self.with(
            ContextKey::exceptions(),
            Value::Array(history.into_iter().map(Value::String).collect()),
        )
    }

    /// Accumulated failure history, oldest first
    pub fn exceptions(&self) -> Vec<String> {
        match self.get(&ContextKey::exceptions()) {
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.get_str(&ContextKey::correlation_id())
    }

    pub fn relates_to(&self) -> Option<&str> {
        self.get_str(&ContextKey::relates_to())
    }

    pub fn caller_identity(&self) -> Option<&str> {
        self.get_str(&ContextKey::caller_identity())
    }

    /// New context with `step` appended to the transformation lineage
    pub fn with_transformation(&self, step: impl Into<String>) -> Self {
        let mut lineage: Vec<Value> = match self.get(&ContextKey::transformations()) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        lineage.push(Value::String(step.into()));
        self.with(ContextKey::transformations(), Value::Array(lineage))
    }
}

fn upsert(entries: &mut Vec<(ContextKey, Value)>, key: ContextKey, value: Value) {
    match entries.iter_mut().find(|(existing, _)| *existing == key) {
        Some(slot) => slot.1 = value,
        None => entries.push((key, value)),
    }
}

impl fmt::Debug for MessageDeliveryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(k, v)| (k.as_str(), v)))
            .finish()
    }
}

// Serialized as an ordered list of pairs so key order survives a round trip.
impl Serialize for MessageDeliveryContext {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.entries.as_ref().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageDeliveryContext {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(ContextKey, Value)>::deserialize(deserializer)?;
        Ok(Self::from_pairs(pairs))
    }
}
