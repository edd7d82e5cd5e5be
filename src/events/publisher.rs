use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::constants::defaults;
use crate::messaging::MessageDelivery;

/// Delivery lifecycle notification
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A delivery attempt completed successfully
    Delivered {
        delivery: MessageDelivery,
        delivery_core: String,
        at: DateTime<Utc>,
    },
    /// A delivery attempt failed; `permanent` when the record went to the
    /// failure queue
    Failed {
        delivery: MessageDelivery,
        error: String,
        permanent: bool,
        at: DateTime<Utc>,
    },
    /// Unexpected error caught at a worker loop boundary
    UnhandledError {
        component: String,
        error: String,
        is_terminating: bool,
        at: DateTime<Utc>,
    },
}

impl BusEvent {
    pub fn delivered(delivery: MessageDelivery, delivery_core: impl Into<String>) -> Self {
        Self::Delivered {
            delivery,
            delivery_core: delivery_core.into(),
            at: Utc::now(),
        }
    }

    pub fn failed(delivery: MessageDelivery, error: impl Into<String>, permanent: bool) -> Self {
        Self::Failed {
            delivery,
            error: error.into(),
            permanent,
            at: Utc::now(),
        }
    }

    pub fn unhandled(
        component: impl Into<String>,
        error: impl Into<String>,
        is_terminating: bool,
    ) -> Self {
        Self::UnhandledError {
            component: component.into(),
            error: error.into(),
            is_terminating,
            at: Utc::now(),
        }
    }

    /// Delivery the event refers to, if any
    pub fn delivery(&self) -> Option<&MessageDelivery> {
        match self {
            Self::Delivered { delivery, .. } | Self::Failed { delivery, .. } => Some(delivery),
            Self::UnhandledError { .. } => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Delivered { .. } => "delivered",
            Self::Failed { .. } => "failed",
            Self::UnhandledError { .. } => "unhandled_error",
        }
    }
}

#[derive(Debug, Default)]
struct PublisherCounters {
    delivered: AtomicU64,
    failed: AtomicU64,
    permanent_failures: AtomicU64,
    unhandled: AtomicU64,
}

/// Fire-and-forget broadcaster of [`BusEvent`]s
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<BusEvent>,
    counters: Arc<PublisherCounters>,
}

impl EventPublisher {
    /// Create a new event publisher with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            counters: Arc::new(PublisherCounters::default()),
        }
    }

    /// Broadcast an event. Never blocks; an event with no receivers is dropped.
    pub fn publish(&self, event: BusEvent) {
        let counter = match &event {
            BusEvent::Delivered { .. } => &self.counters.delivered,
            BusEvent::Failed { permanent, .. } => {
                if *permanent {
                    self.counters.permanent_failures.fetch_add(1, Ordering::Relaxed);
                }
                &self.counters.failed
            }
            BusEvent::UnhandledError { .. } => &self.counters.unhandled,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        if self.sender.send(event).is_err() {
            trace!("No event subscribers; notification dropped");
        }
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> EventPublisherStats {
        EventPublisherStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            permanent_failures: self.counters.permanent_failures.load(Ordering::Relaxed),
            unhandled_errors: self.counters.unhandled.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(defaults::EVENT_CHANNEL_CAPACITY)
    }
}

/// Totals of events published since creation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventPublisherStats {
    pub delivered: u64,
    pub failed: u64,
    pub permanent_failures: u64,
    pub unhandled_errors: u64,
    pub subscribers: usize,
}
