//! # In-Memory Delivery Queue
//!
//! FIFO [`DeliveryQueue`] held in process memory. Claims are tracked so the
//! queue takes part in [`DeliveryTransaction`](super::DeliveryTransaction)s:
//! a claimed record is invisible until it is acknowledged (removed) or
//! released (returned to the head of the queue).
//!
//! Used for tests, local delivery, and as the reference implementation of the
//! queue contract. Nothing survives a restart.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use super::message::MessageDelivery;
use super::queue::{ClaimedDelivery, DeliveryQueue};

/// Record wrapper with queue metadata
#[derive(Debug, Clone)]
struct QueuedDelivery {
    delivery: MessageDelivery,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<QueuedDelivery>,
    in_flight: HashMap<u64, QueuedDelivery>,
    next_receipt: u64,
}

/// In-memory transactional queue
#[derive(Debug)]
pub struct InMemoryDeliveryQueue {
    name: String,
    state: Mutex<QueueState>,
    available: Notify,
}

impl InMemoryDeliveryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
        }
    }

    /// Visible records
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Claimed but not yet acknowledged or released
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Drop every visible record, returning how many were removed
    pub fn purge(&self) -> usize {
        let mut state = self.state.lock();
        let removed = state.ready.len();
        state.ready.clear();
        removed
    }

    /// Age of the oldest visible record
    pub fn oldest_age(&self) -> Option<chrono::Duration> {
        self.state
            .lock()
            .ready
            .front()
            .map(|queued| Utc::now() - queued.enqueued_at)
    }

    /// Wait until `take` yields a value or `timeout` elapses
    async fn wait_for<T>(
        &self,
        timeout: Duration,
        mut take: impl FnMut(&mut QueueState) -> Option<T>,
    ) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            let found = take(&mut *self.state.lock());
            if found.is_some() {
                return found;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look in case a notification raced the deadline
                return take(&mut *self.state.lock());
            }
        }
    }

    fn push_back(&self, delivery: MessageDelivery) {
        self.state.lock().ready.push_back(QueuedDelivery {
            delivery,
            enqueued_at: Utc::now(),
        });
        self.available.notify_waiters();
    }
}

#[async_trait]
impl DeliveryQueue for InMemoryDeliveryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn enqueue(&self, delivery: MessageDelivery) -> MessagingResult<()> {
        self.push_back(delivery);
        Ok(())
    }

    async fn peek(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>> {
        Ok(self
            .wait_for(timeout, |state| {
                state.ready.front().map(|queued| queued.delivery.clone())
            })
            .await)
    }

    async fn dequeue(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>> {
        Ok(self
            .wait_for(timeout, |state| {
                state.ready.pop_front().map(|queued| queued.delivery)
            })
            .await)
    }

    async fn dequeue_by_id(
        &self,
        delivery_id: Uuid,
        timeout: Duration,
    ) -> MessagingResult<Option<MessageDelivery>> {
        Ok(self
            .wait_for(timeout, |state| {
                let position = state
                    .ready
                    .iter()
                    .position(|queued| queued.delivery.delivery_id == delivery_id)?;
                state.ready.remove(position).map(|queued| queued.delivery)
            })
            .await)
    }

    async fn list_messages(&self) -> MessagingResult<Vec<MessageDelivery>> {
        Ok(self
            .state
            .lock()
            .ready
            .iter()
            .map(|queued| queued.delivery.clone())
            .collect())
    }

    async fn claim(&self, timeout: Duration) -> MessagingResult<Option<ClaimedDelivery>> {
        Ok(self
            .wait_for(timeout, |state| {
                let queued = state.ready.pop_front()?;
                let receipt = state.next_receipt;
                state.next_receipt += 1;
                let delivery = queued.delivery.clone();
                state.in_flight.insert(receipt, queued);
                Some(ClaimedDelivery { receipt, delivery })
            })
            .await)
    }

    async fn acknowledge(&self, claim: &ClaimedDelivery) -> MessagingResult<()> {
        self.state
            .lock()
            .in_flight
            .remove(&claim.receipt)
            .map(|_| ())
            .ok_or_else(|| MessagingError::claim_not_found(&self.name, claim.receipt))
    }

    async fn release(&self, claim: ClaimedDelivery) -> MessagingResult<()> {
        {
            let mut state = self.state.lock();
            let queued = state
                .in_flight
                .remove(&claim.receipt)
                .ok_or_else(|| MessagingError::claim_not_found(&self.name, claim.receipt))?;
            state.ready.push_front(queued);
        }
        self.available.notify_waiters();
        Ok(())
    }
}
