//! # Request/Response Correlator
//!
//! Lets a publisher wait, with a timeout, for a reply matched by an opaque
//! correlation id. The dispatch path only calls [`Correlator::reply`]; it
//! never learns who is waiting.
//!
//! A waiter must be registered before the request that triggers the reply is
//! published. Replies for ids with no registered waiter are dropped.
//! Registering an id that is already pending replaces the earlier waiter,
//! whose wait then fails with [`BusError::CorrelationCancelled`].

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BusError, BusResult};
use crate::messaging::MessageDelivery;

type WaiterTable = Mutex<HashMap<String, PendingWaiter>>;

struct PendingWaiter {
    generation: u64,
    sender: oneshot::Sender<Vec<MessageDelivery>>,
}

/// Handle returned by [`Correlator::begin_wait`].
///
/// Dropping the handle unregisters it, so an abandoned wait never leaks.
pub struct CorrelationWaiter {
    correlation_id: String,
    generation: u64,
    receiver: Option<oneshot::Receiver<Vec<MessageDelivery>>>,
    table: Weak<WaiterTable>,
}

impl CorrelationWaiter {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl fmt::Debug for CorrelationWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationWaiter")
            .field("correlation_id", &self.correlation_id)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for CorrelationWaiter {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            unregister(&table, &self.correlation_id, self.generation);
        }
    }
}

// Only removes the entry this waiter registered; a newer registration of the
// same id is left alone.
fn unregister(table: &WaiterTable, correlation_id: &str, generation: u64) {
    let mut waiters = table.lock();
    if waiters
        .get(correlation_id)
        .is_some_and(|pending| pending.generation == generation)
    {
        waiters.remove(correlation_id);
    }
}

/// Table of pending correlation waiters
#[derive(Default)]
pub struct Correlator {
    waiters: Arc<WaiterTable>,
    next_generation: AtomicU64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `correlation_id`
    pub fn begin_wait(&self, correlation_id: impl Into<String>) -> CorrelationWaiter {
        let correlation_id = correlation_id.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();

        let previous = self
            .waiters
            .lock()
            .insert(correlation_id.clone(), PendingWaiter { generation, sender });
        if previous.is_some() {
            warn!(
                correlation_id = %correlation_id,
                "Correlation id registered twice; earlier waiter cancelled"
            );
        }

        CorrelationWaiter {
            correlation_id,
            generation,
            receiver: Some(receiver),
            table: Arc::downgrade(&self.waiters),
        }
    }

    /// Resolve the waiter for `correlation_id` with `delivery`.
    ///
    /// Returns `false` when no waiter was registered (or it already gave up).
    pub fn reply(&self, correlation_id: &str, delivery: MessageDelivery) -> bool {
        let pending = self.waiters.lock().remove(correlation_id);
        match pending {
            Some(pending) => {
                let delivered = pending.sender.send(vec![delivery]).is_ok();
                debug!(correlation_id = %correlation_id, delivered, "Reply correlated");
                delivered
            }
            None => {
                debug!(
                    correlation_id = %correlation_id,
                    "Reply for unknown correlation id dropped"
                );
                false
            }
        }
    }

    /// Wait up to `timeout` for the reply, then unregister the waiter
    pub async fn end_wait(
        &self,
        mut waiter: CorrelationWaiter,
        timeout: Duration,
    ) -> BusResult<Vec<MessageDelivery>> {
        let Some(receiver) = waiter.receiver.take() else {
            return Err(BusError::CorrelationCancelled {
                correlation_id: waiter.correlation_id.clone(),
            });
        };

        let result = tokio::time::timeout(timeout, receiver).await;
        unregister(&self.waiters, &waiter.correlation_id, waiter.generation);

        match result {
            Ok(Ok(replies)) => Ok(replies),
            Ok(Err(_)) => Err(BusError::CorrelationCancelled {
                correlation_id: waiter.correlation_id.clone(),
            }),
            Err(_) => {
                debug!(
                    correlation_id = %waiter.correlation_id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Correlation wait timed out"
                );
                Err(BusError::CorrelationTimeout {
                    correlation_id: waiter.correlation_id.clone(),
                    timeout,
                })
            }
        }
    }

    /// Registered, unresolved waiters
    pub fn pending_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .finish()
    }
}
