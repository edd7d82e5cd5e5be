//! # Delivery Queue Contract
//!
//! The abstract store the delivery engine reads from and writes to, and the
//! explicit transaction handle that makes "remove the original, add its
//! successor" a single all-or-nothing step.
//!
//! ## Transactions
//!
//! A [`DeliveryTransaction`] claims items (they become invisible to other
//! readers but are not yet removed) and buffers enqueues. `commit` performs the
//! buffered enqueues and then acknowledges every claim; `rollback` releases the
//! claims back to the head of their queues and discards the buffered enqueues.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use courier_core::messaging::{DeliveryQueue, DeliveryTransaction, InMemoryDeliveryQueue};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let primary: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new("primary"));
//! let failures: Arc<dyn DeliveryQueue> = Arc::new(InMemoryDeliveryQueue::new("failures"));
//!
//! let mut tx = DeliveryTransaction::new();
//! if let Some(delivery) = tx.dequeue(&primary, Duration::from_secs(1)).await? {
//!     tx.enqueue(&failures, delivery.create_failure("rejected"));
//! }
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use super::message::MessageDelivery;

/// An item claimed under a transaction
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    /// Queue-local receipt used to acknowledge or release the claim
    pub receipt: u64,
    pub delivery: MessageDelivery,
}

/// Transactional, timeout-based FIFO-ish store of delivery records.
///
/// Every timeout-bearing operation returns `Ok(None)` on timeout. Queues that
/// cannot hold claims keep the default `claim`/`acknowledge`/`release`, which
/// remove on claim and re-enqueue on release.
#[async_trait]
pub trait DeliveryQueue: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Whether claims survive until commit/rollback
    fn is_transactional(&self) -> bool;

    async fn enqueue(&self, delivery: MessageDelivery) -> MessagingResult<()>;

    async fn peek(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>>;

    async fn dequeue(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>>;

    /// Remove a specific record by delivery id
    async fn dequeue_by_id(
        &self,
        delivery_id: Uuid,
        timeout: Duration,
    ) -> MessagingResult<Option<MessageDelivery>>;

    /// Records currently visible to readers
    async fn list_messages(&self) -> MessagingResult<Vec<MessageDelivery>>;

    async fn claim(&self, timeout: Duration) -> MessagingResult<Option<ClaimedDelivery>> {
        Ok(self
            .dequeue(timeout)
            .await?
            .map(|delivery| ClaimedDelivery {
                receipt: 0,
                delivery,
            }))
    }

    /// Permanently remove a claimed record
    async fn acknowledge(&self, _claim: &ClaimedDelivery) -> MessagingResult<()> {
        Ok(())
    }

    /// Make a claimed record visible again
    async fn release(&self, claim: ClaimedDelivery) -> MessagingResult<()> {
        self.enqueue(claim.delivery).await
    }
}

/// Explicit transaction spanning one or more delivery queues
pub struct DeliveryTransaction {
    id: Uuid,
    claims: Vec<(Arc<dyn DeliveryQueue>, ClaimedDelivery)>,
    pending: Vec<(Arc<dyn DeliveryQueue>, MessageDelivery)>,
    completed: bool,
}

impl DeliveryTransaction {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            claims: Vec::new(),
            pending: Vec::new(),
            completed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Claim the next record of `queue` under this transaction
    pub async fn dequeue(
        &mut self,
        queue: &Arc<dyn DeliveryQueue>,
        timeout: Duration,
    ) -> MessagingResult<Option<MessageDelivery>> {
        self.ensure_open()?;
        let claimed = queue.claim(timeout).await?;
        Ok(claimed.map(|claim| {
            let delivery = claim.delivery.clone();
            self.claims.push((Arc::clone(queue), claim));
            delivery
        }))
    }

    /// Buffer an enqueue to be applied on commit
    pub fn enqueue(&mut self, queue: &Arc<dyn DeliveryQueue>, delivery: MessageDelivery) {
        self.pending.push((Arc::clone(queue), delivery));
    }

    pub fn pending_enqueues(&self) -> usize {
        self.pending.len()
    }

    pub fn claimed(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty() && self.pending.is_empty()
    }

    /// Apply buffered enqueues, then remove every claimed record.
    ///
    /// Successors are written before originals are acknowledged, so a failure
    /// part-way through can duplicate a record but never lose one.
    pub async fn commit(mut self) -> MessagingResult<()> {
        self.ensure_open()?;
        self.completed = true;

        let pending = std::mem::take(&mut self.pending);
        let claims = std::mem::take(&mut self.claims);

        for (index, (queue, delivery)) in pending.into_iter().enumerate() {
            if let Err(e) = queue.enqueue(delivery).await {
                warn!(
                    transaction_id = %self.id,
                    queue = queue.name(),
                    applied = index,
                    error = %e,
                    "Commit failed while enqueuing; releasing claims"
                );
                release_all(self.id, claims).await;
                return Err(MessagingError::transaction_failed(
                    self.id,
                    "enqueue",
                    e.to_string(),
                ));
            }
        }

        let mut claims = claims.into_iter();
        while let Some((queue, claim)) = claims.next() {
            if let Err(e) = queue.acknowledge(&claim).await {
                warn!(
                    transaction_id = %self.id,
                    queue = queue.name(),
                    error = %e,
                    "Commit failed while acknowledging; releasing remaining claims"
                );
                let mut unacknowledged = vec![(queue, claim)];
                unacknowledged.extend(claims);
                release_all(self.id, unacknowledged).await;
                return Err(MessagingError::transaction_failed(
                    self.id,
                    "acknowledge",
                    e.to_string(),
                ));
            }
        }

        debug!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    /// Release every claim and discard buffered enqueues
    pub async fn rollback(mut self) -> MessagingResult<()> {
        self.ensure_open()?;
        self.completed = true;

        let discarded = self.pending.len();
        self.pending.clear();
        let claims = std::mem::take(&mut self.claims);
        release_all(self.id, claims).await;

        debug!(
            transaction_id = %self.id,
            discarded_enqueues = discarded,
            "Transaction rolled back"
        );
        Ok(())
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.completed {
            return Err(MessagingError::TransactionCompleted {
                transaction_id: self.id,
            });
        }
        Ok(())
    }
}

async fn release_all(transaction_id: Uuid, claims: Vec<(Arc<dyn DeliveryQueue>, ClaimedDelivery)>) {
    for (queue, claim) in claims.into_iter().rev() {
        if let Err(e) = queue.release(claim).await {
            warn!(
                transaction_id = %transaction_id,
                queue = queue.name(),
                error = %e,
                "Failed to release claim"
            );
        }
    }
}

impl Default for DeliveryTransaction {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DeliveryTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTransaction")
            .field("id", &self.id)
            .field("claims", &self.claims.len())
            .field("pending", &self.pending.len())
            .field("completed", &self.completed)
            .finish()
    }
}

impl Drop for DeliveryTransaction {
    fn drop(&mut self) {
        if self.completed || self.claims.is_empty() {
            return;
        }
        let claims = std::mem::take(&mut self.claims);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(transaction_id = %id, "Transaction dropped uncommitted; rolling back");
                handle.spawn(release_all(id, claims));
            }
            Err(_) => {
                warn!(
                    transaction_id = %id,
                    claims = claims.len(),
                    "Transaction dropped outside a runtime; claims remain in flight"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{InMemoryDeliveryQueue, MessageDeliveryContext};
    use serde_json::json;

    /// Delegates to an in-memory queue but refuses every acknowledgement
    #[derive(Debug)]
    struct AckRejectingQueue {
        inner: Arc<InMemoryDeliveryQueue>,
    }

    #[async_trait]
    impl DeliveryQueue for AckRejectingQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn is_transactional(&self) -> bool {
            true
        }

        async fn enqueue(&self, delivery: MessageDelivery) -> MessagingResult<()> {
            self.inner.enqueue(delivery).await
        }

        async fn peek(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>> {
            self.inner.peek(timeout).await
        }

        async fn dequeue(&self, timeout: Duration) -> MessagingResult<Option<MessageDelivery>> {
            self.inner.dequeue(timeout).await
        }

        async fn dequeue_by_id(
            &self,
            delivery_id: Uuid,
            timeout: Duration,
        ) -> MessagingResult<Option<MessageDelivery>> {
            self.inner.dequeue_by_id(delivery_id, timeout).await
        }

        async fn list_messages(&self) -> MessagingResult<Vec<MessageDelivery>> {
            self.inner.list_messages().await
        }

        async fn claim(&self, timeout: Duration) -> MessagingResult<Option<ClaimedDelivery>> {
            self.inner.claim(timeout).await
        }

        async fn acknowledge(&self, claim: &ClaimedDelivery) -> MessagingResult<()> {
            Err(MessagingError::claim_not_found(self.name(), claim.receipt))
        }

        async fn release(&self, claim: ClaimedDelivery) -> MessagingResult<()> {
            self.inner.release(claim).await
        }
    }

    fn delivery() -> MessageDelivery {
        MessageDelivery::new(
            Uuid::new_v4(),
            "orders",
            "Created",
            json!({}),
            3,
            MessageDeliveryContext::new(),
        )
    }

    #[tokio::test]
    async fn test_failed_acknowledge_releases_every_unacknowledged_claim() {
        let rejecting_inner = Arc::new(InMemoryDeliveryQueue::new("rejecting"));
        let rejecting: Arc<dyn DeliveryQueue> = Arc::new(AckRejectingQueue {
            inner: Arc::clone(&rejecting_inner),
        });
        let healthy_inner = Arc::new(InMemoryDeliveryQueue::new("healthy"));
        let healthy: Arc<dyn DeliveryQueue> = healthy_inner.clone();
        let target_inner = Arc::new(InMemoryDeliveryQueue::new("target"));
        let target: Arc<dyn DeliveryQueue> = target_inner.clone();

        rejecting.enqueue(delivery()).await.unwrap();
        healthy.enqueue(delivery()).await.unwrap();

        let mut tx = DeliveryTransaction::new();
        let first = tx
            .dequeue(&rejecting, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tx.dequeue(&healthy, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tx.enqueue(&target, first.create_failure("moved"));

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, MessagingError::TransactionFailed { .. }));

        // The successor was written; neither original is stuck in flight
        assert_eq!(target_inner.len(), 1);
        assert_eq!(rejecting_inner.len(), 1);
        assert_eq!(rejecting_inner.in_flight(), 0);
        assert_eq!(healthy_inner.len(), 1);
        assert_eq!(healthy_inner.in_flight(), 0);
    }
}
