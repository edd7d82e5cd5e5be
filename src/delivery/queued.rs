//! # Queued Delivery
//!
//! Queue-backed, retrying, worker-pooled delivery.
//!
//! `deliver` only enqueues into the primary queue, inside the caller's
//! transaction. Background workers then move each record through:
//!
//! ```text
//! Idle ─(permit)─▶ Dequeuing ─(item)─▶ spawned attempt ─▶ Idle
//!                      └─(timeout)──────────────────────▶ Idle
//! ```
//!
//! Each worker owns a semaphore of `permits_per_worker` permits. A permit is
//! taken before dequeuing and is held by the spawned attempt until its
//! transaction has committed, so in-flight attempts never exceed
//! `worker_count × permits_per_worker` and a slow dispatcher never stalls a
//! dequeue loop.
//!
//! Every attempt commits exactly one successor for the record it dequeued:
//! nothing (delivered), a retry record (retry queue, or primary when there is
//! none), the unchanged record (not yet due), or a terminal record in the
//! failure queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::core::{dispatch_guarded, DeliveryCore};
use super::retry::RetryPolicy;
use crate::config::{DeliveryConfig, WorkerPoolConfig};
use crate::constants::cores;
use crate::error::{BusError, BusResult};
use crate::events::{BusEvent, EventPublisher};
use crate::execution::WorkerPool;
use crate::logging::{log_delivery_operation, log_error};
use crate::messaging::{DeliveryQueue, DeliveryTransaction, InMemoryDeliveryQueue, MessageDelivery};
use crate::registry::{DispatchContext, SubscriptionRegistry};

const COMPONENT: &str = "queued_delivery_core";

/// The three queues a [`QueuedDeliveryCore`] works over
#[derive(Debug, Clone)]
pub struct DeliveryQueues {
    pub primary: Arc<dyn DeliveryQueue>,
    /// Falls back to `primary` when absent
    pub retry: Option<Arc<dyn DeliveryQueue>>,
    pub failure: Arc<dyn DeliveryQueue>,
}

impl DeliveryQueues {
    pub fn new(primary: Arc<dyn DeliveryQueue>, failure: Arc<dyn DeliveryQueue>) -> Self {
        Self {
            primary,
            retry: None,
            failure,
        }
    }

    pub fn with_retry(mut self, retry: Arc<dyn DeliveryQueue>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Primary, retry and failure queues held in memory
    pub fn in_memory(prefix: &str) -> Self {
        Self::new(
            Arc::new(InMemoryDeliveryQueue::new(format!("{prefix}.primary"))),
            Arc::new(InMemoryDeliveryQueue::new(format!("{prefix}.failure"))),
        )
        .with_retry(Arc::new(InMemoryDeliveryQueue::new(format!("{prefix}.retry"))))
    }

    /// Where retry and deferred records go
    pub fn retry_target(&self) -> &Arc<dyn DeliveryQueue> {
        self.retry.as_ref().unwrap_or(&self.primary)
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    queues: DeliveryQueues,
    registry: Arc<SubscriptionRegistry>,
    events: EventPublisher,
    policy: RetryPolicy,
    config: DeliveryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Primary,
    Retry,
}

/// Per-worker state handed to every unit of work
#[derive(Clone)]
struct WorkerSlot {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    source: Source,
}

impl WorkerSlot {
    fn queue(&self) -> &Arc<dyn DeliveryQueue> {
        match self.source {
            Source::Primary => &self.shared.queues.primary,
            Source::Retry => self.shared.queues.retry_target(),
        }
    }
}

struct RunningWorkers {
    delivery: WorkerPool<WorkerSlot>,
    retry: Option<WorkerPool<WorkerSlot>>,
    semaphores: Vec<Arc<Semaphore>>,
}

/// Queue-backed delivery core
pub struct QueuedDeliveryCore {
    shared: Arc<Shared>,
    pool_config: WorkerPoolConfig,
    running: Mutex<Option<RunningWorkers>>,
}

impl QueuedDeliveryCore {
    pub fn new(
        queues: DeliveryQueues,
        config: DeliveryConfig,
        pool_config: WorkerPoolConfig,
        registry: Arc<SubscriptionRegistry>,
        events: EventPublisher,
    ) -> Self {
        Self::named(cores::QUEUED, queues, config, pool_config, registry, events)
    }

    pub fn named(
        name: impl Into<String>,
        queues: DeliveryQueues,
        config: DeliveryConfig,
        pool_config: WorkerPoolConfig,
        registry: Arc<SubscriptionRegistry>,
        events: EventPublisher,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                policy: RetryPolicy::from_config(&config),
                queues,
                registry,
                events,
                config,
            }),
            pool_config,
            running: Mutex::new(None),
        }
    }

    pub fn queues(&self) -> &DeliveryQueues {
        &self.shared.queues
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.shared.policy
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Active delivery and retry workers
    pub fn worker_count(&self) -> usize {
        self.running.lock().as_ref().map_or(0, |running| {
            running.delivery.count() + running.retry.as_ref().map_or(0, WorkerPool::count)
        })
    }

    fn build_pool(&self, label: &str) -> WorkerPool<WorkerSlot> {
        let events = self.shared.events.clone();
        WorkerPool::new(
            format!("{}.{label}", self.shared.name),
            &self.pool_config,
            run_unit_of_work,
        )
        .with_panic_handler(Arc::new(move |message| {
            events.publish(BusEvent::unhandled(COMPONENT, message, false));
        }))
    }

    fn spawn_workers(&self, pool: &WorkerPool<WorkerSlot>, source: Source) -> Vec<Arc<Semaphore>> {
        let permits = self.shared.config.permits_per_worker;
        (0..self.shared.config.effective_worker_count())
            .map(|_| {
                let semaphore = Arc::new(Semaphore::new(permits));
                pool.add_worker(WorkerSlot {
                    shared: Arc::clone(&self.shared),
                    permits: Arc::clone(&semaphore),
                    source,
                });
                semaphore
            })
            .collect()
    }
}

impl fmt::Debug for QueuedDeliveryCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedDeliveryCore")
            .field("name", &self.shared.name)
            .field("queues", &self.shared.queues)
            .field("running", &self.is_running())
            .finish()
    }
}

#[async_trait]
impl DeliveryCore for QueuedDeliveryCore {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn deliver(
        &self,
        delivery: MessageDelivery,
        tx: &mut DeliveryTransaction,
    ) -> BusResult<()> {
        debug!(
            core = %self.shared.name,
            delivery_id = %delivery.delivery_id,
            queue = self.shared.queues.primary.name(),
            "Enqueuing delivery"
        );
        tx.enqueue(&self.shared.queues.primary, delivery);
        Ok(())
    }

    async fn start(&self) -> BusResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(BusError::already_started(&self.shared.name));
        }

        let delivery = self.build_pool("delivery");
        let mut semaphores = self.spawn_workers(&delivery, Source::Primary);

        let retry = self.shared.queues.retry.as_ref().map(|_| {
            let pool = self.build_pool("retry");
            semaphores.extend(self.spawn_workers(&pool, Source::Retry));
            pool
        });

        info!(
            core = %self.shared.name,
            delivery_workers = delivery.count(),
            retry_workers = retry.as_ref().map_or(0, WorkerPool::count),
            permits_per_worker = self.shared.config.permits_per_worker,
            "🚀 Queued delivery core started"
        );

        *running = Some(RunningWorkers {
            delivery,
            retry,
            semaphores,
        });
        Ok(())
    }

    async fn stop(&self) -> BusResult<()> {
        let Some(running) = self.running.lock().take() else {
            return Err(BusError::not_started(&self.shared.name));
        };

        let mut outcomes = vec![running.delivery.remove_all().await];
        if let Some(retry) = &running.retry {
            outcomes.push(retry.remove_all().await);
        }
        if outcomes.iter().any(|outcome| !outcome.is_graceful()) {
            warn!(core = %self.shared.name, ?outcomes, "Some workers were aborted during stop");
        }

        // Every permit back means every spawned attempt has committed
        let permits = u32::try_from(self.shared.config.permits_per_worker).unwrap_or(u32::MAX);
        for semaphore in &running.semaphores {
            if let Ok(drained) = semaphore.acquire_many(permits).await {
                drained.forget();
            }
            semaphore.close();
        }

        info!(core = %self.shared.name, "🛑 Queued delivery core stopped");
        Ok(())
    }
}

async fn run_unit_of_work(timeout: Duration, slot: WorkerSlot, token: CancellationToken) {
    let permit = tokio::select! {
        _ = token.cancelled() => return,
        acquired = tokio::time::timeout(timeout, Arc::clone(&slot.permits).acquire_owned()) => {
            match acquired {
                Ok(Ok(permit)) => permit,
                // Timed out under full load, or closed by stop
                _ => return,
            }
        }
    };

    let shared = Arc::clone(&slot.shared);
    let mut tx = DeliveryTransaction::new();
    match tx.dequeue(slot.queue(), shared.config.dequeue_timeout()).await {
        Ok(Some(delivery)) => {
            tokio::spawn(deliver_one(Arc::clone(&shared), tx, delivery, permit));
        }
        Ok(None) => drop(permit),
        Err(e) => {
            drop(permit);
            log_error(COMPONENT, "dequeue", &e.to_string(), Some(slot.queue().name()));
            shared
                .events
                .publish(BusEvent::unhandled(COMPONENT, e.to_string(), false));
            pause(&token, shared.config.retry_poll_interval()).await;
        }
    }

    if slot.source == Source::Retry {
        pause(&token, shared.config.retry_poll_interval()).await;
    }
}

async fn pause(token: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = token.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Process one dequeued record and commit its successor
async fn deliver_one(
    shared: Arc<Shared>,
    mut tx: DeliveryTransaction,
    delivery: MessageDelivery,
    _permit: OwnedSemaphorePermit,
) {
    let now = Utc::now();

    if delivery.is_expired_at(now) {
        let reason = "delivery expired before dispatch";
        let failure = delivery.create_failure(reason);
        tx.enqueue(&shared.queues.failure, failure.clone());
        if commit(&shared, tx, &delivery, "expire").await {
            log_delivery_operation(
                "expire",
                failure.delivery_id,
                failure.subscription_id,
                failure.retry_count,
                "failed",
                Some(reason),
            );
            shared.events.publish(BusEvent::failed(failure, reason, true));
        }
        return;
    }

    if delivery.is_deferred_at(now) {
        tx.enqueue(shared.queues.retry_target(), delivery.clone());
        commit(&shared, tx, &delivery, "defer").await;
        tokio::time::sleep(shared.config.deferred_retry_sleep()).await;
        return;
    }

    let Some(endpoint) = shared.registry.get(delivery.subscription_id) else {
        debug!(
            delivery_id = %delivery.delivery_id,
            subscription_id = %delivery.subscription_id,
            "Subscription removed before dispatch; skipping"
        );
        if commit(&shared, tx, &delivery, "skip").await {
            shared
                .events
                .publish(BusEvent::delivered(delivery, shared.name.as_str()));
        }
        return;
    };

    let context = DispatchContext::new(&endpoint, &delivery, shared.name.as_str());
    match dispatch_guarded(&endpoint, &delivery, &context).await {
        Ok(()) => {
            if commit(&shared, tx, &delivery, "deliver").await {
                log_delivery_operation(
                    "deliver",
                    delivery.delivery_id,
                    delivery.subscription_id,
                    delivery.retry_count,
                    "delivered",
                    None,
                );
                shared
                    .events
                    .publish(BusEvent::delivered(delivery, shared.name.as_str()));
            }
        }
        Err(err) => {
            let permanent = !err.is_retryable() || delivery.is_retries_maxed();
            let successor = if permanent {
                let failure = delivery.create_failure(err.message());
                tx.enqueue(&shared.queues.failure, failure.clone());
                failure
            } else {
                let retry = delivery.create_retry(false, &shared.policy, Some(err.message()));
                tx.enqueue(shared.queues.retry_target(), retry.clone());
                retry
            };

            if commit(&shared, tx, &delivery, "fail").await {
                log_delivery_operation(
                    "deliver",
                    successor.delivery_id,
                    successor.subscription_id,
                    successor.retry_count,
                    if permanent { "failed_permanent" } else { "failed_retrying" },
                    Some(err.message()),
                );
                shared
                    .events
                    .publish(BusEvent::failed(successor, err.message(), permanent));
            }
        }
    }
}

async fn commit(
    shared: &Shared,
    tx: DeliveryTransaction,
    delivery: &MessageDelivery,
    operation: &str,
) -> bool {
    match tx.commit().await {
        Ok(()) => true,
        Err(e) => {
            let context = format!("delivery_id={}", delivery.delivery_id);
            log_error(COMPONENT, operation, &e.to_string(), Some(&context));
            shared
                .events
                .publish(BusEvent::unhandled(COMPONENT, e.to_string(), false));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::MessageDeliveryContext;
    use crate::registry::{DispatchError, Dispatcher, SubscriptionEndpoint};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailTimes {
        remaining: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dispatcher for FailTimes {
        async fn dispatch(
            &self,
            _delivery: &MessageDelivery,
            _context: &DispatchContext,
        ) -> Result<(), DispatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                Err(DispatchError::retryable("not yet"))
            } else {
                Ok(())
            }
        }
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            retry_delay_ms: 5,
            dequeue_timeout_ms: 20,
            deferred_retry_sleep_ms: 5,
            retry_poll_interval_ms: 5,
            worker_count: Some(2),
            ..DeliveryConfig::default()
        }
    }

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            stop_timeout_ms: 2_000,
            unit_of_work_timeout_ms: 20,
        }
    }

    fn core_with(
        failures: usize,
        max_retries: u32,
    ) -> (QueuedDeliveryCore, Arc<FailTimes>, MessageDelivery) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let dispatcher = Arc::new(FailTimes {
            remaining: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        });
        let endpoint = SubscriptionEndpoint::new("audit", "orders", dispatcher.clone());
        let delivery = MessageDelivery::new(
            endpoint.id,
            "orders",
            "Created",
            json!({}),
            max_retries,
            MessageDeliveryContext::new(),
        );
        registry.subscribe(endpoint).unwrap();
        let core = QueuedDeliveryCore::new(
            DeliveryQueues::in_memory("test"),
            fast_config(),
            pool_config(),
            registry,
            EventPublisher::new(64),
        );
        (core, dispatcher, delivery)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deliver_enqueues_inside_callers_transaction() {
        let (core, dispatcher, delivery) = core_with(0, 3);
        let mut tx = DeliveryTransaction::new();
        core.deliver(delivery, &mut tx).await.unwrap();
        assert_eq!(tx.pending_enqueues(), 1);
        assert!(core.queues().primary.list_messages().await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(core.queues().primary.list_messages().await.unwrap().len(), 1);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_fails_and_stop_requires_start() {
        let (core, _dispatcher, _delivery) = core_with(0, 3);
        assert!(matches!(
            core.stop().await.unwrap_err(),
            BusError::NotStarted { .. }
        ));
        core.start().await.unwrap();
        assert_eq!(core.worker_count(), 4);
        assert!(matches!(
            core.start().await.unwrap_err(),
            BusError::AlreadyStarted { .. }
        ));
        core.stop().await.unwrap();
        assert!(!core.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exhausted_retries_park_in_failure_queue() {
        let (core, dispatcher, delivery) = core_with(usize::MAX, 2);
        let mut tx = DeliveryTransaction::new();
        core.deliver(delivery, &mut tx).await.unwrap();
        tx.commit().await.unwrap();

        core.start().await.unwrap();
        let failure_queue = core.queues().failure.clone();
        for _ in 0..200 {
            if !failure_queue.list_messages().await.unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        core.stop().await.unwrap();

        let parked = failure_queue.list_messages().await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].context.exceptions().len(), 3);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 3);
        assert!(core.queues().primary.list_messages().await.unwrap().is_empty());
        assert!(core
            .queues()
            .retry_target()
            .list_messages()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_workers_drain_retry_queue() {
        let (core, dispatcher, delivery) = core_with(0, 3);
        let retry_queue = core.queues().retry_target().clone();
        retry_queue.enqueue(delivery).await.unwrap();

        core.start().await.unwrap();
        let calls = &dispatcher.calls;
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        core.stop().await.unwrap();

        assert!(retry_queue.list_messages().await.unwrap().is_empty());
        assert!(core.queues().failure.list_messages().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deferred_record_waits_until_due() {
        let (core, dispatcher, delivery) = core_with(0, 3);
        let due = Utc::now() + chrono::Duration::milliseconds(150);
        let mut tx = DeliveryTransaction::new();
        core.deliver(delivery.with_time_to_process(due), &mut tx)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        core.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);

        let calls = &dispatcher.calls;
        wait_until(|| calls.load(Ordering::SeqCst) == 1).await;
        assert!(Utc::now() >= due);
        core.stop().await.unwrap();
    }
}
