#![allow(dead_code)]

pub mod dispatchers;
pub mod strategies;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use courier_core::config::{BusConfig, DeliveryConfig, RouterConfig, WorkerPoolConfig};
use courier_core::delivery::DeliveryQueues;
use courier_core::{InMemoryDeliveryQueue, MessageBusRuntime};

pub use dispatchers::*;

/// Configuration tuned for tests: short timeouts, tiny retry delays
pub fn fast_config(max_retries: u32) -> BusConfig {
    let mut config = BusConfig {
        delivery: DeliveryConfig {
            retry_delay_ms: 5,
            dequeue_timeout_ms: 20,
            deferred_retry_sleep_ms: 5,
            retry_poll_interval_ms: 5,
            worker_count: Some(4),
            ..DeliveryConfig::default()
        },
        router: RouterConfig {
            default_max_retries: max_retries,
            ..RouterConfig::default()
        },
        worker_pool: WorkerPoolConfig {
            stop_timeout_ms: 5_000,
            unit_of_work_timeout_ms: 20,
        },
        ..BusConfig::default()
    };
    config.events.channel_capacity = 65_536;
    config.correlation.default_reply_timeout_ms = 2_000;
    config
}

/// A runtime over a queued core whose in-memory queues stay inspectable
pub struct QueuedBus {
    pub runtime: MessageBusRuntime,
    pub primary: Arc<InMemoryDeliveryQueue>,
    pub retry: Arc<InMemoryDeliveryQueue>,
    pub failure: Arc<InMemoryDeliveryQueue>,
}

impl QueuedBus {
    pub fn new(config: BusConfig) -> Self {
        let runtime = MessageBusRuntime::new(config).expect("valid test configuration");
        let primary = Arc::new(InMemoryDeliveryQueue::new("test.primary"));
        let retry = Arc::new(InMemoryDeliveryQueue::new("test.retry"));
        let failure = Arc::new(InMemoryDeliveryQueue::new("test.failure"));
        runtime.use_queued_delivery(
            DeliveryQueues::new(primary.clone(), failure.clone()).with_retry(retry.clone()),
        );
        Self {
            runtime,
            primary,
            retry,
            failure,
        }
    }

    /// Nothing waiting or claimed in the primary and retry queues
    pub fn drained(&self) -> bool {
        self.primary.is_empty()
            && self.primary.in_flight() == 0
            && self.retry.is_empty()
            && self.retry.in_flight() == 0
    }

    /// All three queues hold nothing, waiting or claimed
    pub fn is_empty(&self) -> bool {
        self.drained() && self.failure.is_empty() && self.failure.in_flight() == 0
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return check();
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll an async `check` until it holds or `timeout` elapses
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return check().await;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
