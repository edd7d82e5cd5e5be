//! # Worker Pool
//!
//! Generic pool of background loops, each repeatedly running a caller-supplied
//! unit of work until it is told to stop.
//!
//! Stopping is cooperative: every worker owns a child [`CancellationToken`]
//! that is passed into each unit of work. `remove_worker`/`remove_all` cancel
//! the token and wait up to the configured stop timeout; only workers still
//! running after that are aborted. A unit of work that never awaits (or never
//! checks its token) therefore delays shutdown by up to the stop timeout.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use courier_core::config::WorkerPoolConfig;
//! use courier_core::execution::WorkerPool;
//!
//! # async fn example() {
//! let pool = WorkerPool::new("poller", &WorkerPoolConfig::default(), |timeout, queue: String, token| async move {
//!     tokio::select! {
//!         _ = token.cancelled() => {}
//!         _ = tokio::time::sleep(timeout) => { let _ = &queue; }
//!     }
//! });
//! let handle = pool.add_worker("orders".to_string());
//! assert_eq!(pool.count(), 1);
//! pool.remove_worker(handle).await.unwrap();
//! # }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::error::{BusError, BusResult};

/// Unit of work invoked in a loop: `(timeout, state, cancellation)`
pub type UnitOfWork<S> =
    Arc<dyn Fn(Duration, S, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// Called with the panic message when a unit of work panics
pub type PanicHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies one worker of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    id: u64,
}

impl WorkerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// How a stop request completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every worker exited within the stop timeout
    Graceful,
    /// This many workers outlived the stop timeout and were aborted
    Aborted { workers: usize },
}

impl StopOutcome {
    pub fn is_graceful(&self) -> bool {
        matches!(self, Self::Graceful)
    }
}

struct WorkerEntry {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Pool of cooperatively cancelled background loops
pub struct WorkerPool<S> {
    name: String,
    unit_of_work: UnitOfWork<S>,
    unit_timeout: Duration,
    stop_timeout: Duration,
    shutdown: CancellationToken,
    workers: Mutex<HashMap<u64, WorkerEntry>>,
    next_id: AtomicU64,
    on_panic: Option<PanicHandler>,
}

impl<S> WorkerPool<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, config: &WorkerPoolConfig, unit_of_work: F) -> Self
    where
        F: Fn(Duration, S, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            unit_of_work: Arc::new(move |timeout, state, token| {
                unit_of_work(timeout, state, token).boxed()
            }),
            unit_timeout: config.unit_of_work_timeout(),
            stop_timeout: config.stop_timeout(),
            shutdown: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            on_panic: None,
        }
    }

    /// Report panics caught in the worker loop
    pub fn with_panic_handler(mut self, handler: PanicHandler) -> Self {
        self.on_panic = Some(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start one more background loop
    pub fn add_worker(&self, state: S) -> WorkerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();

        let task = tokio::spawn(run_worker(
            self.name.clone(),
            id,
            Arc::clone(&self.unit_of_work),
            state,
            self.unit_timeout,
            token.clone(),
            self.on_panic.clone(),
        ));

        self.workers.lock().insert(id, WorkerEntry { token, task });
        debug!(pool = %self.name, worker_id = id, "Worker added");
        WorkerHandle { id }
    }

    /// Active workers
    pub fn count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Stop one worker, aborting it if it outlives the stop timeout
    pub async fn remove_worker(&self, handle: WorkerHandle) -> BusResult<StopOutcome> {
        let entry = self
            .workers
            .lock()
            .remove(&handle.id)
            .ok_or_else(|| BusError::WorkerNotFound {
                pool: self.name.clone(),
                worker_id: handle.id,
            })?;

        entry.token.cancel();
        let mut task = entry.task;
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(_) => {
                debug!(pool = %self.name, worker_id = handle.id, "Worker stopped");
                Ok(StopOutcome::Graceful)
            }
            Err(_) => {
                task.abort();
                warn!(
                    pool = %self.name,
                    worker_id = handle.id,
                    stop_timeout_ms = self.stop_timeout.as_millis() as u64,
                    "⚠️ Worker did not stop in time; aborted"
                );
                Ok(StopOutcome::Aborted { workers: 1 })
            }
        }
    }

    /// Stop every worker using one combined wait
    pub async fn remove_all(&self) -> StopOutcome {
        let entries: Vec<WorkerEntry> = self.workers.lock().drain().map(|(_, e)| e).collect();
        if entries.is_empty() {
            return StopOutcome::Graceful;
        }

        let total = entries.len();
        let mut tasks = Vec::with_capacity(total);
        for entry in entries {
            entry.token.cancel();
            tasks.push(entry.task);
        }

        let finished = tokio::time::timeout(self.stop_timeout, join_all(tasks.iter_mut()))
            .await
            .is_ok();
        if finished {
            info!(pool = %self.name, workers = total, "🛑 Worker pool stopped");
            return StopOutcome::Graceful;
        }

        let mut aborted = 0;
        for task in &tasks {
            if !task.is_finished() {
                task.abort();
                aborted += 1;
            }
        }
        warn!(
            pool = %self.name,
            workers = total,
            aborted = aborted,
            "⚠️ Worker pool stop timed out; remaining workers aborted"
        );
        if aborted == 0 {
            StopOutcome::Graceful
        } else {
            StopOutcome::Aborted { workers: aborted }
        }
    }
}

async fn run_worker<S>(
    pool: String,
    worker_id: u64,
    unit_of_work: UnitOfWork<S>,
    state: S,
    timeout: Duration,
    token: CancellationToken,
    on_panic: Option<PanicHandler>,
) where
    S: Clone + Send + Sync + 'static,
{
    debug!(pool = %pool, worker_id, "Worker loop started");
    while !token.is_cancelled() {
        let attempt = (unit_of_work)(timeout, state.clone(), token.clone());
        if let Err(panic) = AssertUnwindSafe(attempt).catch_unwind().await {
            let message = panic_message(panic.as_ref());
            error!(
                pool = %pool,
                worker_id,
                panic = %message,
                "💥 Unit of work panicked; worker continues"
            );
            if let Some(handler) = &on_panic {
                handler(&message);
            }
            tokio::task::yield_now().await;
        }
    }
    debug!(pool = %pool, worker_id, "Worker loop exited");
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<S> fmt::Debug for WorkerPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("workers", &self.workers.lock().len())
            .field("unit_timeout", &self.unit_timeout)
            .field("stop_timeout", &self.stop_timeout)
            .finish()
    }
}

impl<S> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for (_, entry) in self.workers.get_mut().drain() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn config(stop_timeout_ms: u64) -> WorkerPoolConfig {
        WorkerPoolConfig {
            stop_timeout_ms,
            unit_of_work_timeout_ms: 10,
        }
    }

    fn counting_pool() -> WorkerPool<Arc<AtomicUsize>> {
        WorkerPool::new("counting", &config(1_000), |timeout, count: Arc<AtomicUsize>, token| async move {
            count.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
        })
    }

    #[tokio::test]
    async fn test_workers_loop_until_removed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool();
        let first = pool.add_worker(counter.clone());
        pool.add_worker(counter.clone());
        assert_eq!(pool.count(), 2);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) >= 2);

        let outcome = pool.remove_worker(first).await.unwrap();
        assert!(outcome.is_graceful());
        assert_eq!(pool.count(), 1);

        assert_eq!(pool.remove_all().await, StopOutcome::Graceful);
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_worker_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = counting_pool();
        let handle = pool.add_worker(counter);
        pool.remove_worker(handle).await.unwrap();

        let err = pool.remove_worker(handle).await.unwrap_err();
        assert!(matches!(err, BusError::WorkerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_uncooperative_worker_is_aborted() {
        let pool = WorkerPool::new("stubborn", &config(50), |_, _: (), _token| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        pool.add_worker(());
        pool.add_worker(());

        let outcome = pool.remove_all().await;
        assert_eq!(outcome, StopOutcome::Aborted { workers: 2 });
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_unit_does_not_kill_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let panics = Arc::new(AtomicUsize::new(0));
        let reported = panics.clone();

        let pool = WorkerPool::new("flaky", &config(1_000), |_, calls: Arc<AtomicUsize>, _token| async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first call fails");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        })
        .with_panic_handler(Arc::new(move |message| {
            assert_eq!(message, "first call fails");
            reported.fetch_add(1, Ordering::SeqCst);
        }));

        pool.add_worker(calls.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(panics.load(Ordering::SeqCst), 1);
        assert!(calls.load(Ordering::SeqCst) > 1);
        assert!(pool.remove_all().await.is_graceful());
    }
}
