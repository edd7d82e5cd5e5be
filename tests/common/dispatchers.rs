//! Dispatchers with scripted behavior for integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use courier_core::registry::{DispatchContext, DispatchError, Dispatcher};
use courier_core::{MessageBusRuntime, MessageDelivery};

/// Records every delivery it receives
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    seen: Mutex<Vec<MessageDelivery>>,
}

impl RecordingDispatcher {
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn deliveries(&self) -> Vec<MessageDelivery> {
        self.seen.lock().clone()
    }

    /// How often each delivery id was dispatched
    pub fn dispatch_counts(&self) -> HashMap<Uuid, usize> {
        let mut counts = HashMap::new();
        for delivery in self.seen.lock().iter() {
            *counts.entry(delivery.delivery_id).or_insert(0) += 1;
        }
        counts
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        _context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.seen.lock().push(delivery.clone());
        Ok(())
    }

    fn dispatcher_name(&self) -> &str {
        "recording"
    }
}

/// Fails with a retryable error for the first `failures` attempts
#[derive(Debug)]
pub struct FlakyDispatcher {
    failures: usize,
    attempts: AtomicUsize,
    contexts: Mutex<Vec<DispatchContext>>,
}

impl FlakyDispatcher {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn attempt_numbers(&self) -> Vec<u32> {
        self.contexts.lock().iter().map(|ctx| ctx.attempt).collect()
    }
}

#[async_trait]
impl Dispatcher for FlakyDispatcher {
    async fn dispatch(
        &self,
        _delivery: &MessageDelivery,
        context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.contexts.lock().push(context.clone());
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            Err(DispatchError::retryable(format!("flaky failure {}", attempt + 1)))
        } else {
            Ok(())
        }
    }

    fn dispatcher_name(&self) -> &str {
        "flaky"
    }
}

/// Fails every attempt
#[derive(Debug)]
pub struct FailingDispatcher {
    permanent: bool,
    attempts: AtomicUsize,
}

impl FailingDispatcher {
    pub fn retryable() -> Self {
        Self {
            permanent: false,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn permanent() -> Self {
        Self {
            permanent: true,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for FailingDispatcher {
    async fn dispatch(
        &self,
        _delivery: &MessageDelivery,
        _context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.permanent {
            Err(DispatchError::permanent("payload rejected"))
        } else {
            Err(DispatchError::retryable(format!("attempt {attempt} failed")))
        }
    }

    fn dispatcher_name(&self) -> &str {
        "failing"
    }
}

/// Panics on every attempt
#[derive(Debug, Default)]
pub struct PanickingDispatcher {
    attempts: AtomicUsize,
}

impl PanickingDispatcher {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for PanickingDispatcher {
    async fn dispatch(
        &self,
        _delivery: &MessageDelivery,
        _context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        panic!("handler blew up");
    }

    fn dispatcher_name(&self) -> &str {
        "panicking"
    }
}

/// Sleeps before succeeding, tracking attempts in progress
#[derive(Debug)]
pub struct SlowDispatcher {
    delay: Duration,
    started: AtomicUsize,
    completed: AtomicUsize,
}

impl SlowDispatcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            started: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for SlowDispatcher {
    async fn dispatch(
        &self,
        _delivery: &MessageDelivery,
        _context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn dispatcher_name(&self) -> &str {
        "slow"
    }
}

/// Answers every correlated delivery by publishing its reply on the bus
#[derive(Debug)]
pub struct EchoDispatcher {
    runtime: MessageBusRuntime,
}

impl EchoDispatcher {
    pub fn new(runtime: MessageBusRuntime) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl Dispatcher for EchoDispatcher {
    async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        _context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        let Some(reply) = delivery.reply("Echoed", delivery.message.clone()) else {
            return Ok(());
        };
        self.runtime
            .publish(reply)
            .await
            .map(|_| ())
            .map_err(|e| DispatchError::retryable(e.to_string()))
    }

    fn dispatcher_name(&self) -> &str {
        "echo"
    }
}
