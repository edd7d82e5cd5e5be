//! # Built-in Dispatchers
//!
//! In-process [`Dispatcher`] implementations:
//!
//! - [`ChannelDispatcher`] hands each delivery to a tokio mpsc consumer
//! - [`FnDispatcher`] runs an async closure returning `anyhow::Result`
//!
//! Wire-transport dispatchers live outside this crate and implement the same
//! trait.

use std::fmt;
use std::future::Future;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::messaging::MessageDelivery;
use crate::registry::{DispatchContext, DispatchError, Dispatcher};

/// Forwards deliveries into a bounded channel.
///
/// A full channel applies backpressure to the delivery attempt; a closed
/// channel is a permanent failure.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    name: String,
    sender: mpsc::Sender<MessageDelivery>,
}

impl ChannelDispatcher {
    pub fn new(name: impl Into<String>, sender: mpsc::Sender<MessageDelivery>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }

    /// Dispatcher plus the receiving end of a fresh channel
    pub fn channel(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<MessageDelivery>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self::new(name, sender), receiver)
    }
}

#[async_trait]
impl Dispatcher for ChannelDispatcher {
    async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        self.sender.send(delivery.clone()).await.map_err(|_| {
            DispatchError::permanent(format!(
                "channel for dispatcher '{}' is closed (subscription {})",
                self.name, context.subscription_id
            ))
        })?;
        debug!(
            dispatcher = %self.name,
            delivery_id = %delivery.delivery_id,
            attempt = context.attempt,
            "Delivery handed to channel"
        );
        Ok(())
    }

    fn dispatcher_name(&self) -> &str {
        &self.name
    }
}

/// Dispatcher backed by an async closure.
///
/// A returned error that is itself a [`DispatchError`] keeps its
/// classification; any other error is retryable.
pub struct FnDispatcher<F> {
    name: String,
    handler: F,
}

impl<F, Fut> FnDispatcher<F>
where
    F: Fn(MessageDelivery, DispatchContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

impl<F> fmt::Debug for FnDispatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDispatcher")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(MessageDelivery, DispatchContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn dispatch(
        &self,
        delivery: &MessageDelivery,
        context: &DispatchContext,
    ) -> Result<(), DispatchError> {
        (self.handler)(delivery.clone(), context.clone())
            .await
            .map_err(|error| match error.downcast::<DispatchError>() {
                Ok(classified) => classified,
                Err(other) => DispatchError::retryable(format!("{other:#}")),
            })
    }

    fn dispatcher_name(&self) -> &str {
        &self.name
    }
}
