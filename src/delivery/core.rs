//! Delivery strategy contract shared by the direct and queued cores.

use std::fmt;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::BusResult;
use crate::execution::worker_pool::panic_message;
use crate::messaging::{DeliveryTransaction, MessageDelivery};
use crate::registry::{DispatchContext, DispatchError, SubscriptionEndpoint};

/// Turns a delivery record into a dispatch call.
///
/// `deliver` runs inside the router's fan-out transaction: a core that stores
/// the record does so through `tx`, so a failed fan-out leaves nothing behind.
#[async_trait]
pub trait DeliveryCore: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        delivery: MessageDelivery,
        tx: &mut DeliveryTransaction,
    ) -> BusResult<()>;

    async fn start(&self) -> BusResult<()> {
        Ok(())
    }

    /// Returns once all in-flight attempts have completed
    async fn stop(&self) -> BusResult<()> {
        Ok(())
    }
}

/// Dispatch through `endpoint`, converting a dispatcher panic into a
/// retryable failure
pub(crate) async fn dispatch_guarded(
    endpoint: &SubscriptionEndpoint,
    delivery: &MessageDelivery,
    context: &DispatchContext,
) -> Result<(), DispatchError> {
    match AssertUnwindSafe(endpoint.dispatch(delivery, context))
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(DispatchError::retryable(format!(
            "dispatcher panicked: {}",
            panic_message(panic.as_ref())
        ))),
    }
}
