//! # Message Bus Runtime
//!
//! Owns the subscription registry, the delivery cores, the correlator and the
//! notification channel, and drives their lifecycle.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use courier_core::config::BusConfig;
//! use courier_core::delivery::DeliveryQueues;
//! use courier_core::dispatchers::ChannelDispatcher;
//! use courier_core::messaging::PublishRequest;
//! use courier_core::registry::SubscriptionEndpoint;
//! use courier_core::runtime::MessageBusRuntime;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = MessageBusRuntime::new(BusConfig::default())?;
//! runtime.use_queued_delivery(DeliveryQueues::in_memory("orders"));
//!
//! let (dispatcher, mut inbox) = ChannelDispatcher::channel("billing", 64);
//! runtime
//!     .subscribe(SubscriptionEndpoint::new("billing", "orders", Arc::new(dispatcher)))
//!     .await?;
//!
//! runtime.start().await?;
//! runtime
//!     .publish(PublishRequest::new("orders", "Created", serde_json::json!({"id": 1})))
//!     .await?;
//! let delivery = inbox.recv().await;
//! runtime.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BusConfig, ConfigManager, ConfigurationError};
use crate::correlation::Correlator;
use crate::delivery::{DeliveryCore, DeliveryQueues, DirectDeliveryCore, QueuedDeliveryCore};
use crate::error::{BusError, BusResult};
use crate::events::{BusEvent, EventPublisher};
use crate::logging::log_error;
use crate::messaging::{ContextKey, MessageDelivery, PublishRequest};
use crate::registry::{Dispatcher, SubscriptionEndpoint, SubscriptionRegistry};
use crate::routing::{DeliveryCoreLookup, SubscriptionRouter};

const COMPONENT: &str = "runtime";
const RETIRE_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Default core plus named cores selectable per subscription
#[derive(Default)]
struct CoreTable {
    default: RwLock<Option<Arc<dyn DeliveryCore>>>,
    named: DashMap<String, Arc<dyn DeliveryCore>>,
}

impl CoreTable {
    fn default_core(&self) -> Option<Arc<dyn DeliveryCore>> {
        self.default.read().clone()
    }

    fn is_empty(&self) -> bool {
        self.default.read().is_none() && self.named.is_empty()
    }

    /// Each distinct core once
    fn all(&self) -> Vec<Arc<dyn DeliveryCore>> {
        let mut seen = HashSet::new();
        self.default_core()
            .into_iter()
            .chain(self.named.iter().map(|entry| Arc::clone(entry.value())))
            .filter(|core| seen.insert(Arc::as_ptr(core) as *const () as usize))
            .collect()
    }
}

impl DeliveryCoreLookup for CoreTable {
    fn core_for(
        &self,
        endpoint: &SubscriptionEndpoint,
        _delivery: &MessageDelivery,
    ) -> Option<Arc<dyn DeliveryCore>> {
        endpoint
            .delivery_core
            .as_deref()
            .and_then(|name| self.named.get(name).map(|core| Arc::clone(core.value())))
            .or_else(|| self.default_core())
    }
}

struct RuntimeInner {
    config: BusConfig,
    registry: Arc<SubscriptionRegistry>,
    correlator: Correlator,
    events: EventPublisher,
    cores: Arc<CoreTable>,
    router: SubscriptionRouter,
    running: AtomicBool,
    lifecycle: AsyncMutex<()>,
}

/// Entry point of the bus
#[derive(Clone)]
pub struct MessageBusRuntime {
    inner: Arc<RuntimeInner>,
}

impl MessageBusRuntime {
    /// Build a runtime with no delivery core; add one before `start`
    pub fn new(config: BusConfig) -> BusResult<Self> {
        config.validate()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let cores = Arc::new(CoreTable::default());
        let events = EventPublisher::new(config.events.channel_capacity);
        let router = SubscriptionRouter::new(
            Arc::clone(&registry),
            Arc::clone(&cores) as Arc<dyn DeliveryCoreLookup>,
            config.router.clone(),
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                registry,
                correlator: Correlator::new(),
                events,
                cores,
                router,
                running: AtomicBool::new(false),
                lifecycle: AsyncMutex::new(()),
            }),
        })
    }

    pub fn from_manager(manager: &ConfigManager) -> BusResult<Self> {
        Self::new(manager.config().clone())
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub fn events(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Core used by subscriptions that name no (or an unknown) core
    pub fn set_default_core(&self, core: Arc<dyn DeliveryCore>) {
        info!(core = core.name(), "Default delivery core set");
        *self.inner.cores.default.write() = Some(core);
    }

    /// Register a core under its own name
    pub fn add_core(&self, core: Arc<dyn DeliveryCore>) {
        info!(core = core.name(), "Delivery core registered");
        self.inner.cores.named.insert(core.name().to_string(), core);
    }

    /// Make a [`DirectDeliveryCore`] the default core
    pub fn use_direct_delivery(&self) -> Arc<DirectDeliveryCore> {
        let core = Arc::new(DirectDeliveryCore::new(
            Arc::clone(&self.inner.registry),
            self.inner.events.clone(),
        ));
        self.set_default_core(core.clone());
        core
    }

    /// Make a [`QueuedDeliveryCore`] over `queues` the default core
    pub fn use_queued_delivery(&self, queues: DeliveryQueues) -> Arc<QueuedDeliveryCore> {
        let core = Arc::new(self.queued_core(crate::constants::cores::QUEUED, queues));
        self.set_default_core(core.clone());
        core
    }

    /// Build a named [`QueuedDeliveryCore`] sharing this runtime's registry,
    /// events and configuration
    pub fn queued_core(&self, name: &str, queues: DeliveryQueues) -> QueuedDeliveryCore {
        QueuedDeliveryCore::named(
            name,
            queues,
            self.inner.config.delivery.clone(),
            self.inner.config.worker_pool.clone(),
            Arc::clone(&self.inner.registry),
            self.inner.events.clone(),
        )
    }

    /// Register a subscription.
    ///
    /// On a running bus the dispatcher is started before the endpoint becomes
    /// routable, so no delivery reaches a dispatcher that has not started.
    pub async fn subscribe(&self, endpoint: SubscriptionEndpoint) -> BusResult<Uuid> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let subscription_id = endpoint.id;
        if self.inner.registry.get(subscription_id).is_some() {
            return Err(BusError::DuplicateSubscription { subscription_id });
        }

        let started = match &endpoint.dispatcher {
            Some(dispatcher) if self.is_running() => {
                dispatcher.start().await?;
                Some(Arc::clone(dispatcher))
            }
            _ => None,
        };

        match self.inner.registry.subscribe(endpoint) {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Some(dispatcher) = started {
                    stop_dispatcher(subscription_id, dispatcher.as_ref()).await;
                }
                Err(e)
            }
        }
    }

    /// Remove a subscription.
    ///
    /// On a running bus the dispatcher is stopped only after attempts already
    /// dispatching to it have returned (bounded by the worker stop timeout).
    pub async fn unsubscribe(&self, subscription_id: Uuid) -> BusResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let removed = self.inner.registry.unsubscribe(subscription_id)?;
        if self.is_running() {
            self.retire(removed).await;
        }
        Ok(())
    }

    /// Remove subscriptions whose expiration has passed
    pub async fn purge_expired_subscriptions(&self) -> usize {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let purged = self.inner.registry.purge_expired(Utc::now());
        let count = purged.len();
        if self.is_running() {
            for endpoint in purged {
                self.retire(endpoint).await;
            }
        }
        count
    }

    /// Wait for in-flight attempts to release `endpoint`, then stop its dispatcher
    async fn retire(&self, endpoint: Arc<SubscriptionEndpoint>) {
        let Some(dispatcher) = endpoint.dispatcher.clone() else {
            return;
        };

        // Every attempt holds its own reference for the duration of dispatch
        let stop_timeout = self.inner.config.worker_pool.stop_timeout();
        let drained = tokio::time::timeout(stop_timeout, async {
            while Arc::strong_count(&endpoint) > 1 {
                tokio::time::sleep(RETIRE_POLL_INTERVAL).await;
            }
        })
        .await
        .is_ok();
        if !drained {
            warn!(
                subscription_id = %endpoint.id,
                timeout_ms = stop_timeout.as_millis() as u64,
                "Dispatch still in flight at stop timeout; stopping dispatcher anyway"
            );
        }

        stop_dispatcher(endpoint.id, dispatcher.as_ref()).await;
    }

    /// Start dispatchers, then delivery cores
    pub async fn start(&self) -> BusResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_running() {
            return Err(BusError::already_started(COMPONENT));
        }
        if self.inner.cores.is_empty() {
            return Err(ConfigurationError::missing_component(
                "delivery_core",
                "runtime start requires at least one delivery core",
            )
            .into());
        }

        let endpoints = self.inner.registry.snapshot();
        let mut started: Vec<&SubscriptionEndpoint> = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints.iter() {
            if let Some(dispatcher) = &endpoint.dispatcher {
                if let Err(e) = dispatcher.start().await {
                    log_error(
                        COMPONENT,
                        "start_dispatcher",
                        &e.to_string(),
                        Some(endpoint.name.as_str()),
                    );
                    stop_endpoints(&started).await;
                    return Err(e.into());
                }
                started.push(&**endpoint);
            }
        }

        let cores = self.inner.cores.all();
        for (index, core) in cores.iter().enumerate() {
            if let Err(e) = core.start().await {
                log_error(COMPONENT, "start_core", &e.to_string(), Some(core.name()));
                for running in cores[..index].iter().rev() {
                    if let Err(stop_err) = running.stop().await {
                        log_error(
                            COMPONENT,
                            "stop_core",
                            &stop_err.to_string(),
                            Some(running.name()),
                        );
                    }
                }
                stop_endpoints(&started).await;
                return Err(e);
            }
        }

        self.inner.running.store(true, Ordering::SeqCst);
        info!(
            subscriptions = endpoints.len(),
            cores = cores.len(),
            "🚀 Message bus started"
        );
        Ok(())
    }

    /// Stop delivery cores (draining in-flight attempts), then dispatchers.
    ///
    /// Publishing stays open while the cores drain so in-flight dispatchers
    /// can still send replies.
    pub async fn stop(&self) -> BusResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_running() {
            return Err(BusError::not_started(COMPONENT));
        }

        for core in self.inner.cores.all() {
            if let Err(e) = core.stop().await {
                log_error(COMPONENT, "stop_core", &e.to_string(), Some(core.name()));
            }
        }
        self.inner.running.store(false, Ordering::SeqCst);

        let snapshot = self.inner.registry.snapshot();
        let endpoints: Vec<&SubscriptionEndpoint> =
            snapshot.iter().map(|endpoint| &**endpoint).collect();
        stop_endpoints(&endpoints).await;

        info!("🛑 Message bus stopped");
        Ok(())
    }

    /// Route `request` to every matching subscription.
    ///
    /// A reply-shaped request (one carrying `relates_to`) is handed to the
    /// correlator instead of being routed.
    pub async fn publish(&self, request: PublishRequest) -> BusResult<Vec<Uuid>> {
        if !self.is_running() {
            return Err(BusError::not_started(COMPONENT));
        }

        if let Some(correlation_id) = request.context.relates_to() {
            let reply = MessageDelivery::new(
                Uuid::nil(),
                request.contract_type.clone(),
                request.action.clone(),
                request.message.clone(),
                0,
                request.context.clone(),
            );
            let reply_id = reply.delivery_id;
            return Ok(if self.inner.correlator.reply(correlation_id, reply) {
                vec![reply_id]
            } else {
                Vec::new()
            });
        }

        self.inner.router.publish(&request).await
    }

    /// Publish and wait for the correlated reply.
    ///
    /// Uses the request's correlation id when present, otherwise assigns one.
    /// `timeout` defaults to the configured reply timeout.
    pub async fn publish_two_way(
        &self,
        request: PublishRequest,
        timeout: Option<Duration>,
    ) -> BusResult<Vec<MessageDelivery>> {
        let correlation_id = request
            .context
            .correlation_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let context = request
            .context
            .with(ContextKey::correlation_id(), Value::String(correlation_id.clone()));
        let request = request.with_context(context);

        let waiter = self.inner.correlator.begin_wait(correlation_id.as_str());
        let routed = self.publish(request).await?;
        if routed.is_empty() {
            debug!(correlation_id = %correlation_id, "Two-way request matched no subscription");
        }

        let timeout =
            timeout.unwrap_or_else(|| self.inner.config.correlation.default_reply_timeout());
        self.inner.correlator.end_wait(waiter, timeout).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }
}

async fn stop_dispatcher(subscription_id: Uuid, dispatcher: &dyn Dispatcher) {
    if let Err(e) = dispatcher.stop().await {
        warn!(
            subscription_id = %subscription_id,
            dispatcher = dispatcher.dispatcher_name(),
            error = %e,
            "Dispatcher failed to stop"
        );
    }
}

async fn stop_endpoints(endpoints: &[&SubscriptionEndpoint]) {
    for endpoint in endpoints.iter().rev() {
        if let Some(dispatcher) = &endpoint.dispatcher {
            stop_dispatcher(endpoint.id, dispatcher.as_ref()).await;
        }
    }
}

impl fmt::Debug for MessageBusRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBusRuntime")
            .field("running", &self.is_running())
            .field("subscriptions", &self.inner.registry.len())
            .field("cores", &self.inner.cores.all().len())
            .field("pending_replies", &self.inner.correlator.pending_count())
            .finish()
    }
}
