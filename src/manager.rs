//! Subscription manager
//!
//! Binds application handlers to `(topic, channel)` keys and drives them from
//! the [`EventBus`]. Every delivery goes through the same gate:
//!
//! 1. deactivated keys drop the event silently
//! 2. the event's tenant is moved into the context
//! 3. per-subscription parameters are loaded from the [`SubscriptionStore`]
//! 4. idempotent handlers are skipped for already processed events and the
//!    event is marked processed only after the handler succeeds
//!
//! Handler errors propagate so the transport retries and eventually
//! dead-letters; dead letters are archived through the store. Panics inside
//! handlers are caught and logged at the subscription boundary.

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::event::{DeadLetterEvent, Event};
use crate::event_bus::{DeadLetterEventHandler, EventBus, EventHandler};
use crate::idempotency::Idempotency;
use crate::store::{Parameters, SubscriptionStatus, SubscriptionStore};
use crate::transport::subscription_key;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Everything a handler knows about the delivery besides the event
#[derive(Debug, Clone)]
pub struct EventContext {
    pub context: Context,
    pub topic: String,
    pub channel: String,
    pub parameters: Parameters,
}

#[async_trait]
pub trait SubscriptionHandler: Send + Sync {
    async fn handle(&self, ctx: EventContext, event: Event) -> Result<()>;
}

struct SubscriptionHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> SubscriptionHandler for SubscriptionHandlerFn<F>
where
    F: Fn(EventContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: EventContext, event: Event) -> Result<()> {
        (self.0)(ctx, event).await
    }
}

pub fn subscription_handler_fn<F, Fut>(f: F) -> Arc<dyn SubscriptionHandler>
where
    F: Fn(EventContext, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(SubscriptionHandlerFn(f))
}

struct Registration {
    topic: String,
    channel: String,
    handler: Arc<dyn SubscriptionHandler>,
    idempotent: bool,
}

struct Shared {
    bus: Arc<EventBus>,
    store: Arc<dyn SubscriptionStore>,
    idempotency: Option<Arc<Idempotency>>,
    registrations: DashMap<String, Arc<Registration>>,
    active: DashMap<String, bool>,
}

impl Shared {
    fn is_active(&self, key: &str) -> bool {
        self.active.get(key).map(|flag| *flag).unwrap_or(true)
    }

    async fn handle(&self, ctx: Context, topic: &str, channel: &str, event: Event) -> Result<()> {
        let key = subscription_key(topic, channel);
        if !self.is_active(&key) {
            tracing::debug!(
                topic = %topic,
                channel = %channel,
                event_id = %event.id,
                "Subscription inactive, event dropped"
            );
            return Ok(());
        }

        let registration = self
            .registrations
            .get(&key)
            .map(|r| r.value().clone())
            .ok_or_else(|| MqError::HandlerNotFound {
                topic: topic.to_string(),
                channel: channel.to_string(),
            })?;

        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        let ctx = match event.tenant_id.as_deref() {
            Some(tenant_id) => ctx.with_tenant_id(tenant_id),
            None => ctx,
        };
        let parameters = self.store.get_parameters(topic, channel).await?;
        let event_ctx = EventContext {
            context: ctx.clone(),
            topic: topic.to_string(),
            channel: channel.to_string(),
            parameters,
        };

        if !registration.idempotent {
            return registration.handler.handle(event_ctx, event).await;
        }

        let idempotency = self.idempotency.as_ref().ok_or_else(|| {
            MqError::Config(format!("{} is idempotent but no idempotency guard is set", key))
        })?;
        let event_id = event.id.clone();
        if idempotency.check(&ctx, topic, channel, &event_id).await? {
            tracing::debug!(
                topic = %topic,
                channel = %channel,
                event_id = %event_id,
                "Event already processed, skipping"
            );
            return Ok(());
        }

        registration.handler.handle(event_ctx, event).await?;
        idempotency
            .mark_processed(&ctx, topic, channel, &event_id)
            .await
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Bus-facing handler installed by [`Manager::start`]
struct ManagedDelivery {
    shared: Arc<Shared>,
    topic: String,
    channel: String,
}

#[async_trait]
impl EventHandler for ManagedDelivery {
    async fn handle(&self, ctx: Context, event: Event) -> Result<()> {
        let event_id = event.id.clone();
        let delivery = self.shared.handle(ctx, &self.topic, &self.channel, event);
        match AssertUnwindSafe(delivery).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    topic = %self.topic,
                    channel = %self.channel,
                    event_id = %event_id,
                    panic = %panic_message(panic.as_ref()),
                    "Subscription handler panicked"
                );
                Ok(())
            }
        }
    }
}

/// Archives dead-lettered events in the subscription store
struct DeadLetterArchive {
    store: Arc<dyn SubscriptionStore>,
}

#[async_trait]
impl DeadLetterEventHandler for DeadLetterArchive {
    async fn handle_dead_letter(&self, _ctx: Context, dead: DeadLetterEvent) -> Result<()> {
        let saved = AssertUnwindSafe(self.store.save_dead_letter(&dead))
            .catch_unwind()
            .await;
        match saved {
            Ok(Ok(())) => {
                tracing::warn!(
                    event_id = %dead.id,
                    topic = %dead.original_topic,
                    channel = %dead.channel,
                    retry_count = dead.retry_count,
                    error = %dead.error,
                    "Dead letter archived"
                );
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(panic) => {
                tracing::error!(
                    event_id = %dead.id,
                    panic = %panic_message(panic.as_ref()),
                    "Dead-letter archive panicked"
                );
                Ok(())
            }
        }
    }
}

/// Handler registry with activation control on top of an [`EventBus`]
pub struct Manager {
    shared: Arc<Shared>,
    subscription_ids: DashMap<String, String>,
    dead_letter_id: Mutex<Option<String>>,
    started: AtomicBool,
}

impl Manager {
    pub fn new(bus: Arc<EventBus>, store: Arc<dyn SubscriptionStore>) -> Self {
        Self::build(bus, store, None)
    }

    /// Manager whose idempotent handlers are guarded by `idempotency`
    pub fn with_idempotency(
        bus: Arc<EventBus>,
        store: Arc<dyn SubscriptionStore>,
        idempotency: Arc<Idempotency>,
    ) -> Self {
        Self::build(bus, store, Some(idempotency))
    }

    fn build(
        bus: Arc<EventBus>,
        store: Arc<dyn SubscriptionStore>,
        idempotency: Option<Arc<Idempotency>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                store,
                idempotency,
                registrations: DashMap::new(),
                active: DashMap::new(),
            }),
            subscription_ids: DashMap::new(),
            dead_letter_id: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.bus
    }

    pub fn register(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<()> {
        self.insert_registration(topic, channel, handler, false)
    }

    /// Register a handler whose effects must happen once per event id
    pub fn register_idempotent(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<()> {
        if self.shared.idempotency.is_none() {
            return Err(MqError::Config(format!(
                "cannot register {} as idempotent without an idempotency guard",
                subscription_key(topic, channel)
            )));
        }
        self.insert_registration(topic, channel, handler, true)
    }

    fn insert_registration(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
        idempotent: bool,
    ) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(MqError::AlreadyStarted);
        }

        match self.shared.registrations.entry(subscription_key(topic, channel)) {
            Entry::Occupied(_) => Err(MqError::DuplicateRegistration {
                topic: topic.to_string(),
                channel: channel.to_string(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Registration {
                    topic: topic.to_string(),
                    channel: channel.to_string(),
                    handler,
                    idempotent,
                }));
                tracing::debug!(
                    topic = %topic,
                    channel = %channel,
                    idempotent = idempotent,
                    "Handler registered"
                );
                Ok(())
            }
        }
    }

    /// Subscribe every registered handler plus the dead-letter archive
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(MqError::AlreadyStarted);
        }

        if let Err(e) = self.subscribe_all().await {
            if let Err(rollback) = self.stop().await {
                tracing::error!(error = %rollback, "Failed to roll back partial start");
            }
            return Err(e);
        }

        tracing::info!(
            subscriptions = self.subscription_ids.len(),
            "Subscription manager started"
        );
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<()> {
        for record in self
            .shared
            .store
            .get_by_status(SubscriptionStatus::Disabled)
            .await?
        {
            self.shared.active.entry(record.key()).or_insert(false);
        }

        let registrations: Vec<Arc<Registration>> = self
            .shared
            .registrations
            .iter()
            .map(|r| r.value().clone())
            .collect();
        for registration in registrations {
            let delivery = Arc::new(ManagedDelivery {
                shared: self.shared.clone(),
                topic: registration.topic.clone(),
                channel: registration.channel.clone(),
            });
            let id = self
                .shared
                .bus
                .subscribe(&registration.topic, &registration.channel, delivery)
                .await?;
            self.subscription_ids.insert(
                subscription_key(&registration.topic, &registration.channel),
                id,
            );
        }

        let archive = Arc::new(DeadLetterArchive {
            store: self.shared.store.clone(),
        });
        let id = self.shared.bus.subscribe_dead_letter(archive).await?;
        if let Ok(mut current) = self.dead_letter_id.lock() {
            *current = Some(id);
        }
        Ok(())
    }

    /// Run the delivery gate for an event directly, bypassing the broker
    pub async fn handle(&self, ctx: Context, topic: &str, channel: &str, event: Event) -> Result<()> {
        self.shared.handle(ctx, topic, channel, event).await
    }

    /// Replay a dead-lettered event through its original handler
    pub async fn retry_dead_letter(&self, ctx: Context, dead: &DeadLetterEvent) -> Result<()> {
        tracing::info!(
            event_id = %dead.id,
            topic = %dead.original_topic,
            channel = %dead.channel,
            "Retrying dead letter"
        );
        self.shared
            .handle(ctx, &dead.original_topic, &dead.channel, dead.to_event())
            .await
    }

    pub fn activate_subscription(&self, topic: &str, channel: &str) {
        self.shared.active.insert(subscription_key(topic, channel), true);
        tracing::info!(topic = %topic, channel = %channel, "Subscription activated");
    }

    /// Stop handing events to the handler; the broker subscription stays
    pub fn deactivate_subscription(&self, topic: &str, channel: &str) {
        self.shared.active.insert(subscription_key(topic, channel), false);
        tracing::info!(topic = %topic, channel = %channel, "Subscription deactivated");
    }

    pub fn is_active(&self, topic: &str, channel: &str) -> bool {
        self.shared.is_active(&subscription_key(topic, channel))
    }

    /// Registered `topic:channel` keys, sorted
    pub fn registered_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shared
            .registrations
            .iter()
            .map(|r| r.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Unsubscribe everything started by [`Manager::start`]
    pub async fn stop(&self) -> Result<()> {
        let mut errors = Vec::new();

        let keys: Vec<String> = self.subscription_ids.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, id)) = self.subscription_ids.remove(&key) {
                if let Err(e) = self.shared.bus.unsubscribe(&id).await {
                    errors.push(e);
                }
            }
        }

        let dead_letter_id = self
            .dead_letter_id
            .lock()
            .ok()
            .and_then(|mut current| current.take());
        if let Some(id) = dead_letter_id {
            if let Err(e) = self.shared.bus.unsubscribe(&id).await {
                errors.push(e);
            }
        }

        self.started.store(false, Ordering::SeqCst);
        MqError::aggregate(errors)
    }

    /// Stop and close the underlying event bus
    pub async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        for result in [self.stop().await, self.shared.bus.close().await] {
            match result {
                Err(MqError::Close(inner)) => errors.extend(inner),
                Err(e) => errors.push(e),
                Ok(()) => {}
            }
        }
        tracing::info!("Subscription manager closed");
        MqError::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqConfig;
    use crate::idempotency::{
        IdempotencyLedger, IdempotencyRecord, InMemoryLedger, MokaIdempotencyCache,
    };
    use crate::memory::MemoryBroker;
    use crate::message::{DeadLetterMessage, Message};
    use crate::retry::LinearBackoff;
    use crate::server::Server;
    use crate::store::{InMemorySubscriptionStore, SubscriptionRecord};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// Ledger that counts writes
    #[derive(Default)]
    struct SpyLedger {
        inner: InMemoryLedger,
        inserts: AtomicU32,
    }

    #[async_trait]
    impl IdempotencyLedger for SpyLedger {
        async fn find(
            &self,
            topic: &str,
            channel: &str,
            message_id: &str,
        ) -> Result<Option<IdempotencyRecord>> {
            self.inner.find(topic, channel, message_id).await
        }

        async fn insert(&self, record: IdempotencyRecord) -> Result<()> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            self.inner.insert(record).await
        }
    }

    /// Store whose dead-letter archive blows up
    #[derive(Default)]
    struct ExplodingStore {
        archived: AtomicU32,
    }

    #[async_trait]
    impl SubscriptionStore for ExplodingStore {
        async fn get_by_status(
            &self,
            _status: SubscriptionStatus,
        ) -> Result<Vec<SubscriptionRecord>> {
            Ok(Vec::new())
        }

        async fn get_parameters(&self, _topic: &str, _channel: &str) -> Result<Parameters> {
            Ok(Parameters::new())
        }

        async fn save_dead_letter(&self, _dead: &DeadLetterEvent) -> Result<()> {
            self.archived.fetch_add(1, Ordering::SeqCst);
            panic!("archive unavailable");
        }
    }

    struct Fixture {
        manager: Arc<Manager>,
        store: Arc<InMemorySubscriptionStore>,
        ledger: Arc<SpyLedger>,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let policy = Arc::new(LinearBackoff::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
            max_attempts,
        ));
        let transport = MemoryBroker::new().transport(&MqConfig::memory(), policy);
        let bus = Arc::new(EventBus::new(Arc::new(Server::from_transport(
            transport,
            "dead_letter",
        ))));
        let store = Arc::new(InMemorySubscriptionStore::new());
        let ledger = Arc::new(SpyLedger::default());
        let idempotency = Arc::new(Idempotency::new(
            Arc::new(MokaIdempotencyCache::new()),
            ledger.clone(),
        ));
        let manager = Arc::new(Manager::with_idempotency(bus, store.clone(), idempotency));
        Fixture {
            manager,
            store,
            ledger,
        }
    }

    fn counting() -> (Arc<dyn SubscriptionHandler>, Arc<Mutex<Vec<(EventContext, Event)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = subscription_handler_fn(move |ctx, event| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((ctx, event));
                Ok::<(), MqError>(())
            }
        });
        (handler, seen)
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let f = fixture(3);
        let (handler, _) = counting();
        f.manager.register("orders", "billing", handler.clone()).unwrap();
        let again = f.manager.register_idempotent("orders", "billing", handler);
        assert!(matches!(again, Err(MqError::DuplicateRegistration { .. })));
        assert_eq!(f.manager.registered_keys(), vec!["orders:billing".to_string()]);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_registration_has_one_winner() {
        let f = fixture(3);
        let (handler, _) = counting();

        let tasks: Vec<_> = (0..2)
            .map(|_| {
                let manager = f.manager.clone();
                let handler = handler.clone();
                tokio::spawn(async move { manager.register("orders", "billing", handler) })
            })
            .collect();

        let mut wins = 0;
        let mut duplicates = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => wins += 1,
                Err(MqError::DuplicateRegistration { .. }) => duplicates += 1,
                Err(e) => panic!("unexpected error {}", e),
            }
        }
        assert_eq!((wins, duplicates), (1, 1));
    }

    #[tokio::test]
    async fn test_register_idempotent_requires_guard() {
        let transport = MemoryBroker::new().transport(
            &MqConfig::memory(),
            Arc::new(LinearBackoff::new(Duration::ZERO, Duration::ZERO, 1)),
        );
        let bus = Arc::new(EventBus::new(Arc::new(Server::from_transport(
            transport,
            "dead_letter",
        ))));
        let manager = Manager::new(bus, Arc::new(InMemorySubscriptionStore::new()));
        let (handler, _) = counting();

        let result = manager.register_idempotent("orders", "billing", handler);
        assert!(matches!(result, Err(MqError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_fails_and_register_after_start_fails() {
        let f = fixture(3);
        let (handler, _) = counting();
        f.manager.register("orders", "billing", handler.clone()).unwrap();

        f.manager.start().await.unwrap();
        assert!(matches!(f.manager.start().await, Err(MqError::AlreadyStarted)));
        assert!(matches!(
            f.manager.register("orders", "audit", handler),
            Err(MqError::AlreadyStarted)
        ));
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_delivery_builds_event_context() {
        let f = fixture(3);
        f.store.upsert(
            SubscriptionRecord::new("orders", "billing", SubscriptionStatus::Enabled)
                .with_parameter("currency", json!("EUR")),
        );
        let (handler, seen) = counting();
        f.manager.register("orders", "billing", handler).unwrap();
        f.manager.start().await.unwrap();

        let mut event = Event::new("orders", json!({"order_id": 1})).unwrap();
        event.set_tenant_id("acme");
        f.manager
            .bus()
            .publish(&Context::background(), &event)
            .await
            .unwrap();

        wait_for(|| seen.lock().unwrap().len() == 1).await;
        let (ctx, delivered) = seen.lock().unwrap()[0].clone();
        assert_eq!(ctx.topic, "orders");
        assert_eq!(ctx.channel, "billing");
        assert_eq!(ctx.parameters["currency"], json!("EUR"));
        assert_eq!(ctx.context.tenant_id(), Some("acme"));
        assert_eq!(delivered.id, event.id);
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_idempotent_handler_runs_once_per_event() {
        let f = fixture(3);
        let (handler, seen) = counting();
        f.manager
            .register_idempotent("orders", "billing", handler)
            .unwrap();
        f.manager.start().await.unwrap();

        let event = Event::new("orders", json!({"order_id": 2})).unwrap();
        let ctx = Context::background();
        f.manager.bus().publish(&ctx, &event).await.unwrap();
        wait_for(|| f.ledger.inner.len() == 1).await;

        // redelivery of the same event id
        f.manager.bus().publish(&ctx, &event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.ledger.inserts.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivated_subscription_drops_events() {
        let f = fixture(3);
        let (handler, seen) = counting();
        f.manager
            .register_idempotent("orders", "billing", handler)
            .unwrap();
        f.manager.start().await.unwrap();
        f.manager.deactivate_subscription("orders", "billing");
        assert!(!f.manager.is_active("orders", "billing"));

        let ctx = Context::background();
        for n in 0..5 {
            let event = Event::new("orders", json!({ "n": n })).unwrap();
            f.manager.bus().publish(&ctx, &event).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(f.ledger.inserts.load(Ordering::SeqCst), 0);
        assert!(f.manager.bus().server().is_subscribed("orders", "billing"));

        f.manager.activate_subscription("orders", "billing");
        let event = Event::new("orders", json!({"n": 99})).unwrap();
        f.manager.bus().publish(&ctx, &event).await.unwrap();
        wait_for(|| seen.lock().unwrap().len() == 1).await;
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_persisted_disabled_state_loaded_on_start() {
        let f = fixture(3);
        f.store.upsert(SubscriptionRecord::new(
            "orders",
            "audit",
            SubscriptionStatus::Disabled,
        ));
        let (handler, _) = counting();
        f.manager.register("orders", "audit", handler.clone()).unwrap();
        f.manager.register("orders", "billing", handler).unwrap();

        assert!(f.manager.is_active("orders", "audit"));
        f.manager.start().await.unwrap();
        assert!(!f.manager.is_active("orders", "audit"));
        assert!(f.manager.is_active("orders", "billing"));
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_handler_dead_letters_and_replays() {
        let f = fixture(3);
        let calls = Arc::new(AtomicU32::new(0));
        let failing = Arc::new(AtomicBool::new(true));
        let received = Arc::new(Mutex::new(Vec::new()));

        let (counter, switch, sink) = (calls.clone(), failing.clone(), received.clone());
        f.manager
            .register(
                "orders",
                "billing",
                subscription_handler_fn(move |_ctx, event| {
                    let (counter, switch, sink) = (counter.clone(), switch.clone(), sink.clone());
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if switch.load(Ordering::SeqCst) {
                            return Err(MqError::handler("ledger offline"));
                        }
                        sink.lock().unwrap().push(event);
                        Ok(())
                    }
                }),
            )
            .unwrap();
        f.manager.start().await.unwrap();

        let mut event = Event::new("orders", json!({"order_id": 5})).unwrap();
        event.set_metadata("source", "checkout");
        f.manager
            .bus()
            .publish(&Context::background(), &event)
            .await
            .unwrap();

        wait_for(|| f.store.dead_letters().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let dead = f.store.dead_letters().remove(0);
        assert_eq!(dead.retry_count, 3);
        assert_eq!(dead.id, event.id);

        failing.store(false, Ordering::SeqCst);
        f.manager
            .retry_dead_letter(Context::background(), &dead)
            .await
            .unwrap();
        let replayed = received.lock().unwrap()[0].clone();
        assert_eq!(replayed.data, json!({"order_id": 5}));
        assert_eq!(replayed.metadata["source"], "checkout");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_handler_is_isolated() {
        let f = fixture(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        f.manager
            .register(
                "orders",
                "billing",
                subscription_handler_fn(move |_ctx, event| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if event.data["explode"] == json!(true) {
                            panic!("handler exploded");
                        }
                        Ok::<(), MqError>(())
                    }
                }),
            )
            .unwrap();
        f.manager.start().await.unwrap();

        let ctx = Context::background();
        let boom = Event::new("orders", json!({"explode": true})).unwrap();
        let fine = Event::new("orders", json!({"explode": false})).unwrap();
        f.manager.bus().publish(&ctx, &boom).await.unwrap();
        f.manager.bus().publish(&ctx, &fine).await.unwrap();

        wait_for(|| calls.load(Ordering::SeqCst) == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // a caught panic acknowledges the message, so it is not retried
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(f.store.dead_letters().is_empty());
        f.manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_dead_letter_archive_is_isolated() {
        let policy = Arc::new(LinearBackoff::new(Duration::ZERO, Duration::ZERO, 1));
        let transport = MemoryBroker::new().transport(&MqConfig::memory(), policy);
        let bus = Arc::new(EventBus::new(Arc::new(Server::from_transport(
            transport,
            "dead_letter",
        ))));
        let store = Arc::new(ExplodingStore::default());
        let manager = Manager::new(bus, store.clone());

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        manager
            .register(
                "orders",
                "billing",
                subscription_handler_fn(move |_ctx, event| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        if event.data["reject"] == json!(true) {
                            return Err(MqError::handler("rejected"));
                        }
                        Ok::<(), MqError>(())
                    }
                }),
            )
            .unwrap();
        manager.start().await.unwrap();

        let ctx = Context::background();
        let rejected = Event::new("orders", json!({"reject": true})).unwrap();
        manager.bus().publish(&ctx, &rejected).await.unwrap();
        wait_for(|| store.archived.load(Ordering::SeqCst) == 1).await;

        // the archive panic did not take the subscriptions down
        let accepted = Event::new("orders", json!({"reject": false})).unwrap();
        manager.bus().publish(&ctx, &accepted).await.unwrap();
        wait_for(|| calls.load(Ordering::SeqCst) == 2).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.archived.load(Ordering::SeqCst), 1);
        manager.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dead_letter_archive_swallows_store_panic() {
        let store = Arc::new(ExplodingStore::default());
        let archive = DeadLetterArchive {
            store: store.clone(),
        };
        let message = Message::from_text("orders", "{}", Default::default());
        let dead = DeadLetterMessage::from_failure(&message, "billing", "boom".to_string(), 1);

        let result = archive
            .handle_dead_letter(
                Context::background(),
                DeadLetterEvent::from_dead_letter_message(&dead),
            )
            .await;
        assert!(result.is_ok());
        assert_eq!(store.archived.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handle_errors() {
        let f = fixture(3);
        let event = Event::new("orders", json!({})).unwrap();
        let missing = f
            .manager
            .handle(Context::background(), "orders", "nobody", event.clone())
            .await;
        assert!(matches!(missing, Err(MqError::HandlerNotFound { .. })));

        let (handler, seen) = counting();
        f.manager.register("orders", "billing", handler).unwrap();
        let ctx = Context::background();
        ctx.cancel();
        let cancelled = f.manager.handle(ctx, "orders", "billing", event).await;
        assert!(matches!(cancelled, Err(MqError::Cancelled)));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stop_keeps_registrations() {
        let f = fixture(3);
        let (handler, _) = counting();
        f.manager.register("orders", "billing", handler).unwrap();
        f.manager.start().await.unwrap();
        assert!(f.manager.bus().server().is_subscribed("orders", "billing"));

        f.manager.stop().await.unwrap();
        assert!(!f.manager.bus().server().is_subscribed("orders", "billing"));
        assert_eq!(f.manager.registered_keys().len(), 1);

        f.manager.start().await.unwrap();
        assert!(f.manager.bus().server().is_subscribed("orders", "billing"));
        f.manager.close().await.unwrap();
    }
}
