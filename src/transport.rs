//! Transport ports implemented by every broker adapter
//!
//! A broker adapter provides a [`Producer`], a [`Consumer`] and the
//! [`Connection`] they share. [`TransportRegistry`] maps a [`BrokerKind`]
//! to the factory that builds them; it is created once at startup and
//! handed to [`crate::Server::connect`].

use crate::config::{BrokerKind, MqConfig};
use crate::error::{MqError, Result};
use crate::message::{DeadLetterMessage, Headers, Message};
use crate::retry::{policy_from_config, RetryPolicy};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Consumes messages delivered to a `topic:channel` subscription
///
/// Returning an error hands the message to the retry policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<()>;
}

/// Receives messages that exhausted their retry budget
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    async fn handle_dead_letter(&self, dead: DeadLetterMessage) -> Result<()>;
}

/// Publishing half of a broker adapter
#[async_trait]
pub trait Producer: Send + Sync {
    /// Wrap the payload into a [`Message`] and send it, waiting for the broker
    async fn publish(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<()>;

    /// Publish after `delay`
    async fn publish_delay(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
        delay: Duration,
    ) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Consuming half of a broker adapter
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Register `handler` under `topic:channel`
    ///
    /// Registering an existing key is a no-op.
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;

    async fn unsubscribe(&self, topic: &str, channel: &str) -> Result<()>;

    fn set_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler>);

    fn is_subscribed(&self, topic: &str, channel: &str) -> bool;

    /// Unsubscribe every key and stop in-flight deliveries
    async fn close(&self) -> Result<()>;
}

/// Broker connection shared by a producer and a consumer
#[async_trait]
pub trait Connection: Send + Sync {
    async fn close(&self) -> Result<()>;
}

/// The parts a broker adapter contributes to the unified server
pub struct Transport {
    pub producer: Arc<dyn Producer>,
    pub consumer: Arc<dyn Consumer>,
    pub connection: Arc<dyn Connection>,
}

/// Builds a [`Transport`] for one broker kind
pub type TransportFactory =
    Arc<dyn Fn(MqConfig, Arc<dyn RetryPolicy>) -> BoxFuture<'static, Result<Transport>> + Send + Sync>;

/// Explicit registry of broker adapters
pub struct TransportRegistry {
    factories: HashMap<BrokerKind, TransportFactory>,
}

impl TransportRegistry {
    /// A registry with no adapters
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the NATS, NSQ and in-process adapters
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            BrokerKind::Nats,
            Arc::new(|config: MqConfig, policy: Arc<dyn RetryPolicy>| {
                crate::nats::connect(config, policy).boxed()
            }),
        );
        registry.register(
            BrokerKind::Nsq,
            Arc::new(|config: MqConfig, policy: Arc<dyn RetryPolicy>| {
                crate::nsq::connect(config, policy).boxed()
            }),
        );
        registry.register(
            BrokerKind::Memory,
            Arc::new(|config: MqConfig, policy: Arc<dyn RetryPolicy>| {
                let transport = crate::memory::MemoryBroker::new().transport(&config, policy);
                futures::future::ok::<_, MqError>(transport).boxed()
            }),
        );
        registry
    }

    /// Register (or replace) the factory for `kind`
    pub fn register(&mut self, kind: BrokerKind, factory: TransportFactory) {
        self.factories.insert(kind, factory);
    }

    pub fn contains(&self, kind: BrokerKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Validate the configuration and build the configured transport
    pub async fn build(&self, config: &MqConfig) -> Result<Transport> {
        config.validate()?;
        let factory = self
            .factories
            .get(&config.broker)
            .ok_or_else(|| MqError::UnsupportedBroker(config.broker.to_string()))?;
        factory(config.clone(), policy_from_config(config)).await
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Registry key of a subscription
pub fn subscription_key(topic: &str, channel: &str) -> String {
    format!("{}:{}", topic, channel)
}

struct FnMessageHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnMessageHandler<F>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<()> {
        (self.0)(cancel, message).await
    }
}

/// Adapt a closure into a [`MessageHandler`]
pub fn message_handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(CancellationToken, Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnMessageHandler(f))
}

struct FnDeadLetterHandler<F>(F);

#[async_trait]
impl<F, Fut> DeadLetterHandler for FnDeadLetterHandler<F>
where
    F: Fn(DeadLetterMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle_dead_letter(&self, dead: DeadLetterMessage) -> Result<()> {
        (self.0)(dead).await
    }
}

/// Adapt a closure into a [`DeadLetterHandler`]
pub fn dead_letter_handler_fn<F, Fut>(f: F) -> Arc<dyn DeadLetterHandler>
where
    F: Fn(DeadLetterMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnDeadLetterHandler(f))
}
