//! Broker-independent message server
//!
//! Wraps one transport's producer and consumer behind a topic-level API and
//! forwards everything the consumer dead-letters onto the configured
//! dead-letter topic.

use crate::config::MqConfig;
use crate::error::{MqError, Result};
use crate::message::{DeadLetterMessage, Headers};
use crate::transport::{
    Connection, Consumer, DeadLetterHandler, MessageHandler, Producer, Transport,
    TransportRegistry,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Channel used for the single dead-letter subscription
pub const DEAD_LETTER_CHANNEL: &str = "dead_letter";

/// Republishes dead letters as JSON onto the dead-letter topic
struct DeadLetterForwarder {
    producer: Arc<dyn Producer>,
    topic: String,
}

#[async_trait]
impl DeadLetterHandler for DeadLetterForwarder {
    async fn handle_dead_letter(&self, dead: DeadLetterMessage) -> Result<()> {
        if dead.original_topic == self.topic {
            // a failing dead-letter subscriber must not feed itself
            tracing::error!(
                message_id = %dead.message_id,
                channel = %dead.channel,
                error = %dead.error,
                "Dead letter from the dead-letter topic discarded"
            );
            return Ok(());
        }

        let headers = dead.headers.clone();
        self.producer
            .publish(&self.topic, dead.encode()?, headers)
            .await?;

        tracing::warn!(
            message_id = %dead.message_id,
            topic = %dead.original_topic,
            channel = %dead.channel,
            retry_count = dead.retry_count,
            dead_letter_topic = %self.topic,
            "Message moved to dead-letter topic"
        );
        Ok(())
    }
}

/// Unified publish/subscribe facade over a single transport
pub struct Server {
    producer: Arc<dyn Producer>,
    consumer: Arc<dyn Consumer>,
    connection: Arc<dyn Connection>,
    dead_letter_topic: String,
    dead_letter_active: Mutex<bool>,
    closed: AtomicBool,
}

impl Server {
    /// Build the transport selected by `config.broker` and wrap it
    pub async fn connect(config: &MqConfig, registry: &TransportRegistry) -> Result<Self> {
        let transport = registry.build(config).await?;
        tracing::info!(
            broker = %config.broker,
            dead_letter_topic = %config.dead_letter_topic,
            "Message server connected"
        );
        Ok(Self::from_transport(
            transport,
            config.dead_letter_topic.clone(),
        ))
    }

    pub fn from_transport(transport: Transport, dead_letter_topic: impl Into<String>) -> Self {
        let dead_letter_topic = dead_letter_topic.into();
        transport
            .consumer
            .set_dead_letter_handler(Arc::new(DeadLetterForwarder {
                producer: transport.producer.clone(),
                topic: dead_letter_topic.clone(),
            }));

        Self {
            producer: transport.producer,
            consumer: transport.consumer,
            connection: transport.connection,
            dead_letter_topic,
            dead_letter_active: Mutex::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        self.producer.publish(topic, payload, headers).await
    }

    pub async fn publish_delay(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
        delay: Duration,
    ) -> Result<()> {
        self.producer
            .publish_delay(topic, payload, headers, delay)
            .await
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.consumer.subscribe(topic, channel, handler).await
    }

    pub async fn unsubscribe(&self, topic: &str, channel: &str) -> Result<()> {
        self.consumer.unsubscribe(topic, channel).await
    }

    pub fn is_subscribed(&self, topic: &str, channel: &str) -> bool {
        self.consumer.is_subscribed(topic, channel)
    }

    /// Subscribe to the dead-letter topic, replacing any previous handler
    ///
    /// Messages delivered here carry a JSON-encoded [`DeadLetterMessage`]
    /// as payload.
    pub async fn subscribe_dead_letter(&self, handler: Arc<dyn MessageHandler>) -> Result<()> {
        let mut active = self.dead_letter_active.lock().await;
        if *active {
            self.consumer
                .unsubscribe(&self.dead_letter_topic, DEAD_LETTER_CHANNEL)
                .await?;
            *active = false;
        }
        self.consumer
            .subscribe(&self.dead_letter_topic, DEAD_LETTER_CHANNEL, handler)
            .await?;
        *active = true;

        tracing::info!(topic = %self.dead_letter_topic, "Dead-letter subscription installed");
        Ok(())
    }

    pub async fn unsubscribe_dead_letter(&self) -> Result<()> {
        let mut active = self.dead_letter_active.lock().await;
        if *active {
            self.consumer
                .unsubscribe(&self.dead_letter_topic, DEAD_LETTER_CHANNEL)
                .await?;
            *active = false;
        }
        Ok(())
    }

    /// Close everything; every step runs and failures are combined
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Err(e) = self.unsubscribe_dead_letter().await {
            errors.push(e);
        }
        if let Err(e) = self.consumer.close().await {
            errors.push(e);
        }
        if let Err(e) = self.producer.close().await {
            errors.push(e);
        }
        if let Err(e) = self.connection.close().await {
            errors.push(e);
        }

        if !errors.is_empty() {
            tracing::error!(failures = errors.len(), "Message server closed with errors");
        } else {
            tracing::info!("Message server closed");
        }
        MqError::aggregate(errors)
    }
}
