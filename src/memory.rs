//! In-process broker
//!
//! Follows NSQ channel semantics: every channel of a topic receives its own
//! copy of each message and a channel has a single consumer. Failed
//! deliveries are re-enqueued on the same channel after the policy delay.
//! Messages published to a topic without channels are dropped.

use crate::config::MqConfig;
use crate::delivery::{DeadLetterSlot, Dispatcher, Outcome};
use crate::error::Result;
use crate::message::{Headers, Message};
use crate::retry::RetryPolicy;
use crate::transport::{
    subscription_key, Connection, Consumer, DeadLetterHandler, MessageHandler, Producer, Transport,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct ChannelQueue {
    topic: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
}

struct BrokerState {
    queues: DashMap<String, ChannelQueue>,
    root: CancellationToken,
}

/// Shared in-process broker
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: DashMap::new(),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Producer, consumer and connection bound to this broker
    pub fn transport(&self, _config: &MqConfig, policy: Arc<dyn RetryPolicy>) -> Transport {
        Transport {
            producer: Arc::new(MemoryProducer::new(self.clone())),
            consumer: Arc::new(MemoryConsumer::new(self.clone(), policy)),
            connection: Arc::new(self.clone()),
        }
    }

    /// Fan a raw envelope out to every channel of `topic`; returns the number of channels reached
    fn route(&self, topic: &str, raw: Vec<u8>) -> usize {
        let mut delivered = 0;
        for queue in self.state.queues.iter() {
            if queue.topic == topic && queue.sender.send(raw.clone()).is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            tracing::debug!(topic = %topic, "No channels on topic, message dropped");
        }
        delivered
    }

    fn bind(&self, topic: &str, channel: &str, sender: mpsc::UnboundedSender<Vec<u8>>) {
        self.state.queues.insert(
            subscription_key(topic, channel),
            ChannelQueue {
                topic: topic.to_string(),
                sender,
            },
        );
    }

    fn unbind(&self, topic: &str, channel: &str) {
        self.state.queues.remove(&subscription_key(topic, channel));
    }

    fn token(&self) -> CancellationToken {
        self.state.root.child_token()
    }

    /// Number of bound channels across all topics
    pub fn channel_count(&self) -> usize {
        self.state.queues.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn close(&self) -> Result<()> {
        self.state.root.cancel();
        self.state.queues.clear();
        Ok(())
    }
}

/// Publishing half of the in-process broker
pub struct MemoryProducer {
    broker: MemoryBroker,
    cancel: CancellationToken,
}

impl MemoryProducer {
    pub fn new(broker: MemoryBroker) -> Self {
        let cancel = broker.token();
        Self { broker, cancel }
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn publish(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        let raw = Message::new(topic, payload, headers)?.encode()?;
        self.broker.route(topic, raw);
        Ok(())
    }

    async fn publish_delay(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
        delay: Duration,
    ) -> Result<()> {
        let raw = Message::new(topic, payload, headers)?.encode()?;
        let broker = self.broker.clone();
        let cancel = self.cancel.clone();
        let topic = topic.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::warn!(topic = %topic, "Delayed publish discarded on shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    broker.route(&topic, raw);
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Consuming half of the in-process broker
pub struct MemoryConsumer {
    broker: MemoryBroker,
    policy: Arc<dyn RetryPolicy>,
    dead_letters: Arc<DeadLetterSlot>,
    subscriptions: DashMap<String, CancellationToken>,
    root: CancellationToken,
}

impl MemoryConsumer {
    pub fn new(broker: MemoryBroker, policy: Arc<dyn RetryPolicy>) -> Self {
        let root = broker.token();
        Self {
            broker,
            policy,
            dead_letters: Arc::new(DeadLetterSlot::default()),
            subscriptions: DashMap::new(),
            root,
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let key = subscription_key(topic, channel);
        let token = match self.subscriptions.entry(key) {
            Entry::Occupied(_) => {
                tracing::debug!(topic = %topic, channel = %channel, "Already subscribed");
                return Ok(());
            }
            Entry::Vacant(vacant) => vacant.insert(self.root.child_token()).clone(),
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker.bind(topic, channel, sender.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            topic,
            channel,
            handler,
            self.policy.clone(),
            self.dead_letters.clone(),
        ));
        tokio::spawn(consume(receiver, sender, dispatcher, token));

        tracing::info!(topic = %topic, channel = %channel, "Subscribed to in-process topic");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, channel: &str) -> Result<()> {
        if let Some((_, token)) = self.subscriptions.remove(&subscription_key(topic, channel)) {
            token.cancel();
            self.broker.unbind(topic, channel);
            tracing::info!(topic = %topic, channel = %channel, "Unsubscribed from in-process topic");
        }
        Ok(())
    }

    fn set_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler>) {
        self.dead_letters.set(handler);
    }

    fn is_subscribed(&self, topic: &str, channel: &str) -> bool {
        self.subscriptions.contains_key(&subscription_key(topic, channel))
    }

    async fn close(&self) -> Result<()> {
        self.root.cancel();
        let keys: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((key, token)) = self.subscriptions.remove(&key) {
                token.cancel();
                self.broker.state.queues.remove(&key);
            }
        }
        Ok(())
    }
}

async fn consume(
    mut receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    requeue: mpsc::UnboundedSender<Vec<u8>>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
) {
    loop {
        let raw = tokio::select! {
            _ = token.cancelled() => break,
            next = receiver.recv() => match next {
                Some(raw) => raw,
                None => break,
            },
        };

        let dispatcher = dispatcher.clone();
        let requeue = requeue.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(token.child_token(), &raw).await;
            if let Outcome::Retry {
                message_id, delay, ..
            } = outcome
            {
                tokio::select! {
                    _ = token.cancelled() => dispatcher.forget(&message_id),
                    _ = tokio::time::sleep(delay) => {
                        if requeue.send(raw).is_err() {
                            dispatcher.forget(&message_id);
                            tracing::warn!(
                                topic = %dispatcher.topic(),
                                channel = %dispatcher.channel(),
                                "Channel closed before redelivery"
                            );
                        }
                    }
                }
            }
        });
    }

    tracing::debug!(
        topic = %dispatcher.topic(),
        channel = %dispatcher.channel(),
        "In-process consumer stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqError;
    use crate::message::DeadLetterMessage;
    use crate::retry::LinearBackoff;
    use crate::transport::{dead_letter_handler_fn, message_handler_fn};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn transport(max_attempts: u32) -> Transport {
        let policy = Arc::new(LinearBackoff::new(
            Duration::from_millis(5),
            Duration::from_millis(50),
            max_attempts,
        ));
        MemoryBroker::new().transport(&MqConfig::memory(), policy)
    }

    fn recording() -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<Message>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = message_handler_fn(move |_cancel, message| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message);
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
    async fn test_publish_reaches_every_channel() {
        let transport = transport(3);
        let (first, first_seen) = recording();
        let (second, second_seen) = recording();
        transport.consumer.subscribe("orders", "billing", first).await.unwrap();
        transport.consumer.subscribe("orders", "shipping", second).await.unwrap();

        let mut headers = Headers::new();
        headers.insert("k".to_string(), "v".to_string());
        transport
            .producer
            .publish("orders", b"hello".to_vec(), headers)
            .await
            .unwrap();

        wait_for(|| first_seen.lock().unwrap().len() == 1 && second_seen.lock().unwrap().len() == 1)
            .await;
        let message = first_seen.lock().unwrap()[0].clone();
        assert_eq!(message.payload(), "hello");
        assert_eq!(message.header("k"), Some("v"));
        assert_eq!(message.topic(), "orders");
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_noop() {
        let transport = transport(3);
        let (first, first_seen) = recording();
        let (second, second_seen) = recording();
        transport.consumer.subscribe("orders", "billing", first).await.unwrap();
        transport.consumer.subscribe("orders", "billing", second).await.unwrap();

        transport
            .producer
            .publish("orders", b"x".to_vec(), Headers::new())
            .await
            .unwrap();

        wait_for(|| first_seen.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(second_seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_delay() {
        let transport = transport(3);
        let (handler, seen) = recording();
        transport.consumer.subscribe("orders", "billing", handler).await.unwrap();

        transport
            .producer
            .publish_delay("orders", b"later".to_vec(), Headers::new(), Duration::from_millis(40))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(seen.lock().unwrap().is_empty());
        wait_for(|| seen.lock().unwrap().len() == 1).await;
    }

    #[tokio::test]
    async fn test_retry_then_dead_letter() {
        let transport = transport(3);
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = message_handler_fn(move |_cancel, _message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MqError::handler("nope"))
            }
        });
        let dead: Arc<Mutex<Vec<DeadLetterMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = dead.clone();
        transport
            .consumer
            .set_dead_letter_handler(dead_letter_handler_fn(move |d| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(d);
                    Ok::<(), MqError>(())
                }
            }));
        transport.consumer.subscribe("orders", "billing", handler).await.unwrap();

        transport
            .producer
            .publish("orders", b"x".to_vec(), Headers::new())
            .await
            .unwrap();

        wait_for(|| dead.lock().unwrap().len() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let dead = dead.lock().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 3);
        assert_eq!(dead[0].original_topic, "orders");
        assert_eq!(dead[0].channel, "billing");
    }

    #[tokio::test]
    async fn test_unsubscribe_and_close() {
        let transport = transport(3);
        let (handler, _seen) = recording();
        transport.consumer.subscribe("orders", "billing", handler.clone()).await.unwrap();
        assert!(transport.consumer.is_subscribed("orders", "billing"));

        transport.consumer.unsubscribe("orders", "billing").await.unwrap();
        assert!(!transport.consumer.is_subscribed("orders", "billing"));
        // unknown key is a no-op
        transport.consumer.unsubscribe("orders", "billing").await.unwrap();

        transport.consumer.subscribe("orders", "billing", handler).await.unwrap();
        transport.consumer.close().await.unwrap();
        assert!(!transport.consumer.is_subscribed("orders", "billing"));
        // closing twice is harmless
        transport.consumer.close().await.unwrap();
        transport.connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_delivery() {
        let transport = transport(1);
        let started = Arc::new(AtomicU32::new(0));
        let released = Arc::new(AtomicU32::new(0));
        let (on_start, on_release) = (started.clone(), released.clone());
        let handler = message_handler_fn(move |cancel: CancellationToken, _message| {
            let on_start = on_start.clone();
            let on_release = on_release.clone();
            async move {
                on_start.fetch_add(1, Ordering::SeqCst);
                cancel.cancelled().await;
                on_release.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(MqError::Cancelled)
            }
        });
        let dead: Arc<Mutex<Vec<DeadLetterMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = dead.clone();
        transport
            .consumer
            .set_dead_letter_handler(dead_letter_handler_fn(move |d| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(d);
                    Ok::<(), MqError>(())
                }
            }));
        transport.consumer.subscribe("orders", "billing", handler).await.unwrap();
        transport
            .producer
            .publish("orders", b"slow".to_vec(), Headers::new())
            .await
            .unwrap();
        wait_for(|| started.load(Ordering::SeqCst) == 1).await;

        transport.consumer.close().await.unwrap();
        wait_for(|| released.load(Ordering::SeqCst) == 1).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(dead.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_discards_pending_delayed_publish() {
        let broker = MemoryBroker::new();
        let policy = Arc::new(LinearBackoff::new(Duration::ZERO, Duration::ZERO, 1));
        let consumer = MemoryConsumer::new(broker.clone(), policy);
        let producer = MemoryProducer::new(broker.clone());
        let (handler, seen) = recording();
        consumer.subscribe("orders", "billing", handler).await.unwrap();

        producer
            .publish_delay("orders", b"later".to_vec(), Headers::new(), Duration::from_millis(40))
            .await
            .unwrap();
        producer.close().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(consumer.is_subscribed("orders", "billing"));

        // the broker itself still routes
        MemoryProducer::new(broker)
            .publish("orders", b"now".to_vec(), Headers::new())
            .await
            .unwrap();
        wait_for(|| seen.lock().unwrap().len() == 1).await;
        assert_eq!(seen.lock().unwrap()[0].payload(), "now");
    }
}
