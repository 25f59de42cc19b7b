//! NATS subscriber implementation
//!
//! Each `topic:channel` key maps to one queue subscription (the channel is
//! the queue group). Every inbound message is handled on its own task.
//! Redelivery sleeps on that task for the policy delay and then republishes
//! the unchanged envelope to the topic, so ordering is not preserved and
//! other queue groups on the topic see the message again.

use crate::delivery::{DeadLetterSlot, Dispatcher, Outcome};
use crate::error::Result;
use crate::nats::NatsClient;
use crate::retry::RetryPolicy;
use crate::transport::{subscription_key, Consumer, DeadLetterHandler, MessageHandler};
use async_nats::Subscriber;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct ActiveSubscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// NATS queue-group subscriber implementing the Consumer port
pub struct NatsSubscriber {
    client: Arc<NatsClient>,
    policy: Arc<dyn RetryPolicy>,
    dead_letters: Arc<DeadLetterSlot>,
    subscriptions: DashMap<String, ActiveSubscription>,
    root: CancellationToken,
}

impl NatsSubscriber {
    pub fn new(client: Arc<NatsClient>, policy: Arc<dyn RetryPolicy>) -> Self {
        let root = client.token();
        Self {
            client,
            policy,
            dead_letters: Arc::new(DeadLetterSlot::default()),
            subscriptions: DashMap::new(),
            root,
        }
    }

    async fn stop(key: &str, active: ActiveSubscription) {
        active.token.cancel();
        if let Err(e) = active.task.await {
            tracing::error!(key = %key, error = %e, "NATS subscription task failed");
        }
    }
}

#[async_trait]
impl Consumer for NatsSubscriber {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let key = subscription_key(topic, channel);
        if self.subscriptions.contains_key(&key) {
            tracing::debug!(topic = %topic, channel = %channel, "Already subscribed");
            return Ok(());
        }

        let subscriber = self.client.queue_subscribe(topic, channel).await?;
        let dispatcher = Arc::new(Dispatcher::new(
            topic,
            channel,
            handler,
            self.policy.clone(),
            self.dead_letters.clone(),
        ));
        let token = self.root.child_token();
        let task = tokio::spawn(consume(
            subscriber,
            self.client.clone(),
            dispatcher,
            token.clone(),
        ));

        // a concurrent subscribe for the same key may have won while we awaited
        let active = ActiveSubscription { token, task };
        let loser = match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(_) => Some(active),
            Entry::Vacant(vacant) => {
                vacant.insert(active);
                None
            }
        };
        if let Some(loser) = loser {
            Self::stop(&key, loser).await;
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, channel: &str) -> Result<()> {
        let key = subscription_key(topic, channel);
        if let Some((key, active)) = self.subscriptions.remove(&key) {
            Self::stop(&key, active).await;
            tracing::info!(topic = %topic, channel = %channel, "Unsubscribed from NATS");
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
            if let Some((key, active)) = self.subscriptions.remove(&key) {
                Self::stop(&key, active).await;
            }
        }
        Ok(())
    }
}

async fn consume(
    mut subscriber: Subscriber,
    client: Arc<NatsClient>,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            next = subscriber.next() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let raw = message.payload.to_vec();
        let dispatcher = dispatcher.clone();
        let client = client.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(token.child_token(), &raw).await;
            if let Outcome::Retry {
                message_id, delay, ..
            } = outcome
            {
                tokio::select! {
                    _ = token.cancelled() => {
                        dispatcher.forget(&message_id);
                        tracing::warn!(
                            topic = %dispatcher.topic(),
                            channel = %dispatcher.channel(),
                            message_id = %message_id,
                            "Pending redelivery dropped on shutdown"
                        );
                    }
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = client.publish_raw(dispatcher.topic(), raw).await {
                            dispatcher.forget(&message_id);
                            tracing::error!(
                                topic = %dispatcher.topic(),
                                channel = %dispatcher.channel(),
                                message_id = %message_id,
                                error = %e,
                                "Republish for retry failed"
                            );
                        }
                    }
                }
            }
        });
    }

    if let Err(e) = subscriber.unsubscribe().await {
        tracing::warn!(
            topic = %dispatcher.topic(),
            channel = %dispatcher.channel(),
            error = %e,
            "Failed to unsubscribe from NATS"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NatsConfig;
    use crate::error::MqError;
    use crate::message::{DeadLetterMessage, Headers};
    use crate::nats::NatsPublisher;
    use crate::retry::LinearBackoff;
    use crate::transport::{dead_letter_handler_fn, message_handler_fn, Producer};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_retry_exhaustion_dead_letters_once() {
        let client = Arc::new(NatsClient::connect(NatsConfig::default()).await.unwrap());
        let policy = Arc::new(LinearBackoff::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
            3,
        ));
        let subscriber = NatsSubscriber::new(client.clone(), policy);
        let publisher = NatsPublisher::new(client);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let dead: Arc<Mutex<Vec<DeadLetterMessage>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = dead.clone();
        subscriber.set_dead_letter_handler(dead_letter_handler_fn(move |d| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(d);
                Ok::<(), MqError>(())
            }
        }));
        subscriber
            .subscribe(
                "test.nats.retry",
                "workers",
                message_handler_fn(move |_cancel, _message| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(MqError::handler("fail"))
                    }
                }),
            )
            .await
            .unwrap();

        publisher
            .publish("test.nats.retry", b"x".to_vec(), Headers::new())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(dead.lock().unwrap().len(), 1);
        assert_eq!(dead.lock().unwrap()[0].retry_count, 3);
        subscriber.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_subscribe_same_key_twice_is_noop() {
        let client = Arc::new(NatsClient::connect(NatsConfig::default()).await.unwrap());
        let policy = Arc::new(LinearBackoff::new(Duration::ZERO, Duration::ZERO, 1));
        let subscriber = NatsSubscriber::new(client, policy);
        let handler = message_handler_fn(|_cancel, _message| async { Ok::<(), MqError>(()) });

        subscriber.subscribe("test.twice", "c", handler.clone()).await.unwrap();
        subscriber.subscribe("test.twice", "c", handler).await.unwrap();
        assert_eq!(subscriber.subscriptions.len(), 1);

        subscriber.unsubscribe("test.twice", "c").await.unwrap();
        assert!(!subscriber.is_subscribed("test.twice", "c"));
    }
}
