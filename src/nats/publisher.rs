//! NATS publisher implementation
//!
//! Implements the [`Producer`] port on core NATS. Delayed publishing is an
//! in-process timer: the message only exists in this process until the
//! timer fires, so it is lost if the process stops first.

use crate::error::Result;
use crate::message::{Headers, Message};
use crate::nats::NatsClient;
use crate::transport::Producer;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// NATS publisher implementing the Producer port
pub struct NatsPublisher {
    client: Arc<NatsClient>,
    timers: CancellationToken,
}

impl NatsPublisher {
    pub fn new(client: Arc<NatsClient>) -> Self {
        let timers = client.token();
        Self { client, timers }
    }
}

#[async_trait]
impl Producer for NatsPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        let message = Message::new(topic, payload, headers)?;
        self.client.publish_raw(topic, message.encode()?).await?;

        tracing::debug!(
            message_id = %message.id(),
            topic = %topic,
            "Message published to NATS"
        );
        Ok(())
    }

    async fn publish_delay(
        &self,
        topic: &str,
        payload: Vec<u8>,
        headers: Headers,
        delay: Duration,
    ) -> Result<()> {
        let message = Message::new(topic, payload, headers)?;
        let raw = message.encode()?;
        let client = self.client.clone();
        let timers = self.timers.clone();
        let topic = topic.to_string();
        let message_id = message.id().to_string();

        tracing::debug!(
            message_id = %message_id,
            topic = %topic,
            delay_ms = delay.as_millis() as u64,
            "Scheduling in-process delayed publish"
        );

        tokio::spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {
                    tracing::warn!(
                        message_id = %message_id,
                        topic = %topic,
                        "Delayed publish discarded on shutdown"
                    );
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = client.publish_raw(&topic, raw).await {
                        tracing::error!(
                            message_id = %message_id,
                            topic = %topic,
                            error = %e,
                            "Delayed publish failed"
                        );
                    }
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.timers.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NatsConfig;
    use futures::StreamExt;

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_publish_wraps_envelope() {
        let client = Arc::new(NatsClient::connect(NatsConfig::default()).await.unwrap());
        let mut raw = client.queue_subscribe("test.publisher", "listener").await.unwrap();
        let publisher = NatsPublisher::new(client);

        publisher
            .publish("test.publisher", b"payload".to_vec(), Headers::new())
            .await
            .unwrap();

        let received = raw.next().await.unwrap();
        let message = Message::decode(&received.payload).unwrap();
        assert_eq!(message.topic(), "test.publisher");
        assert_eq!(message.payload(), "payload");
    }

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_publish_rejects_binary_payload() {
        let client = Arc::new(NatsClient::connect(NatsConfig::default()).await.unwrap());
        let publisher = NatsPublisher::new(client);
        let result = publisher
            .publish("test.publisher", vec![0xc3, 0x28], Headers::new())
            .await;
        assert!(result.is_err());
    }
}
