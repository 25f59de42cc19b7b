//! NSQ producer implementation
//!
//! A single lazily (re)connected nsqd connection is shared by all publishes.
//! Delayed publishing uses `DPUB`, so the broker holds the message.

use crate::error::{MqError, Result};
use crate::message::{Headers, Message};
use crate::nsq::codec::{validate_name, Command};
use crate::nsq::connection::{open, request_ok, NsqFramed};
use crate::transport::Producer;
use async_trait::async_trait;
use bytes::Bytes;
use futures::SinkExt;
use std::time::Duration;
use tokio::sync::Mutex;

/// NSQ producer implementing the Producer port
pub struct NsqProducer {
    address: String,
    connect_timeout: Duration,
    conn: Mutex<Option<NsqFramed>>,
}

impl NsqProducer {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
            conn: Mutex::new(None),
        }
    }

    /// Establish the connection up front instead of on first publish
    pub async fn connect(address: impl Into<String>, connect_timeout: Duration) -> Result<Self> {
        let producer = Self::new(address, connect_timeout);
        {
            let mut conn = producer.conn.lock().await;
            *conn = Some(open(&producer.address, connect_timeout).await?);
        }
        Ok(producer)
    }

    async fn send(&self, command: Command) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(open(&self.address, self.connect_timeout).await?);
        }
        let framed = conn
            .as_mut()
            .ok_or_else(|| MqError::Connection("nsqd connection unavailable".to_string()))?;

        match request_ok(framed, command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // nsqd drops the connection after a failed publish
                *conn = None;
                Err(MqError::Publish(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl Producer for NsqProducer {
    async fn publish(&self, topic: &str, payload: Vec<u8>, headers: Headers) -> Result<()> {
        validate_name(topic)?;
        let message = Message::new(topic, payload, headers)?;
        self.send(Command::Pub {
            topic: topic.to_string(),
            body: Bytes::from(message.encode()?),
        })
        .await?;

        tracing::debug!(
            message_id = %message.id(),
            topic = %topic,
            "Message published to NSQ"
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
        validate_name(topic)?;
        let message = Message::new(topic, payload, headers)?;
        self.send(Command::Dpub {
            topic: topic.to_string(),
            defer_ms: delay.as_millis() as u64,
            body: Bytes::from(message.encode()?),
        })
        .await?;

        tracing::debug!(
            message_id = %message.id(),
            topic = %topic,
            delay_ms = delay.as_millis() as u64,
            "Deferred message published to NSQ"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut conn = self.conn.lock().await;
        if let Some(mut framed) = conn.take() {
            framed.close().await?;
            tracing::debug!(address = %self.address, "NSQ producer connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_topic_rejected_before_connecting() {
        let producer = NsqProducer::new("127.0.0.1:1", Duration::from_millis(100));
        let result = producer
            .publish("bad topic", b"x".to_vec(), Headers::new())
            .await;
        assert!(matches!(result, Err(MqError::Config(_))));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let producer = NsqProducer::new("127.0.0.1:1", Duration::from_millis(100));
        producer.close().await.unwrap();
        producer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_nsqd_fails_connect() {
        let result = NsqProducer::connect("127.0.0.1:1", Duration::from_millis(500)).await;
        assert!(matches!(result, Err(MqError::Connection(_))));
    }

    #[tokio::test]
    #[ignore = "requires nsqd"]
    async fn test_publish_and_deferred_publish() {
        let producer = NsqProducer::connect("127.0.0.1:4150", Duration::from_secs(5))
            .await
            .unwrap();
        producer
            .publish("test_producer", b"now".to_vec(), Headers::new())
            .await
            .unwrap();
        producer
            .publish_delay(
                "test_producer",
                b"later".to_vec(),
                Headers::new(),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        producer.close().await.unwrap();
    }
}
