//! NATS client wrapper
//!
//! Owns the connection shared by [`super::NatsPublisher`] and
//! [`super::NatsSubscriber`] and the root cancellation token every delivery
//! and pending timer derives from.

use crate::config::NatsConfig;
use crate::error::{MqError, Result};
use crate::transport::Connection;
use async_nats::{Client, ConnectOptions, Subscriber};
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Core NATS client wrapper
pub struct NatsClient {
    client: Client,
    config: NatsConfig,
    root: CancellationToken,
}

impl NatsClient {
    /// Connect to the NATS server described by `config`
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs))
            .max_reconnects(Some(config.max_reconnect_attempts as usize));
        if let Some(name) = &config.name {
            options = options.name(name.clone());
        }

        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| MqError::Connection(e.to_string()))?;

        tracing::info!(url = %config.url, "Connected to NATS server");

        Ok(Self {
            client,
            config,
            root: CancellationToken::new(),
        })
    }

    /// Publish raw bytes and flush, so the call returns once the server has them
    pub async fn publish_raw(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        tracing::debug!(
            subject = %subject,
            payload_size = payload.len(),
            "Publishing message to NATS"
        );

        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| MqError::Publish(format!("Failed to publish: {}", e)))?;

        self.client
            .flush()
            .await
            .map_err(|e| MqError::Publish(format!("Failed to flush: {}", e)))?;

        Ok(())
    }

    /// Join the queue group `group` on `subject`
    pub async fn queue_subscribe(&self, subject: &str, group: &str) -> Result<Subscriber> {
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), group.to_string())
            .await
            .map_err(|e| {
                MqError::Subscribe(format!("Failed to subscribe to '{}': {}", subject, e))
            })?;

        tracing::info!(subject = %subject, queue_group = %group, "Queue subscription created");

        Ok(subscriber)
    }

    /// Token cancelled when the connection closes
    pub fn token(&self) -> CancellationToken {
        self.root.child_token()
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

#[async_trait]
impl Connection for NatsClient {
    async fn close(&self) -> Result<()> {
        if self.root.is_cancelled() {
            return Ok(());
        }
        self.root.cancel();

        self.client
            .flush()
            .await
            .map_err(|e| MqError::Connection(format!("Failed to flush on close: {}", e)))?;

        tracing::info!(url = %self.config.url, "NATS connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_connect() {
        let client = NatsClient::connect(NatsConfig::default()).await;
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_connect_unreachable_server() {
        let config = NatsConfig {
            url: "nats://127.0.0.1:1".to_string(),
            connection_timeout_secs: 1,
            ..NatsConfig::default()
        };
        let result = NatsClient::connect(config).await;
        assert!(matches!(result, Err(MqError::Connection(_))));
    }

    #[tokio::test]
    #[ignore = "requires NATS server"]
    async fn test_publish_and_close() {
        let client = NatsClient::connect(NatsConfig::default()).await.unwrap();
        client.publish_raw("test.raw", b"hello".to_vec()).await.unwrap();
        client.close().await.unwrap();
        // second close is a no-op
        client.close().await.unwrap();
    }
}
