//! NATS transport adapter

mod client;
mod publisher;
mod subscriber;

pub use client::NatsClient;
pub use publisher::NatsPublisher;
pub use subscriber::NatsSubscriber;

use crate::config::MqConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::transport::Transport;
use std::sync::Arc;

/// Connect to NATS and assemble the transport parts
pub async fn connect(config: MqConfig, policy: Arc<dyn RetryPolicy>) -> Result<Transport> {
    let client = Arc::new(NatsClient::connect(config.nats).await?);
    Ok(Transport {
        producer: Arc::new(NatsPublisher::new(client.clone())),
        consumer: Arc::new(NatsSubscriber::new(client.clone(), policy)),
        connection: client,
    })
}
