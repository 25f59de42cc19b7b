//! NSQ transport adapter speaking the nsqd TCP protocol

mod codec;
mod connection;
mod consumer;
mod producer;

pub use codec::{Command, Frame, MessageId, NsqCodec, NsqMessage};
pub use connection::NsqNode;
pub use consumer::NsqConsumer;
pub use producer::NsqProducer;

use crate::config::MqConfig;
use crate::error::Result;
use crate::retry::{ExponentialBackoff, RetryPolicy};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Connect to nsqd and assemble the transport parts
pub async fn connect(config: MqConfig, policy: Arc<dyn RetryPolicy>) -> Result<Transport> {
    let nsq = config.nsq;
    let timeout = nsq.connect_timeout();
    let node = Arc::new(NsqNode::new(nsq.nsqd_address.clone()));
    let producer = NsqProducer::connect(nsq.nsqd_address.clone(), timeout).await?;
    let reconnect = Arc::new(ExponentialBackoff::new(
        nsq.reconnect_delay(),
        MAX_RECONNECT_DELAY,
        nsq.max_reconnect_attempts,
    ));
    let consumer = NsqConsumer::new(
        nsq.nsqd_address.clone(),
        timeout,
        nsq.max_in_flight,
        policy,
        reconnect,
        node.token(),
    );

    tracing::info!(address = %node.address(), "Connected to NSQ");
    Ok(Transport {
        producer: Arc::new(producer),
        consumer: Arc::new(consumer),
        connection: node,
    })
}
