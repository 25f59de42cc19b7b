//! nsqd TCP connection handling

use crate::error::{MqError, Result};
use crate::nsq::codec::{Command, Frame, NsqCodec, MAGIC_V2};
use crate::transport::Connection;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub type NsqFramed = Framed<TcpStream, NsqCodec>;

/// Open a V2 protocol connection to nsqd
pub async fn open(address: &str, timeout: Duration) -> Result<NsqFramed> {
    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| MqError::Connection(format!("timed out connecting to nsqd at {}", address)))?
        .map_err(|e| MqError::Connection(format!("nsqd at {}: {}", address, e)))?;

    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;

    tracing::debug!(address = %address, "Connected to nsqd");
    Ok(Framed::new(stream, NsqCodec))
}

/// Send a command and wait for its response, answering heartbeats meanwhile
pub async fn request(framed: &mut NsqFramed, command: Command) -> Result<Bytes> {
    framed.send(command).await?;
    loop {
        match framed.next().await {
            None => return Err(MqError::Connection("connection closed by nsqd".to_string())),
            Some(Err(e)) => return Err(e),
            Some(Ok(frame)) if frame.is_heartbeat() => framed.send(Command::Nop).await?,
            Some(Ok(Frame::Response(body))) => return Ok(body),
            Some(Ok(Frame::Error(body))) => {
                return Err(MqError::Protocol(String::from_utf8_lossy(&body).into_owned()))
            }
            Some(Ok(Frame::Message(message))) => {
                return Err(MqError::Protocol(format!(
                    "unexpected message {} while awaiting a response",
                    message.id_str()
                )))
            }
        }
    }
}

/// Send a command that nsqd acknowledges with `OK`
pub async fn request_ok(framed: &mut NsqFramed, command: Command) -> Result<()> {
    let body = request(framed, command).await?;
    if body.as_ref() == b"OK" {
        Ok(())
    } else {
        Err(MqError::Protocol(format!(
            "expected OK, got '{}'",
            String::from_utf8_lossy(&body)
        )))
    }
}

/// Lifetime owner of an NSQ transport
///
/// nsqd connections belong to the producer and to each subscription; this
/// handle only carries the root token they are all derived from.
pub struct NsqNode {
    address: String,
    root: CancellationToken,
}

impl NsqNode {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            root: CancellationToken::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Child token for a producer or consumer bound to this node
    pub fn token(&self) -> CancellationToken {
        self.root.child_token()
    }
}

#[async_trait]
impl Connection for NsqNode {
    async fn close(&self) -> Result<()> {
        if !self.root.is_cancelled() {
            self.root.cancel();
            tracing::info!(address = %self.address, "NSQ transport closed");
        }
        Ok(())
    }
}
