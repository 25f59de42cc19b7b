//! nsqd TCP protocol (V2) framing
//!
//! Server frames: `[size: u32][frame type: i32][data]`, where `size` counts
//! the type and the data. Message frames carry
//! `[timestamp: i64][attempts: u16][id: 16 bytes][body]`.
//! Client commands are newline-terminated; `PUB`/`DPUB` append a
//! size-prefixed body.

use crate::error::{MqError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol magic sent once right after connecting
pub const MAGIC_V2: &[u8] = b"  V2";

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

const HEARTBEAT: &[u8] = b"_heartbeat_";
const OK: &[u8] = b"OK";

/// Timestamp + attempts + id
const MESSAGE_HEADER_LEN: usize = 8 + 2 + 16;
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
const MAX_NAME_LEN: usize = 64;

/// nsqd message id (16 ASCII bytes)
pub type MessageId = [u8; 16];

/// A message frame as delivered by nsqd
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsqMessage {
    pub timestamp: i64,
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl NsqMessage {
    pub fn id_str(&self) -> String {
        String::from_utf8_lossy(&self.id).into_owned()
    }
}

/// Frame received from nsqd
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(NsqMessage),
}

impl Frame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_ref() == HEARTBEAT)
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Response(body) if body.as_ref() == OK)
    }
}

/// Command sent to nsqd
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    Req { id: MessageId, timeout_ms: u64 },
    Touch(MessageId),
    Nop,
    Cls,
    Pub { topic: String, body: Bytes },
    Dpub { topic: String, defer_ms: u64, body: Bytes },
}

/// Check a topic or channel name against nsqd's naming rules
pub fn validate_name(name: &str) -> Result<()> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= MAX_NAME_LEN
        && base
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(MqError::Config(format!("invalid NSQ topic/channel name '{}'", name)))
    }
}

/// Codec for the nsqd V2 protocol
#[derive(Debug, Default, Clone, Copy)]
pub struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = MqError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if size < 4 {
            return Err(MqError::Protocol(format!("frame size {} too small", size)));
        }
        if size > MAX_FRAME_SIZE {
            return Err(MqError::Protocol(format!("frame size {} exceeds limit", size)));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_i32();
        let mut data = src.split_to(size - 4).freeze();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => {
                if data.len() < MESSAGE_HEADER_LEN {
                    return Err(MqError::Protocol(format!(
                        "message frame of {} bytes is shorter than its header",
                        data.len()
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let mut id = [0u8; 16];
                data.copy_to_slice(&mut id);
                Ok(Some(Frame::Message(NsqMessage {
                    timestamp,
                    attempts,
                    id,
                    body: data,
                })))
            }
            other => Err(MqError::Protocol(format!("unknown frame type {}", other))),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = MqError;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        match command {
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {} {}\n", topic, channel).as_bytes());
            }
            Command::Rdy(count) => dst.put_slice(format!("RDY {}\n", count).as_bytes()),
            Command::Fin(id) => put_with_id(dst, b"FIN ", &id, b"\n"),
            Command::Req { id, timeout_ms } => {
                put_with_id(dst, b"REQ ", &id, format!(" {}\n", timeout_ms).as_bytes());
            }
            Command::Touch(id) => put_with_id(dst, b"TOUCH ", &id, b"\n"),
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
            Command::Pub { topic, body } => {
                dst.put_slice(format!("PUB {}\n", topic).as_bytes());
                put_body(dst, &body)?;
            }
            Command::Dpub {
                topic,
                defer_ms,
                body,
            } => {
                dst.put_slice(format!("DPUB {} {}\n", topic, defer_ms).as_bytes());
                put_body(dst, &body)?;
            }
        }
        Ok(())
    }
}

fn put_with_id(dst: &mut BytesMut, verb: &[u8], id: &MessageId, tail: &[u8]) {
    dst.reserve(verb.len() + id.len() + tail.len());
    dst.put_slice(verb);
    dst.put_slice(id);
    dst.put_slice(tail);
}

fn put_body(dst: &mut BytesMut, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len())
        .map_err(|_| MqError::InvalidPayload("message body too large".to_string()))?;
    dst.reserve(4 + body.len());
    dst.put_u32(len);
    dst.put_slice(body);
    Ok(())
}
