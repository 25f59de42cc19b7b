//! Wire envelope carried by every transport
//!
//! A [`Message`] is JSON-encoded as
//! `{id, topic, payload: string, timestamp: i64 ns, headers: map}`.
//! The payload travels as a JSON string, so it must be valid UTF-8;
//! binary data has to be encoded (e.g. base64) by the caller.

use crate::error::{MqError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Message headers
pub type Headers = HashMap<String, String>;

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    topic: String,
    payload: String,
    timestamp: i64,
    #[serde(default)]
    headers: Headers,
}

impl Message {
    /// Wrap a payload into a new envelope with a fresh id
    ///
    /// Fails with [`MqError::InvalidPayload`] when the payload is not UTF-8.
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, headers: Headers) -> Result<Self> {
        let payload = String::from_utf8(payload)
            .map_err(|e| MqError::InvalidPayload(format!("payload is not UTF-8: {}", e)))?;
        Ok(Self::from_text(topic, payload, headers))
    }

    /// Wrap a text payload into a new envelope with a fresh id
    pub fn from_text(topic: impl Into<String>, payload: impl Into<String>, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload: payload.into(),
            timestamp: now_nanos(),
            headers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_bytes()
    }

    /// Creation time in nanoseconds since the Unix epoch
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// JSON-encode the envelope for the wire
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope received from the wire
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A message that exhausted its retry budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    /// Id of the failed envelope (empty when the envelope could not be decoded)
    pub message_id: String,
    pub original_topic: String,
    pub channel: String,
    pub payload: String,
    #[serde(default)]
    pub headers: Headers,
    pub error: String,
    pub retry_count: u32,
    /// Original message timestamp (ns)
    pub timestamp: i64,
    pub dead_time: DateTime<Utc>,
}

impl DeadLetterMessage {
    /// Build a dead letter for a message whose handler kept failing
    pub fn from_failure(
        message: &Message,
        channel: &str,
        error: impl Into<String>,
        retry_count: u32,
    ) -> Self {
        Self {
            message_id: message.id.clone(),
            original_topic: message.topic.clone(),
            channel: channel.to_string(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            error: error.into(),
            retry_count,
            timestamp: message.timestamp,
            dead_time: Utc::now(),
        }
    }

    /// Build a dead letter for bytes that never decoded into an envelope
    pub fn undecodable(topic: &str, channel: &str, raw: &[u8], error: impl Into<String>) -> Self {
        Self {
            message_id: String::new(),
            original_topic: topic.to_string(),
            channel: channel.to_string(),
            payload: String::from_utf8_lossy(raw).into_owned(),
            headers: Headers::new(),
            error: error.into(),
            retry_count: 0,
            timestamp: now_nanos(),
            dead_time: Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

pub(crate) fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
