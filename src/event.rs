//! Typed event envelope
//!
//! An [`Event`] travels as a regular [`Message`]: the payload is the JSON
//! encoding of `data`, identity and tenant ride in reserved headers and
//! every other header is user metadata. Dead letters are rebuilt through the
//! same path, so a [`DeadLetterEvent`] carries exactly what the original
//! subscriber would have seen.

use crate::error::Result;
use crate::message::{DeadLetterMessage, Headers, Message};
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const HEADER_EVENT_ID: &str = "event_id";
pub const HEADER_EVENT_TYPE: &str = "event_type";
pub const HEADER_TIMESTAMP: &str = "timestamp";
pub const HEADER_TENANT_ID: &str = "tenant_id";

const RESERVED_HEADERS: [&str; 4] = [
    HEADER_EVENT_ID,
    HEADER_EVENT_TYPE,
    HEADER_TIMESTAMP,
    HEADER_TENANT_ID,
];

/// Application event; `event_type` doubles as the topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Headers,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

impl Event {
    /// Create an event from any serializable payload
    pub fn new(event_type: impl Into<String>, data: impl Serialize) -> Result<Self> {
        Ok(Self::from_value(event_type, serde_json::to_value(data)?))
    }

    pub fn from_value(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
            metadata: Headers::new(),
            tenant_id: None,
        }
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.insert(key.into(), value.into());
    }

    pub fn set_tenant_id(&mut self, tenant_id: impl Into<String>) {
        self.tenant_id = Some(tenant_id.into());
    }

    /// Decode `data` into a concrete type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Wire headers for this event; metadata overrides reserved keys
    pub fn to_headers(&self, tenant_id: Option<&str>) -> Headers {
        let mut headers = Headers::with_capacity(self.metadata.len() + RESERVED_HEADERS.len());
        headers.insert(HEADER_EVENT_ID.to_string(), self.id.clone());
        headers.insert(HEADER_EVENT_TYPE.to_string(), self.event_type.clone());
        headers.insert(HEADER_TIMESTAMP.to_string(), self.timestamp.to_rfc3339());
        if let Some(tenant_id) = tenant_id {
            headers.insert(HEADER_TENANT_ID.to_string(), tenant_id.to_string());
        }
        headers.extend(self.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        headers
    }

    pub fn encode_data(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.data)?)
    }

    /// Rebuild an event from a delivered message
    pub fn from_message(message: &Message) -> Self {
        Self::from_parts(
            message.topic(),
            message.id(),
            message.payload(),
            message.headers(),
            message.timestamp(),
        )
    }

    fn from_parts(
        topic: &str,
        fallback_id: &str,
        payload: &str,
        headers: &Headers,
        fallback_nanos: i64,
    ) -> Self {
        // plain-text payloads published outside the event bus stay as strings
        let data = serde_json::from_str(payload)
            .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));

        let header = |key: &str| headers.get(key).filter(|v| !v.is_empty());
        let timestamp = header(HEADER_TIMESTAMP)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.timestamp_nanos(fallback_nanos));

        let metadata = headers
            .iter()
            .filter(|(k, _)| !RESERVED_HEADERS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            id: header(HEADER_EVENT_ID)
                .cloned()
                .unwrap_or_else(|| fallback_id.to_string()),
            event_type: header(HEADER_EVENT_TYPE)
                .cloned()
                .unwrap_or_else(|| topic.to_string()),
            data,
            timestamp,
            metadata,
            tenant_id: header(HEADER_TENANT_ID).cloned(),
        }
    }
}

/// Event that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub id: String,
    pub original_topic: String,
    pub channel: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: Headers,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub error: String,
    pub retry_count: u32,
    /// When the original message was published
    pub timestamp: DateTime<Utc>,
    pub dead_time: DateTime<Utc>,
}

impl DeadLetterEvent {
    pub fn from_dead_letter_message(dead: &DeadLetterMessage) -> Self {
        let event = Event::from_parts(
            &dead.original_topic,
            &dead.message_id,
            &dead.payload,
            &dead.headers,
            dead.timestamp,
        );
        Self {
            id: event.id,
            original_topic: dead.original_topic.clone(),
            channel: dead.channel.clone(),
            data: event.data,
            metadata: event.metadata,
            tenant_id: event.tenant_id,
            error: dead.error.clone(),
            retry_count: dead.retry_count,
            timestamp: event.timestamp,
            dead_time: dead.dead_time,
        }
    }

    /// The event as its subscriber originally received it
    pub fn to_event(&self) -> Event {
        Event {
            id: self.id.clone(),
            event_type: self.original_topic.clone(),
            data: self.data.clone(),
            timestamp: self.timestamp,
            metadata: self.metadata.clone(),
            tenant_id: self.tenant_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: u64,
        amount: f64,
    }

    #[test]
    fn test_new_and_data_as() {
        let event = Event::new(
            "order.placed",
            OrderPlaced {
                order_id: 7,
                amount: 12.5,
            },
        )
        .unwrap();

        assert_eq!(event.event_type, "order.placed");
        assert!(event.tenant_id.is_none());
        let order: OrderPlaced = event.data_as().unwrap();
        assert_eq!(order.order_id, 7);
        assert!(event.data_as::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_headers_carry_identity_and_metadata() {
        let mut event = Event::from_value("order.placed", json!({"n": 1}));
        event.set_metadata("trace", "abc");

        let headers = event.to_headers(Some("tenant-a"));
        assert_eq!(headers[HEADER_EVENT_ID], event.id);
        assert_eq!(headers[HEADER_EVENT_TYPE], "order.placed");
        assert_eq!(headers[HEADER_TENANT_ID], "tenant-a");
        assert_eq!(headers["trace"], "abc");

        assert!(!event.to_headers(None).contains_key(HEADER_TENANT_ID));
    }

    #[test]
    fn test_metadata_wins_over_reserved_headers() {
        let mut event = Event::from_value("order.placed", json!({}));
        event.set_metadata(HEADER_EVENT_ID, "x");

        let headers = event.to_headers(None);
        assert_eq!(headers[HEADER_EVENT_ID], "x");

        let message = Message::from_text("order.placed", "{}", headers);
        assert_eq!(Event::from_message(&message).id, "x");
    }

    #[test]
    fn test_from_message_rebuilds_event() {
        let mut event = Event::from_value("order.placed", json!({"order_id": 9}));
        event.set_tenant_id("t1");
        event.set_metadata("source", "checkout");

        let message = Message::from_text(
            "order.placed",
            String::from_utf8(event.encode_data().unwrap()).unwrap(),
            event.to_headers(event.tenant_id.as_deref()),
        );
        let rebuilt = Event::from_message(&message);

        assert_eq!(rebuilt.id, event.id);
        assert_eq!(rebuilt.event_type, "order.placed");
        assert_eq!(rebuilt.data, json!({"order_id": 9}));
        assert_eq!(rebuilt.tenant_id.as_deref(), Some("t1"));
        assert_eq!(rebuilt.metadata.len(), 1);
        assert_eq!(rebuilt.metadata["source"], "checkout");
        assert_eq!(rebuilt.timestamp.timestamp(), event.timestamp.timestamp());
    }

    #[test]
    fn test_from_message_without_headers_falls_back() {
        let message = Message::from_text("raw.topic", "not json", Headers::new());
        let event = Event::from_message(&message);

        assert_eq!(event.id, message.id());
        assert_eq!(event.event_type, "raw.topic");
        assert_eq!(event.data, json!("not json"));
        assert_eq!(event.timestamp.timestamp_nanos_opt(), Some(message.timestamp()));
        assert!(event.metadata.is_empty());
    }

    #[test]
    fn test_dead_letter_event_matches_original() {
        let mut event = Event::from_value("order.placed", json!({"order_id": 3}));
        event.set_metadata("source", "checkout");
        let message = Message::from_text(
            "order.placed",
            "{\"order_id\":3}",
            event.to_headers(Some("t9")),
        );
        let dead = DeadLetterMessage::from_failure(&message, "billing", "boom", 3);

        let dead_event = DeadLetterEvent::from_dead_letter_message(&dead);
        assert_eq!(dead_event.channel, "billing");
        assert_eq!(dead_event.retry_count, 3);
        assert_eq!(dead_event.error, "boom");

        let replayed = dead_event.to_event();
        assert_eq!(replayed, Event::from_message(&message));
        assert_eq!(replayed.tenant_id.as_deref(), Some("t9"));
    }
}
