//! Subscription store collaborator
//!
//! Persisted enable/disable state, per-subscription parameters and the
//! dead-letter archive used by the manager.

use crate::error::Result;
use crate::event::DeadLetterEvent;
use crate::transport::subscription_key;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Free-form per-subscription settings handed to handlers
pub type Parameters = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    Enabled,
    Disabled,
}

/// Persisted state of one `topic:channel` subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub topic: String,
    pub channel: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub parameters: Parameters,
}

impl SubscriptionRecord {
    pub fn new(topic: impl Into<String>, channel: impl Into<String>, status: SubscriptionStatus) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            status,
            parameters: Parameters::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn key(&self) -> String {
        subscription_key(&self.topic, &self.channel)
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_status(&self, status: SubscriptionStatus) -> Result<Vec<SubscriptionRecord>>;

    /// Parameters for a subscription; empty when none are stored
    async fn get_parameters(&self, topic: &str, channel: &str) -> Result<Parameters>;

    async fn save_dead_letter(&self, dead: &DeadLetterEvent) -> Result<()>;
}

/// Process-local subscription store
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: DashMap<String, SubscriptionRecord>,
    dead_letters: Mutex<Vec<DeadLetterEvent>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: SubscriptionRecord) {
        self.records.insert(record.key(), record);
    }

    pub fn dead_letters(&self) -> Vec<DeadLetterEvent> {
        self.dead_letters
            .lock()
            .map(|dead| dead.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_by_status(&self, status: SubscriptionStatus) -> Result<Vec<SubscriptionRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.value().clone())
            .collect())
    }

    async fn get_parameters(&self, topic: &str, channel: &str) -> Result<Parameters> {
        Ok(self
            .records
            .get(&subscription_key(topic, channel))
            .map(|r| r.parameters.clone())
            .unwrap_or_default())
    }

    async fn save_dead_letter(&self, dead: &DeadLetterEvent) -> Result<()> {
        if let Ok(mut archive) = self.dead_letters.lock() {
            archive.push(dead.clone());
        }
        Ok(())
    }
}
