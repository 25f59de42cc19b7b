//! Two-tier idempotency guard
//!
//! The ledger is the source of truth, unique on `(topic, channel,
//! message_id)`. The cache only short-circuits ledger lookups and is
//! refilled from the ledger on a miss.

use crate::context::Context;
use crate::error::{MqError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// How long a processed marker stays cached
pub const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

const DEFAULT_CACHE_CAPACITY: u64 = 100_000;

/// Cache key for a processed message on a channel
pub fn cache_key(topic: &str, channel: &str, message_id: &str) -> String {
    format!("message:topic:{}:group:{}:msgid:{}", topic, channel, message_id)
}

#[async_trait]
pub trait IdempotencyCache: Send + Sync {
    async fn contains(&self, key: &str) -> Result<bool>;

    /// Mark `key` as processed for the cache's TTL
    async fn mark(&self, key: &str) -> Result<()>;
}

/// Processed-message marker cache backed by moka
pub struct MokaIdempotencyCache {
    cache: Cache<String, ()>,
}

impl MokaIdempotencyCache {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_CACHE_CAPACITY, CACHE_TTL)
    }

    pub fn with_ttl(max_capacity: u64, ttl: Duration) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
        }
    }
}

impl Default for MokaIdempotencyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyCache for MokaIdempotencyCache {
    async fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.cache.get(key).await.is_some())
    }

    async fn mark(&self, key: &str) -> Result<()> {
        self.cache.insert(key.to_string(), ()).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Processed,
}

/// Ledger row for a processed message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub topic: String,
    pub channel: String,
    pub message_id: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn processed(topic: &str, channel: &str, message_id: &str) -> Self {
        Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            message_id: message_id.to_string(),
            status: RecordStatus::Processed,
            created_at: Utc::now(),
        }
    }
}

/// Durable store of processed messages
///
/// Implementations must reject a second record for the same
/// `(topic, channel, message_id)` with [`MqError::Storage`].
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn find(
        &self,
        topic: &str,
        channel: &str,
        message_id: &str,
    ) -> Result<Option<IdempotencyRecord>>;

    async fn insert(&self, record: IdempotencyRecord) -> Result<()>;
}

/// Process-local ledger
#[derive(Default)]
pub struct InMemoryLedger {
    records: DashMap<(String, String, String), IdempotencyRecord>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryLedger {
    async fn find(
        &self,
        topic: &str,
        channel: &str,
        message_id: &str,
    ) -> Result<Option<IdempotencyRecord>> {
        let key = (
            topic.to_string(),
            channel.to_string(),
            message_id.to_string(),
        );
        Ok(self.records.get(&key).map(|r| r.clone()))
    }

    async fn insert(&self, record: IdempotencyRecord) -> Result<()> {
        let key = (
            record.topic.clone(),
            record.channel.clone(),
            record.message_id.clone(),
        );
        match self.records.entry(key) {
            Entry::Occupied(_) => Err(MqError::Storage(format!(
                "duplicate idempotency record for {}",
                cache_key(&record.topic, &record.channel, &record.message_id)
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                Ok(())
            }
        }
    }
}

/// Exactly-once effect on top of at-least-once delivery
pub struct Idempotency {
    cache: Arc<dyn IdempotencyCache>,
    ledger: Arc<dyn IdempotencyLedger>,
}

impl Idempotency {
    pub fn new(cache: Arc<dyn IdempotencyCache>, ledger: Arc<dyn IdempotencyLedger>) -> Self {
        Self { cache, ledger }
    }

    /// Moka cache over an in-memory ledger
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MokaIdempotencyCache::new()),
            Arc::new(InMemoryLedger::new()),
        )
    }

    /// Whether the message was already processed on this channel
    pub async fn check(
        &self,
        ctx: &Context,
        topic: &str,
        channel: &str,
        message_id: &str,
    ) -> Result<bool> {
        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        let key = cache_key(topic, channel, message_id);
        if self.cache.contains(&key).await? {
            return Ok(true);
        }

        match self.ledger.find(topic, channel, message_id).await? {
            Some(_) => {
                self.cache.mark(&key).await?;
                tracing::debug!(key = %key, "Idempotency cache refilled from ledger");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Record a successful processing; ledger first, then cache
    pub async fn mark_processed(
        &self,
        ctx: &Context,
        topic: &str,
        channel: &str,
        message_id: &str,
    ) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        self.ledger
            .insert(IdempotencyRecord::processed(topic, channel, message_id))
            .await?;
        self.cache
            .mark(&cache_key(topic, channel, message_id))
            .await
    }
}
