//! Delivery subsystem configuration
//!
//! Parsed once at startup, either deserialized from a config document or
//! built from environment variables with [`MqConfig::from_env`].

use crate::error::{MqError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default topic broker dead letters are republished onto
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "dead_letter";

/// Broker backing the unified server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Nats,
    Nsq,
    /// Process-local broker, used for tests and single-process deployments
    Memory,
}

impl BrokerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerKind::Nats => "nats",
            BrokerKind::Nsq => "nsq",
            BrokerKind::Memory => "memory",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nats" => Ok(BrokerKind::Nats),
            "nsq" => Ok(BrokerKind::Nsq),
            "memory" => Ok(BrokerKind::Memory),
            other => Err(MqError::UnsupportedBroker(other.to_string())),
        }
    }
}

/// Backoff shape applied between redeliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

impl FromStr for RetryStrategy {
    type Err = MqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(MqError::Config(format!("unknown retry strategy '{}'", other))),
        }
    }
}

/// Retry policy settings shared by every transport
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,

    /// Delay unit in milliseconds (linear step, exponential base)
    pub base_delay_ms: u64,

    /// Upper bound for a single delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// NATS connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://localhost:4222")
    pub url: String,

    /// Client connection name reported to the server
    pub name: Option<String>,

    /// Max reconnect attempts
    pub max_reconnect_attempts: u32,

    /// Connection timeout in seconds
    pub connection_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            name: None,
            max_reconnect_attempts: 10,
            connection_timeout_secs: 5,
        }
    }
}

/// NSQ connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NsqConfig {
    /// nsqd TCP address (e.g., "127.0.0.1:4150")
    pub nsqd_address: String,

    /// RDY count announced by each consumer connection
    pub max_in_flight: u32,

    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Reconnect attempts after a subscription loses its nsqd connection
    pub max_reconnect_attempts: u32,

    /// First reconnect delay in milliseconds; doubles per attempt
    pub reconnect_delay_ms: u64,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            nsqd_address: "127.0.0.1:4150".to_string(),
            max_in_flight: 32,
            connect_timeout_secs: 5,
            max_reconnect_attempts: 10,
            reconnect_delay_ms: 500,
        }
    }
}

impl NsqConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Top-level delivery configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MqConfig {
    /// Which broker the unified server composes
    pub broker: BrokerKind,

    /// Failed deliveries per message before dead-lettering
    pub max_retries: u32,

    /// Topic broker dead letters are republished onto
    pub dead_letter_topic: String,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub nsq: NsqConfig,
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            broker: BrokerKind::Nats,
            max_retries: 3,
            dead_letter_topic: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
            retry: RetryConfig::default(),
            nats: NatsConfig::default(),
            nsq: NsqConfig::default(),
        }
    }
}

impl MqConfig {
    /// Configuration for the in-process broker
    pub fn memory() -> Self {
        Self {
            broker: BrokerKind::Memory,
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(MqError::Config("max_retries must be at least 1".to_string()));
        }

        if self.dead_letter_topic.trim().is_empty() {
            return Err(MqError::Config("dead letter topic cannot be empty".to_string()));
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(MqError::Config(
                "retry max_delay_ms must not be below base_delay_ms".to_string(),
            ));
        }

        match self.broker {
            BrokerKind::Nats if self.nats.url.is_empty() => {
                Err(MqError::Config("NATS URL cannot be empty".to_string()))
            }
            BrokerKind::Nsq if self.nsq.nsqd_address.is_empty() => {
                Err(MqError::Config("nsqd address cannot be empty".to_string()))
            }
            BrokerKind::Nsq if self.nsq.max_in_flight == 0 => {
                Err(MqError::Config("NSQ max_in_flight must be at least 1".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Create configuration from environment variables
    ///
    /// # Environment Variables
    /// - `MQ_BROKER`: `nats`, `nsq` or `memory`
    /// - `MQ_MAX_RETRIES`, `MQ_DEAD_LETTER_TOPIC`
    /// - `MQ_RETRY_STRATEGY`, `MQ_RETRY_BASE_DELAY_MS`, `MQ_RETRY_MAX_DELAY_MS`
    /// - `NATS_URL`, `NATS_NAME`, `NATS_MAX_RECONNECT_ATTEMPTS`, `NATS_CONNECTION_TIMEOUT_SECS`
    /// - `NSQD_ADDRESS`, `NSQ_MAX_IN_FLIGHT`, `NSQ_CONNECT_TIMEOUT_SECS`,
    ///   `NSQ_MAX_RECONNECT_ATTEMPTS`, `NSQ_RECONNECT_DELAY_MS`
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let broker = match std::env::var("MQ_BROKER") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.broker,
        };
        let strategy = match std::env::var("MQ_RETRY_STRATEGY") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.retry.strategy,
        };

        let config = Self {
            broker,
            max_retries: env_parse("MQ_MAX_RETRIES", defaults.max_retries),
            dead_letter_topic: std::env::var("MQ_DEAD_LETTER_TOPIC")
                .unwrap_or(defaults.dead_letter_topic),
            retry: RetryConfig {
                strategy,
                base_delay_ms: env_parse("MQ_RETRY_BASE_DELAY_MS", defaults.retry.base_delay_ms),
                max_delay_ms: env_parse("MQ_RETRY_MAX_DELAY_MS", defaults.retry.max_delay_ms),
            },
            nats: NatsConfig {
                url: std::env::var("NATS_URL").unwrap_or(defaults.nats.url),
                name: std::env::var("NATS_NAME").ok(),
                max_reconnect_attempts: env_parse(
                    "NATS_MAX_RECONNECT_ATTEMPTS",
                    defaults.nats.max_reconnect_attempts,
                ),
                connection_timeout_secs: env_parse(
                    "NATS_CONNECTION_TIMEOUT_SECS",
                    defaults.nats.connection_timeout_secs,
                ),
            },
            nsq: NsqConfig {
                nsqd_address: std::env::var("NSQD_ADDRESS").unwrap_or(defaults.nsq.nsqd_address),
                max_in_flight: env_parse("NSQ_MAX_IN_FLIGHT", defaults.nsq.max_in_flight),
                connect_timeout_secs: env_parse(
                    "NSQ_CONNECT_TIMEOUT_SECS",
                    defaults.nsq.connect_timeout_secs,
                ),
                max_reconnect_attempts: env_parse(
                    "NSQ_MAX_RECONNECT_ATTEMPTS",
                    defaults.nsq.max_reconnect_attempts,
                ),
                reconnect_delay_ms: env_parse(
                    "NSQ_RECONNECT_DELAY_MS",
                    defaults.nsq.reconnect_delay_ms,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
