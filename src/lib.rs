//! Broker-agnostic message delivery
//!
//! Layers, bottom up:
//!
//! - **Transports**: [`Producer`]/[`Consumer`] adapters for NATS, NSQ and an
//!   in-process broker, sharing one retry and dead-letter state machine
//! - **Server**: topic-level publish/subscribe over one transport, with dead
//!   letters forwarded to a dedicated topic
//! - **Event bus**: typed [`Event`]s with tenant propagation
//! - **Idempotency**: cache plus ledger guard for exactly-once effects
//! - **Manager**: handler registry with activation toggles, idempotency
//!   gating, dead-letter archiving and panic isolation
//!
//! # Example
//!
//! ```rust,ignore
//! use event_delivery::{
//!     subscription_handler_fn, Context, Event, EventBus, InMemorySubscriptionStore,
//!     Manager, MqConfig, Server, TransportRegistry,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = MqConfig::from_env()?;
//!     let server = Server::connect(&config, &TransportRegistry::with_defaults()).await?;
//!     let bus = Arc::new(EventBus::new(Arc::new(server)));
//!     let manager = Manager::new(bus.clone(), Arc::new(InMemorySubscriptionStore::new()));
//!
//!     manager.register(
//!         "user.created",
//!         "mailer",
//!         subscription_handler_fn(|ctx, event| async move {
//!             tracing::info!(channel = %ctx.channel, event_id = %event.id, "welcome mail");
//!             Ok(())
//!         }),
//!     )?;
//!     manager.start().await?;
//!
//!     let event = Event::new("user.created", serde_json::json!({"name": "ada"}))?;
//!     bus.publish(&Context::background(), &event).await?;
//!
//!     manager.close().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
mod delivery;
pub mod error;
pub mod event;
pub mod event_bus;
pub mod idempotency;
pub mod manager;
pub mod memory;
pub mod message;
pub mod nats;
pub mod nsq;
pub mod retry;
pub mod server;
pub mod store;
pub mod transport;

// Re-exports
pub use config::{BrokerKind, MqConfig, NatsConfig, NsqConfig, RetryConfig, RetryStrategy};
pub use context::Context;
pub use error::{MqError, Result};
pub use event::{DeadLetterEvent, Event};
pub use event_bus::{
    dead_letter_event_handler_fn, event_handler_fn, DeadLetterEventHandler, EventBus,
    EventHandler,
};
pub use idempotency::{
    Idempotency, IdempotencyCache, IdempotencyLedger, IdempotencyRecord, InMemoryLedger,
    MokaIdempotencyCache,
};
pub use manager::{subscription_handler_fn, EventContext, Manager, SubscriptionHandler};
pub use memory::MemoryBroker;
pub use message::{DeadLetterMessage, Headers, Message};
pub use retry::{ExponentialBackoff, LinearBackoff, RetryPolicy};
pub use server::{Server, DEAD_LETTER_CHANNEL};
pub use store::{
    InMemorySubscriptionStore, Parameters, SubscriptionRecord, SubscriptionStatus,
    SubscriptionStore,
};
pub use transport::{
    dead_letter_handler_fn, message_handler_fn, Connection, Consumer, DeadLetterHandler,
    MessageHandler, Producer, Transport, TransportRegistry,
};
