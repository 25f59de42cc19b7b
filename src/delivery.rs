//! Retry / dead-letter state machine shared by every consumer
//!
//! Each subscription owns a [`Dispatcher`]. Adapters feed it raw broker
//! payloads and act on the returned [`Outcome`]: acknowledge, redeliver
//! after a delay, or drop.

use crate::error::MqError;
use crate::message::{DeadLetterMessage, Message};
use crate::retry::{RetryPolicy, RetryTracker};
use crate::transport::{DeadLetterHandler, MessageHandler};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the adapter must do with the broker copy of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Handled successfully
    Ack,
    /// Handler failed below the retry budget; redeliver after `delay`
    Retry {
        message_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Retry budget exhausted or envelope undecodable; handed to the dead-letter handler
    DeadLettered,
    /// Delivery interrupted by shutdown; the failure counter is dropped
    Abandoned,
}

/// Dead-letter callback shared by all subscriptions of a consumer
#[derive(Default)]
pub(crate) struct DeadLetterSlot {
    handler: RwLock<Option<Arc<dyn DeadLetterHandler>>>,
}

impl DeadLetterSlot {
    pub(crate) fn set(&self, handler: Arc<dyn DeadLetterHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = Some(handler);
        }
    }

    fn get(&self) -> Option<Arc<dyn DeadLetterHandler>> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    pub(crate) async fn deliver(&self, dead: DeadLetterMessage) {
        let Some(handler) = self.get() else {
            tracing::warn!(
                topic = %dead.original_topic,
                channel = %dead.channel,
                message_id = %dead.message_id,
                "Dropping dead letter, no dead-letter handler installed"
            );
            return;
        };

        if let Err(e) = handler.handle_dead_letter(dead.clone()).await {
            tracing::error!(
                topic = %dead.original_topic,
                channel = %dead.channel,
                message_id = %dead.message_id,
                error = %e,
                "Dead-letter handler failed"
            );
        }
    }
}

/// Per-subscription delivery state
pub(crate) struct Dispatcher {
    topic: String,
    channel: String,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<dyn RetryPolicy>,
    tracker: RetryTracker,
    dead_letters: Arc<DeadLetterSlot>,
}

impl Dispatcher {
    pub(crate) fn new(
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
        policy: Arc<dyn RetryPolicy>,
        dead_letters: Arc<DeadLetterSlot>,
    ) -> Self {
        Self {
            topic: topic.to_string(),
            channel: channel.to_string(),
            handler,
            policy,
            tracker: RetryTracker::new(),
            dead_letters,
        }
    }

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    /// Drop the failure counter of a message whose redelivery will not happen
    pub(crate) fn forget(&self, message_id: &str) {
        self.tracker.clear(message_id);
    }

    /// Decode, invoke the handler and apply the retry policy
    pub(crate) async fn dispatch(&self, cancel: CancellationToken, raw: &[u8]) -> Outcome {
        let message = match Message::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    topic = %self.topic,
                    channel = %self.channel,
                    error = %e,
                    "Undecodable envelope, promoting to dead letter"
                );
                let dead =
                    DeadLetterMessage::undecodable(&self.topic, &self.channel, raw, e.to_string());
                self.dead_letters.deliver(dead).await;
                return Outcome::DeadLettered;
            }
        };

        let message_id = message.id().to_string();
        let result = self.handler.handle(cancel.clone(), message.clone()).await;

        match result {
            Ok(()) => {
                self.tracker.clear(&message_id);
                Outcome::Ack
            }
            Err(MqError::Cancelled) if cancel.is_cancelled() => {
                self.tracker.clear(&message_id);
                tracing::debug!(
                    topic = %self.topic,
                    channel = %self.channel,
                    message_id = %message_id,
                    "Delivery abandoned on shutdown"
                );
                Outcome::Abandoned
            }
            Err(e) => {
                let attempt = self.tracker.record_failure(&message_id);
                if attempt >= self.policy.max_attempts() {
                    tracing::error!(
                        topic = %self.topic,
                        channel = %self.channel,
                        message_id = %message_id,
                        attempts = attempt,
                        error = %e,
                        "Retry budget exhausted, dead-lettering message"
                    );
                    self.tracker.clear(&message_id);
                    let dead =
                        DeadLetterMessage::from_failure(&message, &self.channel, e.to_string(), attempt);
                    self.dead_letters.deliver(dead).await;
                    Outcome::DeadLettered
                } else {
                    let delay = self.policy.next_delay(attempt);
                    tracing::warn!(
                        topic = %self.topic,
                        channel = %self.channel,
                        message_id = %message_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Handler failed, scheduling redelivery"
                    );
                    Outcome::Retry {
                        message_id,
                        attempt,
                        delay,
                    }
                }
            }
        }
    }
}
