//! NSQ consumer implementation
//!
//! Each `topic:channel` key owns one nsqd connection. The read half drives
//! deliveries; acknowledgements from handler tasks are funnelled back to the
//! write half through a command queue. Retries use `REQ` with the policy
//! delay so nsqd performs the redelivery.
//!
//! A subscription whose connection drops reconnects with backoff and
//! announces `SUB`/`RDY` again. Once the reconnect budget is spent the
//! subscription is removed and can be subscribed afresh.

use crate::delivery::{DeadLetterSlot, Dispatcher, Outcome};
use crate::error::{MqError, Result};
use crate::nsq::codec::{validate_name, Command, Frame, NsqMessage};
use crate::nsq::connection::{open, request_ok, NsqFramed};
use crate::retry::RetryPolicy;
use crate::transport::{subscription_key, Consumer, DeadLetterHandler, MessageHandler};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Keeps long-running handlers from hitting nsqd's message timeout
const TOUCH_INTERVAL: Duration = Duration::from_secs(30);

struct ActiveSubscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

type Subscriptions = Arc<DashMap<String, ActiveSubscription>>;

/// How subscriptions reach nsqd
#[derive(Clone)]
struct Link {
    address: String,
    connect_timeout: Duration,
    max_in_flight: u32,
    reconnect: Arc<dyn RetryPolicy>,
}

impl Link {
    /// Open a connection subscribed to `topic`/`channel` and ready for messages
    async fn establish(&self, topic: &str, channel: &str) -> Result<NsqFramed> {
        let mut framed = open(&self.address, self.connect_timeout).await?;
        request_ok(
            &mut framed,
            Command::Sub {
                topic: topic.to_string(),
                channel: channel.to_string(),
            },
        )
        .await
        .map_err(|e| MqError::Subscribe(format!("{}: {}", subscription_key(topic, channel), e)))?;
        framed.send(Command::Rdy(self.max_in_flight)).await?;
        Ok(framed)
    }
}

/// NSQ channel consumer implementing the Consumer port
pub struct NsqConsumer {
    link: Link,
    policy: Arc<dyn RetryPolicy>,
    dead_letters: Arc<DeadLetterSlot>,
    subscriptions: Subscriptions,
    root: CancellationToken,
}

impl NsqConsumer {
    /// `reconnect` paces reconnection after a dropped connection; its
    /// `max_attempts` is the reconnect budget of each subscription.
    pub fn new(
        address: impl Into<String>,
        connect_timeout: Duration,
        max_in_flight: u32,
        policy: Arc<dyn RetryPolicy>,
        reconnect: Arc<dyn RetryPolicy>,
        root: CancellationToken,
    ) -> Self {
        Self {
            link: Link {
                address: address.into(),
                connect_timeout,
                max_in_flight,
                reconnect,
            },
            policy,
            dead_letters: Arc::new(DeadLetterSlot::default()),
            subscriptions: Arc::new(DashMap::new()),
            root,
        }
    }

    async fn stop(key: &str, active: ActiveSubscription) {
        active.token.cancel();
        if let Err(e) = active.task.await {
            tracing::error!(key = %key, error = %e, "NSQ subscription task failed");
        }
    }
}

#[async_trait]
impl Consumer for NsqConsumer {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let key = subscription_key(topic, channel);
        if self.is_subscribed(topic, channel) {
            tracing::debug!(topic = %topic, channel = %channel, "Already subscribed");
            return Ok(());
        }
        validate_name(topic)?;
        validate_name(channel)?;

        let framed = self.link.establish(topic, channel).await?;
        let dispatcher = Arc::new(Dispatcher::new(
            topic,
            channel,
            handler,
            self.policy.clone(),
            self.dead_letters.clone(),
        ));
        let token = self.root.child_token();
        let task = tokio::spawn(run(
            framed,
            self.link.clone(),
            dispatcher,
            token.clone(),
            self.subscriptions.clone(),
            key.clone(),
        ));

        let active = ActiveSubscription { token, task };
        let loser = match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(current) if !current.get().token.is_cancelled() => Some(active),
            Entry::Occupied(mut stale) => {
                stale.insert(active);
                None
            }
            Entry::Vacant(vacant) => {
                vacant.insert(active);
                None
            }
        };
        if let Some(loser) = loser {
            Self::stop(&key, loser).await;
        } else {
            tracing::info!(
                topic = %topic,
                channel = %channel,
                max_in_flight = self.link.max_in_flight,
                "Subscribed to NSQ"
            );
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, channel: &str) -> Result<()> {
        let key = subscription_key(topic, channel);
        if let Some((key, active)) = self.subscriptions.remove(&key) {
            Self::stop(&key, active).await;
            tracing::info!(topic = %topic, channel = %channel, "Unsubscribed from NSQ");
        }
        Ok(())
    }

    fn set_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler>) {
        self.dead_letters.set(handler);
    }

    fn is_subscribed(&self, topic: &str, channel: &str) -> bool {
        self.subscriptions
            .get(&subscription_key(topic, channel))
            .map(|active| !active.token.is_cancelled())
            .unwrap_or(false)
    }

    async fn close(&self) -> Result<()> {
        self.root.cancel();
        let keys: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((key, active)) = self.subscriptions.remove(&key) {
                Self::stop(&key, active).await;
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    Cancelled,
    Lost,
}

/// Subscription task: consume, reconnect on loss, give up when the budget is spent
async fn run(
    mut framed: NsqFramed,
    link: Link,
    dispatcher: Arc<Dispatcher>,
    token: CancellationToken,
    subscriptions: Subscriptions,
    key: String,
) {
    loop {
        if consume(framed, &dispatcher, &token).await == Disconnect::Cancelled {
            return;
        }
        match reconnect(&link, &dispatcher, &token).await {
            Some(next) => framed = next,
            None if token.is_cancelled() => return,
            None => break,
        }
    }

    tracing::error!(
        topic = %dispatcher.topic(),
        channel = %dispatcher.channel(),
        attempts = link.reconnect.max_attempts(),
        "nsqd unreachable, subscription dropped"
    );
    token.cancel();
    subscriptions.remove_if(&key, |_, active| active.token.is_cancelled());
}

async fn reconnect(
    link: &Link,
    dispatcher: &Dispatcher,
    token: &CancellationToken,
) -> Option<NsqFramed> {
    for attempt in 1..=link.reconnect.max_attempts() {
        let delay = link.reconnect.next_delay(attempt);
        let result = tokio::select! {
            _ = token.cancelled() => return None,
            result = async {
                tokio::time::sleep(delay).await;
                link.establish(dispatcher.topic(), dispatcher.channel()).await
            } => result,
        };

        match result {
            Ok(framed) => {
                tracing::info!(
                    topic = %dispatcher.topic(),
                    channel = %dispatcher.channel(),
                    attempt,
                    "Reconnected to nsqd"
                );
                return Some(framed);
            }
            Err(e) => {
                tracing::warn!(
                    topic = %dispatcher.topic(),
                    channel = %dispatcher.channel(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "nsqd reconnect failed"
                );
            }
        }
    }
    None
}

/// Drive one connection until it is cancelled or lost
async fn consume(
    framed: NsqFramed,
    dispatcher: &Arc<Dispatcher>,
    token: &CancellationToken,
) -> Disconnect {
    let (mut sink, mut stream) = framed.split();
    let (commands, mut pending) = mpsc::unbounded_channel::<Command>();

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                // unacknowledged in-flight messages are requeued by nsqd
                if let Err(e) = sink.send(Command::Cls).await {
                    tracing::debug!(error = %e, "CLS not delivered");
                }
                return Disconnect::Cancelled;
            }
            Some(command) = pending.recv() => {
                if let Err(e) = sink.send(command).await {
                    tracing::error!(
                        topic = %dispatcher.topic(),
                        channel = %dispatcher.channel(),
                        error = %e,
                        "Failed to write to nsqd"
                    );
                    return Disconnect::Lost;
                }
            }
            frame = stream.next() => match frame {
                None => {
                    tracing::warn!(
                        topic = %dispatcher.topic(),
                        channel = %dispatcher.channel(),
                        "nsqd closed the connection"
                    );
                    return Disconnect::Lost;
                }
                Some(Err(e)) => {
                    tracing::error!(
                        topic = %dispatcher.topic(),
                        channel = %dispatcher.channel(),
                        error = %e,
                        "Failed to read from nsqd"
                    );
                    return Disconnect::Lost;
                }
                Some(Ok(frame)) if frame.is_heartbeat() => {
                    if let Err(e) = sink.send(Command::Nop).await {
                        tracing::error!(error = %e, "Failed to answer nsqd heartbeat");
                        return Disconnect::Lost;
                    }
                }
                Some(Ok(Frame::Response(body))) => {
                    tracing::debug!(response = %String::from_utf8_lossy(&body), "nsqd response");
                }
                Some(Ok(Frame::Error(body))) => {
                    tracing::error!(
                        topic = %dispatcher.topic(),
                        channel = %dispatcher.channel(),
                        error = %String::from_utf8_lossy(&body),
                        "nsqd reported an error"
                    );
                }
                Some(Ok(Frame::Message(message))) => {
                    tokio::spawn(deliver(
                        message,
                        dispatcher.clone(),
                        commands.clone(),
                        token.child_token(),
                    ));
                }
            },
        }
    }
}

async fn deliver(
    message: NsqMessage,
    dispatcher: Arc<Dispatcher>,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
) {
    let id = message.id;
    let dispatch = dispatcher.dispatch(cancel, &message.body);
    tokio::pin!(dispatch);

    let mut touch = tokio::time::interval_at(
        tokio::time::Instant::now() + TOUCH_INTERVAL,
        TOUCH_INTERVAL,
    );
    let outcome = loop {
        tokio::select! {
            outcome = &mut dispatch => break outcome,
            _ = touch.tick() => {
                if commands.send(Command::Touch(id)).is_err() {
                    tracing::debug!(
                        message_id = %message.id_str(),
                        "Connection gone, TOUCH not sent"
                    );
                }
            }
        }
    };

    let command = match outcome {
        Outcome::Ack | Outcome::DeadLettered => Command::Fin(id),
        Outcome::Retry { delay, .. } => Command::Req {
            id,
            timeout_ms: delay.as_millis() as u64,
        },
        Outcome::Abandoned => Command::Req { id, timeout_ms: 0 },
    };

    if commands.send(command).is_err() {
        tracing::debug!(
            message_id = %message.id_str(),
            attempts = message.attempts,
            "Connection gone before acknowledgement, nsqd will redeliver"
        );
    }
}
