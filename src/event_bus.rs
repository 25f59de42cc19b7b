//! Event bus on top of the message server
//!
//! Publishes [`Event`]s by type and hands delivered messages back to
//! [`EventHandler`]s as rebuilt events, with the tenant moved into the
//! handler's [`Context`].

use crate::context::Context;
use crate::error::{MqError, Result};
use crate::event::{DeadLetterEvent, Event};
use crate::message::{now_nanos, DeadLetterMessage, Message};
use crate::server::{Server, DEAD_LETTER_CHANNEL};
use crate::transport::{subscription_key, MessageHandler};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Handles events of one type on one channel
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: Context, event: Event) -> Result<()>;
}

/// Handles events that exhausted their retries
#[async_trait]
pub trait DeadLetterEventHandler: Send + Sync {
    async fn handle_dead_letter(&self, ctx: Context, dead: DeadLetterEvent) -> Result<()>;
}

struct EventHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for EventHandlerFn<F>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: Context, event: Event) -> Result<()> {
        (self.0)(ctx, event).await
    }
}

pub fn event_handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Context, Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(EventHandlerFn(f))
}

struct DeadLetterEventHandlerFn<F>(F);

#[async_trait]
impl<F, Fut> DeadLetterEventHandler for DeadLetterEventHandlerFn<F>
where
    F: Fn(Context, DeadLetterEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle_dead_letter(&self, ctx: Context, dead: DeadLetterEvent) -> Result<()> {
        (self.0)(ctx, dead).await
    }
}

pub fn dead_letter_event_handler_fn<F, Fut>(f: F) -> Arc<dyn DeadLetterEventHandler>
where
    F: Fn(Context, DeadLetterEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(DeadLetterEventHandlerFn(f))
}

fn delivery_context(cancel: CancellationToken, tenant_id: Option<&str>) -> Context {
    let ctx = Context::with_token(cancel);
    match tenant_id {
        Some(tenant_id) => ctx.with_tenant_id(tenant_id),
        None => ctx,
    }
}

struct EventDelivery {
    handler: Arc<dyn EventHandler>,
}

#[async_trait]
impl MessageHandler for EventDelivery {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<()> {
        let event = Event::from_message(&message);
        let ctx = delivery_context(cancel, event.tenant_id.as_deref());
        self.handler.handle(ctx, event).await
    }
}

struct DeadLetterDelivery {
    handler: Arc<dyn DeadLetterEventHandler>,
}

#[async_trait]
impl MessageHandler for DeadLetterDelivery {
    async fn handle(&self, cancel: CancellationToken, message: Message) -> Result<()> {
        let dead = DeadLetterMessage::decode(message.payload_bytes())?;
        let dead = DeadLetterEvent::from_dead_letter_message(&dead);
        let ctx = delivery_context(cancel, dead.tenant_id.as_deref());
        self.handler.handle_dead_letter(ctx, dead).await
    }
}

struct Subscription {
    event_type: String,
    channel: String,
}

/// Typed publish/subscribe over a [`Server`]
pub struct EventBus {
    server: Arc<Server>,
    subscriptions: DashMap<String, Subscription>,
    /// `type:channel` pairs held by a subscription id, claimed before the broker is reached
    claims: DashMap<String, String>,
    dead_letter_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            server,
            subscriptions: DashMap::new(),
            claims: DashMap::new(),
            dead_letter_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Publish an event to the topic named by its type
    ///
    /// The tenant set on the event takes precedence over the one carried
    /// by `ctx`.
    pub async fn publish(&self, ctx: &Context, event: &Event) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(MqError::Cancelled);
        }

        let tenant_id = event.tenant_id.as_deref().or(ctx.tenant_id());
        let headers = event.to_headers(tenant_id);
        self.server
            .publish(&event.event_type, event.encode_data()?, headers)
            .await?;

        tracing::debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            tenant_id = tenant_id.unwrap_or_default(),
            "Event published"
        );
        Ok(())
    }

    /// Subscribe a handler to an event type; returns the subscription id
    ///
    /// One handler per (event type, channel) pair: a second subscription for
    /// the same pair fails with [`MqError::DuplicateRegistration`].
    pub async fn subscribe(
        &self,
        event_type: &str,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<String> {
        let duplicate = || MqError::DuplicateRegistration {
            topic: event_type.to_string(),
            channel: channel.to_string(),
        };
        let pair = subscription_key(event_type, channel);
        let id = format!("{}:{}:{}", event_type, channel, now_nanos());
        match self.claims.entry(pair.clone()) {
            Entry::Occupied(_) => return Err(duplicate()),
            Entry::Vacant(vacant) => {
                vacant.insert(id.clone());
            }
        }
        if self.server.is_subscribed(event_type, channel) {
            self.claims.remove(&pair);
            return Err(duplicate());
        }

        if let Err(e) = self
            .server
            .subscribe(event_type, channel, Arc::new(EventDelivery { handler }))
            .await
        {
            self.claims.remove(&pair);
            return Err(e);
        }

        self.subscriptions.insert(
            id.clone(),
            Subscription {
                event_type: event_type.to_string(),
                channel: channel.to_string(),
            },
        );

        tracing::info!(
            subscription_id = %id,
            event_type = %event_type,
            channel = %channel,
            "Event subscription added"
        );
        Ok(id)
    }

    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<()> {
        if let Some((_, subscription)) = self.subscriptions.remove(subscription_id) {
            let result = self
                .server
                .unsubscribe(&subscription.event_type, &subscription.channel)
                .await;
            self.release(&subscription, subscription_id);
            return result;
        }

        let is_dead_letter = self
            .dead_letter_id
            .lock()
            .map(|id| id.as_deref() == Some(subscription_id))
            .unwrap_or(false);
        if is_dead_letter {
            return self.unsubscribe_dead_letter().await;
        }

        Err(MqError::NotSubscribed(subscription_id.to_string()))
    }

    /// Subscribe to dead-lettered events, replacing any previous handler
    pub async fn subscribe_dead_letter(
        &self,
        handler: Arc<dyn DeadLetterEventHandler>,
    ) -> Result<String> {
        self.server
            .subscribe_dead_letter(Arc::new(DeadLetterDelivery { handler }))
            .await?;

        let id = format!(
            "{}:{}:{}",
            self.server.dead_letter_topic(),
            DEAD_LETTER_CHANNEL,
            now_nanos()
        );
        if let Ok(mut current) = self.dead_letter_id.lock() {
            *current = Some(id.clone());
        }
        Ok(id)
    }

    pub async fn unsubscribe_dead_letter(&self) -> Result<()> {
        if let Ok(mut current) = self.dead_letter_id.lock() {
            *current = None;
        }
        self.server.unsubscribe_dead_letter().await
    }

    fn release(&self, subscription: &Subscription, subscription_id: &str) {
        let pair = subscription_key(&subscription.event_type, &subscription.channel);
        self.claims.remove_if(&pair, |_, owner| owner.as_str() == subscription_id);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Drop every subscription and close the server
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        let ids: Vec<String> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, subscription)) = self.subscriptions.remove(&id) {
                if let Err(e) = self
                    .server
                    .unsubscribe(&subscription.event_type, &subscription.channel)
                    .await
                {
                    errors.push(e);
                }
                self.release(&subscription, &id);
            }
        }
        if let Err(e) = self.unsubscribe_dead_letter().await {
            errors.push(e);
        }
        match self.server.close().await {
            Err(MqError::Close(inner)) => errors.extend(inner),
            Err(e) => errors.push(e),
            Ok(()) => {}
        }

        MqError::aggregate(errors)
    }
}
