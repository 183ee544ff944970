//! Message handlers invoked by queue consumers.

use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc};

use futures_util::future::BoxFuture;
use sqlx::SqliteConnection;

use crate::{
    message::{MessagePayload, QueuedMessage},
    queues::{DurableQueues, QueueSession},
};

/// Per delivery context handed to a handler.
pub struct HandlerContext<'a> {
    queues: &'a DurableQueues,
    connection: Option<&'a mut SqliteConnection>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        queues: &'a DurableQueues,
        connection: Option<&'a mut SqliteConnection>,
    ) -> Self {
        Self { queues, connection }
    }

    /// The unit of work the delivery runs in, in fully transactional mode.
    ///
    /// The handler runs in a savepoint of that unit of work. Statements issued here commit
    /// together with the acknowledgement of the message. When the handler fails only they
    /// are rolled back; the claim and the retry or dead letter decision still commit.
    pub fn connection(&mut self) -> Option<&mut SqliteConnection> {
        self.connection.as_deref_mut()
    }

    /// Queue operations that take part in the delivery.
    ///
    /// In fully transactional mode they run on [`Self::connection`], so a message queued by
    /// the handler is only visible once the delivery commits. Otherwise every operation
    /// commits on its own.
    pub fn queues(&mut self) -> QueueSession<'_> {
        match self.connection.as_deref_mut() {
            Some(conn) => self.queues.with_connection(conn),
            None => self.queues.detached(),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.connection.is_some()
    }
}

/// Handles messages delivered from a queue.
///
/// Returning `Ok` acknowledges the message. An error is passed to the consumer's redelivery
/// policy. Handlers must be idempotent, since delivery is at least once.
pub trait QueuedMessageHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        message: &'a QueuedMessage,
        ctx: HandlerContext<'a>,
    ) -> BoxFuture<'a, eyre::Result<()>>;
}

impl<H: QueuedMessageHandler + ?Sized> QueuedMessageHandler for Arc<H> {
    fn handle<'a>(
        &'a self,
        message: &'a QueuedMessage,
        ctx: HandlerContext<'a>,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        (**self).handle(message, ctx)
    }
}

pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure over an owned message as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> QueuedMessageHandler for FnHandler<F>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a QueuedMessage,
        _ctx: HandlerContext<'a>,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin((self.f)(message.clone()))
    }
}

struct TypedHandler<T, F> {
    f: F,
    _payload: PhantomData<fn(T)>,
}

impl<T, F, Fut> QueuedMessageHandler for TypedHandler<T, F>
where
    T: MessagePayload + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    fn handle<'a>(
        &'a self,
        message: &'a QueuedMessage,
        _ctx: HandlerContext<'a>,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        Box::pin(async move {
            let payload = message.payload.deserialize::<T>()?;
            (self.f)(payload).await
        })
    }
}

/// Dispatches on the payload type tag.
///
/// The type tag to handler table is built once, when the handler is assembled, so dispatch is
/// a single map lookup.
#[derive(Default)]
pub struct PatternMatchingHandler {
    handlers: HashMap<String, Arc<dyn QueuedMessageHandler>>,
    allow_unmatched: bool,
}

impl PatternMatchingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle payloads of type `T`, decoded before the closure is called.
    pub fn on<T, F, Fut>(self, f: F) -> Self
    where
        T: MessagePayload + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<()>> + Send + 'static,
    {
        self.on_handler(
            T::PAYLOAD_TYPE,
            TypedHandler {
                f,
                _payload: PhantomData,
            },
        )
    }

    /// Route a raw type tag to a handler. A later registration for the same tag replaces the
    /// earlier one.
    pub fn on_handler(
        mut self,
        type_name: impl Into<String>,
        handler: impl QueuedMessageHandler,
    ) -> Self {
        self.handlers.insert(type_name.into(), Arc::new(handler));
        self
    }

    /// Acknowledge messages no handler is registered for, instead of failing them.
    pub fn allow_unmatched(mut self, allow: bool) -> Self {
        self.allow_unmatched = allow;
        self
    }

    pub fn handles(&self, type_name: &str) -> bool {
        self.handlers.contains_key(type_name)
    }
}

impl QueuedMessageHandler for PatternMatchingHandler {
    fn handle<'a>(
        &'a self,
        message: &'a QueuedMessage,
        ctx: HandlerContext<'a>,
    ) -> BoxFuture<'a, eyre::Result<()>> {
        match self.handlers.get(&message.payload.type_name) {
            Some(handler) => handler.handle(message, ctx),
            None if self.allow_unmatched => {
                tracing::debug!(
                    queue = %message.queue_name,
                    message_id = %message.id,
                    payload_type = %message.payload.type_name,
                    "ignoring unmatched payload"
                );
                Box::pin(async { Ok(()) })
            }
            None => {
                let type_name = message.payload.type_name.clone();
                Box::pin(async move {
                    Err(eyre::eyre!("no handler registered for payload type {type_name}"))
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::message::{Payload, QueueEntryId, QueueName};

    #[derive(Serialize, Deserialize)]
    struct OrderPlaced {
        amount: u32,
    }

    impl MessagePayload for OrderPlaced {
        const PAYLOAD_TYPE: &'static str = "OrderPlaced";
    }

    fn message(payload: Payload) -> QueuedMessage {
        let now = Utc::now();
        QueuedMessage {
            id: QueueEntryId::new(1),
            queue_name: QueueName::from("orders"),
            payload,
            meta_data: HashMap::new(),
            added_timestamp: now,
            next_delivery_timestamp: now,
            delivery_timestamp: Some(now),
            delivery_attempts: 1,
            total_delivery_attempts: 1,
            redelivery_attempts: 0,
            last_delivery_error: None,
            is_being_delivered: true,
            is_dead_letter_message: false,
            marked_as_dead_letter_at: None,
            cause_of_enqueuing: None,
        }
    }

    #[tokio::test]
    async fn dispatches_on_type_tag() {
        let queues = DurableQueues::connect().await.unwrap();
        let total = Arc::new(AtomicU32::new(0));
        let seen = total.clone();

        let handler = PatternMatchingHandler::new().on(move |order: OrderPlaced| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(order.amount, Ordering::SeqCst);
                Ok(())
            }
        });

        let msg = message(Payload::of(&OrderPlaced { amount: 7 }).unwrap());
        handler.handle(&msg, HandlerContext::new(&queues, None)).await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn unmatched_payload_fails_unless_allowed() {
        let queues = DurableQueues::connect().await.unwrap();
        let msg = message(Payload::new("Unknown", &b"{}"[..]));

        let strict = PatternMatchingHandler::new();
        assert!(strict.handle(&msg, HandlerContext::new(&queues, None)).await.is_err());

        let lenient = PatternMatchingHandler::new().allow_unmatched(true);
        assert!(lenient.handle(&msg, HandlerContext::new(&queues, None)).await.is_ok());
    }

    #[tokio::test]
    async fn detached_context_queues_immediately() {
        let queues = DurableQueues::connect().await.unwrap();
        let msg = message(Payload::new("Unknown", &b"{}"[..]));

        let mut ctx = HandlerContext::new(&queues, None);
        assert!(!ctx.is_transactional());
        ctx.queues()
            .queue_message(
                crate::QueueMessage::builder()
                    .queue_name("audit")
                    .payload(msg.payload.clone())
                    .build(),
            )
            .await
            .unwrap();

        assert_eq!(queues.get_total_messages_queued_for("audit").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_handler_error() {
        let queues = DurableQueues::connect().await.unwrap();
        let handler = PatternMatchingHandler::new().on(|_: OrderPlaced| async { Ok(()) });
        let msg = message(Payload::new("OrderPlaced", &b"garbage"[..]));

        assert!(handler.handle(&msg, HandlerContext::new(&queues, None)).await.is_err());
    }
}
