//! Middleware around every [`crate::queues::DurableQueues`] operation.
//!
//! Interceptors run in registration order. Each receives the operation and the rest of the
//! chain, and decides whether, and with what operation, to proceed. The innermost link
//! performs the operation against the store.

use std::{collections::HashMap, time::Duration};

use futures_util::future::BoxFuture;
use tokio::time::Instant;

use crate::{
    consumer::{ConsumeFromQueue, DurableQueueConsumer},
    error::Error,
    message::{
        Payload, QueueEntryId, QueueName, QueuedMessage, QueuedMessageCounts, QueueingSortOrder,
    },
};

/// Arguments of a single message enqueue.
#[derive(Clone, Debug, bon::Builder)]
pub struct QueueMessage {
    #[builder(into)]
    pub queue_name: QueueName,
    pub payload: Payload,
    #[builder(default)]
    pub meta_data: HashMap<String, String>,
    /// Delay before the message becomes deliverable. Absent means immediately.
    pub delivery_delay: Option<Duration>,
    #[builder(into)]
    pub cause_of_enqueuing: Option<String>,
}

#[derive(Debug, strum::IntoStaticStr)]
pub enum Operation {
    QueueMessage(QueueMessage),
    QueueMessages {
        queue_name: QueueName,
        payloads: Vec<Payload>,
        meta_data: HashMap<String, String>,
        delivery_delay: Option<Duration>,
    },
    QueueMessageAsDeadLetterMessage {
        queue_name: QueueName,
        payload: Payload,
        meta_data: HashMap<String, String>,
        cause: String,
    },
    ConsumeFromQueue(ConsumeFromQueue),
    StopConsumingFromQueue {
        queue_name: QueueName,
    },
    RetryMessage {
        id: QueueEntryId,
        cause: String,
        delivery_delay: Duration,
    },
    MarkAsDeadLetterMessage {
        id: QueueEntryId,
        cause: String,
    },
    ResurrectDeadLetterMessage {
        id: QueueEntryId,
        delivery_delay: Duration,
    },
    AcknowledgeMessageAsHandled {
        id: QueueEntryId,
    },
    DeleteMessage {
        id: QueueEntryId,
    },
    GetQueuedMessage {
        id: QueueEntryId,
    },
    GetDeadLetterMessage {
        id: QueueEntryId,
    },
    GetNextMessageReadyForDelivery {
        queue_name: QueueName,
        order: QueueingSortOrder,
    },
    HasMessagesQueuedFor {
        queue_name: QueueName,
    },
    GetTotalMessagesQueuedFor {
        queue_name: QueueName,
    },
    GetTotalDeadLetterMessagesQueuedFor {
        queue_name: QueueName,
    },
    GetQueuedMessageCountsFor {
        queue_name: QueueName,
    },
    GetQueuedMessages {
        queue_name: QueueName,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    },
    GetDeadLetterMessages {
        queue_name: QueueName,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    },
    GetQueueNames,
    PurgeQueue {
        queue_name: QueueName,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// The queue the operation targets, when it names one directly.
    pub fn queue_name(&self) -> Option<&QueueName> {
        match self {
            Self::QueueMessage(op) => Some(&op.queue_name),
            Self::ConsumeFromQueue(op) => Some(&op.queue_name),
            Self::QueueMessages { queue_name, .. }
            | Self::QueueMessageAsDeadLetterMessage { queue_name, .. }
            | Self::StopConsumingFromQueue { queue_name }
            | Self::GetNextMessageReadyForDelivery { queue_name, .. }
            | Self::HasMessagesQueuedFor { queue_name }
            | Self::GetTotalMessagesQueuedFor { queue_name }
            | Self::GetTotalDeadLetterMessagesQueuedFor { queue_name }
            | Self::GetQueuedMessageCountsFor { queue_name }
            | Self::GetQueuedMessages { queue_name, .. }
            | Self::GetDeadLetterMessages { queue_name, .. }
            | Self::PurgeQueue { queue_name } => Some(queue_name),
            _ => None,
        }
    }

    pub fn message_id(&self) -> Option<QueueEntryId> {
        match self {
            Self::RetryMessage { id, .. }
            | Self::MarkAsDeadLetterMessage { id, .. }
            | Self::ResurrectDeadLetterMessage { id, .. }
            | Self::AcknowledgeMessageAsHandled { id }
            | Self::DeleteMessage { id }
            | Self::GetQueuedMessage { id }
            | Self::GetDeadLetterMessage { id } => Some(*id),
            _ => None,
        }
    }

    /// Whether the operation writes to the message table.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::QueueMessage(_)
                | Self::QueueMessages { .. }
                | Self::QueueMessageAsDeadLetterMessage { .. }
                | Self::RetryMessage { .. }
                | Self::MarkAsDeadLetterMessage { .. }
                | Self::ResurrectDeadLetterMessage { .. }
                | Self::AcknowledgeMessageAsHandled { .. }
                | Self::DeleteMessage { .. }
                | Self::PurgeQueue { .. }
        )
    }
}

#[derive(Debug)]
pub enum Outcome {
    Bool(bool),
    Count(u64),
    Id(QueueEntryId),
    Ids(Vec<QueueEntryId>),
    Message(Option<QueuedMessage>),
    Messages(Vec<QueuedMessage>),
    Counts(QueuedMessageCounts),
    QueueNames(Vec<QueueName>),
    Consumer(DurableQueueConsumer),
}

fn unexpected(expected: &str, outcome: Outcome) -> Error {
    Error::internal(eyre::eyre!(
        "interceptor returned {outcome:?} where {expected} was expected"
    ))
}

impl Outcome {
    pub fn into_bool(self) -> Result<bool, Error> {
        match self {
            Self::Bool(value) => Ok(value),
            other => Err(unexpected("Bool", other)),
        }
    }

    pub fn into_count(self) -> Result<u64, Error> {
        match self {
            Self::Count(value) => Ok(value),
            other => Err(unexpected("Count", other)),
        }
    }

    pub fn into_id(self) -> Result<QueueEntryId, Error> {
        match self {
            Self::Id(value) => Ok(value),
            other => Err(unexpected("Id", other)),
        }
    }

    pub fn into_ids(self) -> Result<Vec<QueueEntryId>, Error> {
        match self {
            Self::Ids(value) => Ok(value),
            other => Err(unexpected("Ids", other)),
        }
    }

    pub fn into_message(self) -> Result<Option<QueuedMessage>, Error> {
        match self {
            Self::Message(value) => Ok(value),
            other => Err(unexpected("Message", other)),
        }
    }

    pub fn into_messages(self) -> Result<Vec<QueuedMessage>, Error> {
        match self {
            Self::Messages(value) => Ok(value),
            other => Err(unexpected("Messages", other)),
        }
    }

    pub fn into_counts(self) -> Result<QueuedMessageCounts, Error> {
        match self {
            Self::Counts(value) => Ok(value),
            other => Err(unexpected("Counts", other)),
        }
    }

    pub fn into_queue_names(self) -> Result<Vec<QueueName>, Error> {
        match self {
            Self::QueueNames(value) => Ok(value),
            other => Err(unexpected("QueueNames", other)),
        }
    }

    pub fn into_consumer(self) -> Result<DurableQueueConsumer, Error> {
        match self {
            Self::Consumer(value) => Ok(value),
            other => Err(unexpected("Consumer", other)),
        }
    }
}

type Terminal<'a> =
    Box<dyn FnOnce(Operation) -> BoxFuture<'a, Result<Outcome, Error>> + Send + 'a>;

/// The remainder of an interceptor chain.
pub struct InterceptorChain<'a> {
    interceptors: &'a [std::sync::Arc<dyn DurableQueuesInterceptor>],
    terminal: Terminal<'a>,
}

impl<'a> InterceptorChain<'a> {
    pub fn new(
        interceptors: &'a [std::sync::Arc<dyn DurableQueuesInterceptor>],
        terminal: impl FnOnce(Operation) -> BoxFuture<'a, Result<Outcome, Error>> + Send + 'a,
    ) -> Self {
        Self {
            interceptors,
            terminal: Box::new(terminal),
        }
    }

    /// Hand `operation` to the next interceptor, or perform it when none are left.
    pub fn proceed(self, operation: Operation) -> BoxFuture<'a, Result<Outcome, Error>> {
        match self.interceptors.split_first() {
            Some((next, rest)) => next.intercept(
                operation,
                InterceptorChain {
                    interceptors: rest,
                    terminal: self.terminal,
                },
            ),
            None => (self.terminal)(operation),
        }
    }
}

pub trait DurableQueuesInterceptor: Send + Sync + 'static {
    fn intercept<'a>(
        &'a self,
        operation: Operation,
        chain: InterceptorChain<'a>,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        chain.proceed(operation)
    }
}

/// Logs every operation with its duration.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingInterceptor;

impl DurableQueuesInterceptor for TracingInterceptor {
    fn intercept<'a>(
        &'a self,
        operation: Operation,
        chain: InterceptorChain<'a>,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(async move {
            let name = operation.name();
            let queue = operation.queue_name().cloned();
            let message_id = operation.message_id();
            let started = Instant::now();

            let result = chain.proceed(operation).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => tracing::debug!(
                    operation = name,
                    queue = queue.as_ref().map(QueueName::as_str),
                    message_id = message_id.map(|id| id.value()),
                    elapsed_ms,
                    "queue operation completed"
                ),
                Err(e) => tracing::warn!(
                    operation = name,
                    queue = queue.as_ref().map(QueueName::as_str),
                    message_id = message_id.map(|id| id.value()),
                    elapsed_ms,
                    error = %e,
                    "queue operation failed"
                ),
            }

            result
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DurableQueuesInterceptor for Recording {
        fn intercept<'a>(
            &'a self,
            operation: Operation,
            chain: InterceptorChain<'a>,
        ) -> BoxFuture<'a, Result<Outcome, Error>> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("{} before", self.name));
                let result = chain.proceed(operation).await;
                self.log.lock().unwrap().push(format!("{} after", self.name));
                result
            })
        }
    }

    struct ShortCircuit;

    impl DurableQueuesInterceptor for ShortCircuit {
        fn intercept<'a>(
            &'a self,
            _operation: Operation,
            _chain: InterceptorChain<'a>,
        ) -> BoxFuture<'a, Result<Outcome, Error>> {
            Box::pin(async { Ok(Outcome::Bool(false)) })
        }
    }

    /// Rewrites acknowledgements into deletes of a fixed message.
    struct Rewrite;

    impl DurableQueuesInterceptor for Rewrite {
        fn intercept<'a>(
            &'a self,
            operation: Operation,
            chain: InterceptorChain<'a>,
        ) -> BoxFuture<'a, Result<Outcome, Error>> {
            let operation = match operation {
                Operation::AcknowledgeMessageAsHandled { .. } => Operation::DeleteMessage {
                    id: QueueEntryId::new(99),
                },
                other => other,
            };
            chain.proceed(operation)
        }
    }

    struct PassThrough;

    impl DurableQueuesInterceptor for PassThrough {}

    fn ack(id: i64) -> Operation {
        Operation::AcknowledgeMessageAsHandled {
            id: QueueEntryId::new(id),
        }
    }

    #[tokio::test]
    async fn interceptors_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn DurableQueuesInterceptor>> = vec![
            Arc::new(Recording {
                name: "outer",
                log: log.clone(),
            }),
            Arc::new(PassThrough),
            Arc::new(Recording {
                name: "inner",
                log: log.clone(),
            }),
        ];

        let terminal_log = log.clone();
        let chain = InterceptorChain::new(&interceptors, move |operation| {
            Box::pin(async move {
                terminal_log
                    .lock()
                    .unwrap()
                    .push(format!("perform {}", operation.name()));
                Ok(Outcome::Bool(true))
            })
        });

        let outcome = chain.proceed(ack(1)).await.unwrap();
        assert!(outcome.into_bool().unwrap());

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer before",
                "inner before",
                "perform AcknowledgeMessageAsHandled",
                "inner after",
                "outer after",
            ]
        );
    }

    #[tokio::test]
    async fn interceptor_can_skip_the_operation() {
        let interceptors: Vec<Arc<dyn DurableQueuesInterceptor>> = vec![Arc::new(ShortCircuit)];

        let chain = InterceptorChain::new(&interceptors, |_| {
            Box::pin(async { Err(Error::invalid_parameter("terminal must not run")) })
        });

        assert!(!chain.proceed(ack(1)).await.unwrap().into_bool().unwrap());
    }

    #[tokio::test]
    async fn interceptor_can_replace_the_operation() {
        let interceptors: Vec<Arc<dyn DurableQueuesInterceptor>> = vec![Arc::new(Rewrite)];

        let chain = InterceptorChain::new(&interceptors, |operation| {
            Box::pin(async move {
                match operation {
                    Operation::DeleteMessage { id } => Ok(Outcome::Id(id)),
                    other => panic!("unexpected {other:?}"),
                }
            })
        });

        let id = chain.proceed(ack(1)).await.unwrap().into_id().unwrap();
        assert_eq!(id, QueueEntryId::new(99));
    }

    #[test]
    fn mismatched_outcome_is_internal_error() {
        let err = Outcome::Count(3).into_bool().unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[test]
    fn operation_metadata() {
        let op = Operation::PurgeQueue {
            queue_name: QueueName::from("orders"),
        };
        assert_eq!(op.name(), "PurgeQueue");
        assert_eq!(op.queue_name().map(QueueName::as_str), Some("orders"));
        assert!(op.is_mutating());

        let op = Operation::GetQueuedMessage {
            id: QueueEntryId::new(4),
        };
        assert_eq!(op.message_id(), Some(QueueEntryId::new(4)));
        assert!(!op.is_mutating());
    }
}
