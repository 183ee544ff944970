//! The durable queues facade.

use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::future::BoxFuture;
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqliteConnection, SqlitePool,
};

use crate::{
    config::{Config, TransactionalMode},
    consumer::{ConsumeFromQueue, ConsumerRegistry, DurableQueueConsumer},
    db::{
        lock::SqliteFencedLockManager,
        message::{MessageStore, NewMessage},
    },
    error::Error,
    interceptor::{DurableQueuesInterceptor, InterceptorChain, Operation, Outcome, QueueMessage},
    lock::FencedLockManager,
    message::{
        Payload, QueueEntryId, QueueName, QueuedMessage, QueuedMessageCounts, QueueingSortOrder,
    },
    transaction::UnitOfWork,
};

/// Durable message queues stored in SQLite.
///
/// Cheap to clone. Clones share the connection pool, the interceptors and the registered
/// consumers.
#[derive(Clone)]
pub struct DurableQueues {
    inner: Arc<Inner>,
}

struct Inner {
    db: SqlitePool,
    config: Config,
    interceptors: RwLock<Vec<Arc<dyn DurableQueuesInterceptor>>>,
    consumers: Arc<ConsumerRegistry>,
    lock_manager: Option<Arc<dyn FencedLockManager>>,
}

#[bon::bon]
impl DurableQueues {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with().config(Config::default()).call().await
    }

    /// Open (or create) the database described by `config` and run migrations.
    ///
    /// A fenced lock manager is only consulted when the centralized message fetcher is
    /// enabled. Without an explicit one, locks are kept in the queue database.
    #[builder]
    pub async fn connect_with(
        config: Config,
        lock_manager: Option<Arc<dyn FencedLockManager>>,
    ) -> Result<Self, Error> {
        config.validate()?;

        let opts = if let Some(path) = config.db_path() {
            SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
        } else {
            SqliteConnectOptions::new().in_memory(true)
        }
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .locking_mode(SqliteLockingMode::Normal)
        .optimize_on_close(true, None)
        .auto_vacuum(SqliteAutoVacuum::Full)
        .busy_timeout(config.busy_timeout());

        // Every connection to `:memory:` is a separate database, so keep exactly one alive.
        let pool_options = if config.db_path().is_some() {
            SqlitePoolOptions::new().max_connections(config.max_connections)
        } else {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        };

        let pool = pool_options.connect_with(opts).await?;

        Self::from_parts(pool, config, lock_manager).await
    }

    /// Use an existing pool. Migrations are run against it.
    pub async fn new(pool: SqlitePool, config: Config) -> Result<Self, Error> {
        Self::from_parts(pool, config, None).await
    }

    async fn from_parts(
        pool: SqlitePool,
        config: Config,
        lock_manager: Option<Arc<dyn FencedLockManager>>,
    ) -> Result<Self, Error> {
        config.validate()?;
        sqlx::migrate!("./migrations").run(&pool).await?;

        let lock_manager = match lock_manager {
            Some(manager) => Some(manager),
            None if config.use_centralized_message_fetcher => {
                let manager: Arc<dyn FencedLockManager> = Arc::new(SqliteFencedLockManager::new(
                    pool.clone(),
                    config.centralized_fetcher_lock_lease(),
                ));
                Some(manager)
            }
            None => None,
        };

        tracing::debug!(
            db_path = config.db_path(),
            mode = %config.transactional_mode,
            "durable queues ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                db: pool,
                config,
                interceptors: RwLock::new(Vec::new()),
                consumers: Arc::new(papaya::HashMap::new()),
                lock_manager,
            }),
        })
    }
}

impl DurableQueues {
    pub fn pool(&self) -> &SqlitePool {
        &self.inner.db
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn transactional_mode(&self) -> TransactionalMode {
        self.inner.config.transactional_mode
    }

    pub(crate) fn lock_manager(&self) -> Option<Arc<dyn FencedLockManager>> {
        self.inner.lock_manager.clone()
    }

    pub async fn begin_unit_of_work(&self) -> Result<UnitOfWork, Error> {
        UnitOfWork::begin(self.pool()).await
    }

    /// Run operations inside `uow`. They commit or roll back with it.
    pub fn with_unit_of_work<'a>(&'a self, uow: &'a mut UnitOfWork) -> QueueSession<'a> {
        self.with_connection(uow.connection())
    }

    /// Run operations on `conn`, joining whatever transaction or savepoint is open on it.
    pub fn with_connection<'a>(&'a self, conn: &'a mut SqliteConnection) -> QueueSession<'a> {
        QueueSession {
            queues: self,
            conn: Some(conn),
        }
    }

    pub(crate) fn detached(&self) -> QueueSession<'_> {
        QueueSession {
            queues: self,
            conn: None,
        }
    }

    /// Append an interceptor. It runs inside all interceptors added before it.
    pub fn add_interceptor(&self, interceptor: Arc<dyn DurableQueuesInterceptor>) {
        self.inner
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    /// Remove a previously added interceptor. Returns `false` if it was not registered.
    pub fn remove_interceptor(&self, interceptor: &Arc<dyn DurableQueuesInterceptor>) -> bool {
        let mut interceptors = self
            .inner
            .interceptors
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = interceptors.len();
        interceptors.retain(|registered| !Arc::ptr_eq(registered, interceptor));
        interceptors.len() != before
    }

    pub fn interceptors(&self) -> Vec<Arc<dyn DurableQueuesInterceptor>> {
        self.inner
            .interceptors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Route `operation` through the interceptors and perform it.
    fn run<'a>(
        &'a self,
        conn: Option<&'a mut SqliteConnection>,
        operation: Operation,
    ) -> BoxFuture<'a, Result<Outcome, Error>> {
        Box::pin(async move {
            let interceptors = self.interceptors();
            let outcome = InterceptorChain::new(&interceptors, move |operation| {
                Box::pin(self.perform(conn, operation))
            })
            .proceed(operation)
            .await;
            outcome
        })
    }

    async fn perform(
        &self,
        conn: Option<&mut SqliteConnection>,
        operation: Operation,
    ) -> Result<Outcome, Error> {
        let operation = match operation {
            Operation::ConsumeFromQueue(registration) => {
                return Ok(Outcome::Consumer(self.register_consumer(registration).await?));
            }
            Operation::StopConsumingFromQueue { queue_name } => {
                return Ok(Outcome::Bool(self.unregister_consumer(&queue_name).await?));
            }
            other => other,
        };

        match conn {
            Some(conn) => apply(conn, operation).await,
            None if operation.is_mutating() => {
                if self.transactional_mode() == TransactionalMode::FullyTransactional {
                    return Err(Error::UnitOfWorkRequired {
                        operation: operation.name(),
                    });
                }

                let mut tx = self.pool().begin().await?;
                let outcome = apply(&mut tx, operation).await?;
                tx.commit().await?;
                Ok(outcome)
            }
            None => {
                let mut conn = self.pool().acquire().await?;
                apply(&mut conn, operation).await
            }
        }
    }

    async fn register_consumer(
        &self,
        registration: ConsumeFromQueue,
    ) -> Result<DurableQueueConsumer, Error> {
        if registration.parallel_consumers == 0 {
            return Err(Error::invalid_parameter(
                "parallel_consumers must be at least 1",
            ));
        }

        let queue_name = registration.queue_name.clone();
        let consumer = DurableQueueConsumer::new(
            queue_name.clone(),
            registration.parallel_consumers,
            registration.sort_order,
            Arc::downgrade(&self.inner.consumers),
        );

        let registered = {
            let guard = self.inner.consumers.guard();
            let inserted = self
                .inner
                .consumers
                .try_insert(queue_name.clone(), consumer.clone(), &guard)
                .is_ok();
            inserted
        };

        if !registered {
            return Err(Error::DuplicateConsumer { queue: queue_name });
        }

        consumer.start(self.clone(), registration).await;

        Ok(consumer)
    }

    async fn unregister_consumer(&self, queue_name: &QueueName) -> Result<bool, Error> {
        let consumer = {
            let guard = self.inner.consumers.guard();
            let consumer = self.inner.consumers.get(queue_name, &guard).cloned();
            consumer
        };

        match consumer {
            Some(consumer) => {
                consumer.stop().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Claim order of the consumer registered for `queue_name`, ascending when there is none.
    fn sort_order_for(&self, queue_name: &QueueName) -> QueueingSortOrder {
        let guard = self.inner.consumers.guard();
        let order = self
            .inner
            .consumers
            .get(queue_name, &guard)
            .map(DurableQueueConsumer::sort_order)
            .unwrap_or_default();
        order
    }

    fn consumers(&self) -> Vec<DurableQueueConsumer> {
        let guard = self.inner.consumers.guard();
        let consumers = self
            .inner
            .consumers
            .iter(&guard)
            .map(|(_, consumer)| consumer.clone())
            .collect();
        consumers
    }

    /// Start consuming `queue_name`. At most one consumer per queue name may be registered
    /// with a facade at any time.
    pub async fn consume_from_queue(
        &self,
        registration: ConsumeFromQueue,
    ) -> Result<DurableQueueConsumer, Error> {
        self.run(None, Operation::ConsumeFromQueue(registration))
            .await?
            .into_consumer()
    }

    /// Stop the consumer of `queue_name`, waiting for in-flight handlers. Returns `false` when
    /// no consumer was registered.
    pub async fn stop_consuming_from_queue(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<bool, Error> {
        self.run(
            None,
            Operation::StopConsumingFromQueue {
                queue_name: queue_name.into(),
            },
        )
        .await?
        .into_bool()
    }

    /// Names of the queues with a running consumer.
    pub fn get_active_queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<_> = self
            .consumers()
            .into_iter()
            .map(|consumer| consumer.queue_name().clone())
            .collect();
        names.sort();
        names
    }

    /// Stop every consumer. Returns the first error any of them stopped with.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut first_error = None;

        for consumer in self.consumers() {
            if let Err(e) = consumer.stop().await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn queue_message(&self, message: QueueMessage) -> Result<QueueEntryId, Error> {
        self.detached().queue_message(message).await
    }

    pub async fn queue_messages(
        &self,
        queue_name: impl Into<QueueName>,
        payloads: Vec<Payload>,
        delivery_delay: Option<Duration>,
    ) -> Result<Vec<QueueEntryId>, Error> {
        self.detached()
            .queue_messages(queue_name, payloads, delivery_delay)
            .await
    }

    pub async fn queue_message_as_dead_letter_message(
        &self,
        queue_name: impl Into<QueueName>,
        payload: Payload,
        cause: impl Into<String>,
    ) -> Result<QueueEntryId, Error> {
        self.detached()
            .queue_message_as_dead_letter_message(queue_name, payload, cause)
            .await
    }

    pub async fn retry_message(
        &self,
        id: QueueEntryId,
        cause: impl Into<String>,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached()
            .retry_message(id, cause, delivery_delay)
            .await
    }

    pub async fn mark_as_dead_letter_message(
        &self,
        id: QueueEntryId,
        cause: impl Into<String>,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached().mark_as_dead_letter_message(id, cause).await
    }

    pub async fn resurrect_dead_letter_message(
        &self,
        id: QueueEntryId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached()
            .resurrect_dead_letter_message(id, delivery_delay)
            .await
    }

    pub async fn acknowledge_message_as_handled(&self, id: QueueEntryId) -> Result<bool, Error> {
        self.detached().acknowledge_message_as_handled(id).await
    }

    pub async fn delete_message(&self, id: QueueEntryId) -> Result<bool, Error> {
        self.detached().delete_message(id).await
    }

    pub async fn get_queued_message(
        &self,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached().get_queued_message(id).await
    }

    pub async fn get_dead_letter_message(
        &self,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached().get_dead_letter_message(id).await
    }

    pub async fn get_next_message_ready_for_delivery(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.detached()
            .get_next_message_ready_for_delivery(queue_name)
            .await
    }

    pub async fn has_messages_queued_for(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<bool, Error> {
        self.detached().has_messages_queued_for(queue_name).await
    }

    pub async fn get_total_messages_queued_for(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<u64, Error> {
        self.detached()
            .get_total_messages_queued_for(queue_name)
            .await
    }

    pub async fn get_total_dead_letter_messages_queued_for(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<u64, Error> {
        self.detached()
            .get_total_dead_letter_messages_queued_for(queue_name)
            .await
    }

    pub async fn get_queued_message_counts_for(
        &self,
        queue_name: impl Into<QueueName>,
    ) -> Result<QueuedMessageCounts, Error> {
        self.detached()
            .get_queued_message_counts_for(queue_name)
            .await
    }

    pub async fn get_queued_messages(
        &self,
        queue_name: impl Into<QueueName>,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    ) -> Result<Vec<QueuedMessage>, Error> {
        self.detached()
            .get_queued_messages(queue_name, order, start_index, page_size)
            .await
    }

    pub async fn get_dead_letter_messages(
        &self,
        queue_name: impl Into<QueueName>,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    ) -> Result<Vec<QueuedMessage>, Error> {
        self.detached()
            .get_dead_letter_messages(queue_name, order, start_index, page_size)
            .await
    }

    /// Every queue name that currently has messages, queued or dead letter.
    pub async fn get_queue_names(&self) -> Result<Vec<QueueName>, Error> {
        self.detached().get_queue_names().await
    }

    pub async fn purge_queue(&self, queue_name: impl Into<QueueName>) -> Result<u64, Error> {
        self.detached().purge_queue(queue_name).await
    }
}

/// Queue operations bound to a connection.
///
/// Obtained from [`DurableQueues::with_unit_of_work`]. Every operation joins the unit of
/// work and takes effect only when it commits.
pub struct QueueSession<'a> {
    queues: &'a DurableQueues,
    conn: Option<&'a mut SqliteConnection>,
}

impl QueueSession<'_> {
    async fn run(&mut self, operation: Operation) -> Result<Outcome, Error> {
        self.queues
            .run(self.conn.as_deref_mut(), operation)
            .await
    }

    pub async fn queue_message(&mut self, message: QueueMessage) -> Result<QueueEntryId, Error> {
        self.run(Operation::QueueMessage(message)).await?.into_id()
    }

    /// Queue a batch. Every message shares the same delivery time.
    pub async fn queue_messages(
        &mut self,
        queue_name: impl Into<QueueName>,
        payloads: Vec<Payload>,
        delivery_delay: Option<Duration>,
    ) -> Result<Vec<QueueEntryId>, Error> {
        self.run(Operation::QueueMessages {
            queue_name: queue_name.into(),
            payloads,
            meta_data: HashMap::new(),
            delivery_delay,
        })
        .await?
        .into_ids()
    }

    pub async fn queue_message_as_dead_letter_message(
        &mut self,
        queue_name: impl Into<QueueName>,
        payload: Payload,
        cause: impl Into<String>,
    ) -> Result<QueueEntryId, Error> {
        self.run(Operation::QueueMessageAsDeadLetterMessage {
            queue_name: queue_name.into(),
            payload,
            meta_data: HashMap::new(),
            cause: cause.into(),
        })
        .await?
        .into_id()
    }

    /// Schedule a queued message for another delivery after `delivery_delay`.
    ///
    /// Returns `None` for an unknown id and fails with [`Error::AlreadyDeadLetter`] for a dead
    /// letter message.
    pub async fn retry_message(
        &mut self,
        id: QueueEntryId,
        cause: impl Into<String>,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.run(Operation::RetryMessage {
            id,
            cause: cause.into(),
            delivery_delay,
        })
        .await?
        .into_message()
    }

    pub async fn mark_as_dead_letter_message(
        &mut self,
        id: QueueEntryId,
        cause: impl Into<String>,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.run(Operation::MarkAsDeadLetterMessage {
            id,
            cause: cause.into(),
        })
        .await?
        .into_message()
    }

    /// Return a dead letter message to the queue with a fresh redelivery budget.
    ///
    /// Returns `None` for an unknown id and fails with [`Error::AlreadyQueued`] for a message
    /// that is not a dead letter.
    pub async fn resurrect_dead_letter_message(
        &mut self,
        id: QueueEntryId,
        delivery_delay: Duration,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.run(Operation::ResurrectDeadLetterMessage { id, delivery_delay })
            .await?
            .into_message()
    }

    /// Delete a handled message. `false` when it no longer exists.
    pub async fn acknowledge_message_as_handled(&mut self, id: QueueEntryId) -> Result<bool, Error> {
        self.run(Operation::AcknowledgeMessageAsHandled { id })
            .await?
            .into_bool()
    }

    pub async fn delete_message(&mut self, id: QueueEntryId) -> Result<bool, Error> {
        self.run(Operation::DeleteMessage { id }).await?.into_bool()
    }

    pub async fn get_queued_message(
        &mut self,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.run(Operation::GetQueuedMessage { id })
            .await?
            .into_message()
    }

    pub async fn get_dead_letter_message(
        &mut self,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        self.run(Operation::GetDeadLetterMessage { id })
            .await?
            .into_message()
    }

    /// The message the next claim on `queue_name` would receive. Does not claim it.
    ///
    /// Follows the sort order of the consumer registered for the queue with this facade.
    pub async fn get_next_message_ready_for_delivery(
        &mut self,
        queue_name: impl Into<QueueName>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let queue_name = queue_name.into();
        let order = self.queues.sort_order_for(&queue_name);
        self.run(Operation::GetNextMessageReadyForDelivery { queue_name, order })
        .await?
        .into_message()
    }

    pub async fn has_messages_queued_for(
        &mut self,
        queue_name: impl Into<QueueName>,
    ) -> Result<bool, Error> {
        self.run(Operation::HasMessagesQueuedFor {
            queue_name: queue_name.into(),
        })
        .await?
        .into_bool()
    }

    pub async fn get_total_messages_queued_for(
        &mut self,
        queue_name: impl Into<QueueName>,
    ) -> Result<u64, Error> {
        self.run(Operation::GetTotalMessagesQueuedFor {
            queue_name: queue_name.into(),
        })
        .await?
        .into_count()
    }

    pub async fn get_total_dead_letter_messages_queued_for(
        &mut self,
        queue_name: impl Into<QueueName>,
    ) -> Result<u64, Error> {
        self.run(Operation::GetTotalDeadLetterMessagesQueuedFor {
            queue_name: queue_name.into(),
        })
        .await?
        .into_count()
    }

    pub async fn get_queued_message_counts_for(
        &mut self,
        queue_name: impl Into<QueueName>,
    ) -> Result<QueuedMessageCounts, Error> {
        self.run(Operation::GetQueuedMessageCountsFor {
            queue_name: queue_name.into(),
        })
        .await?
        .into_counts()
    }

    pub async fn get_queued_messages(
        &mut self,
        queue_name: impl Into<QueueName>,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    ) -> Result<Vec<QueuedMessage>, Error> {
        self.run(Operation::GetQueuedMessages {
            queue_name: queue_name.into(),
            order,
            start_index,
            page_size,
        })
        .await?
        .into_messages()
    }

    pub async fn get_dead_letter_messages(
        &mut self,
        queue_name: impl Into<QueueName>,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    ) -> Result<Vec<QueuedMessage>, Error> {
        self.run(Operation::GetDeadLetterMessages {
            queue_name: queue_name.into(),
            order,
            start_index,
            page_size,
        })
        .await?
        .into_messages()
    }

    pub async fn get_queue_names(&mut self) -> Result<Vec<QueueName>, Error> {
        self.run(Operation::GetQueueNames)
            .await?
            .into_queue_names()
    }

    /// Delete every queued and dead letter message of `queue_name`. Returns how many were
    /// deleted.
    pub async fn purge_queue(&mut self, queue_name: impl Into<QueueName>) -> Result<u64, Error> {
        self.run(Operation::PurgeQueue {
            queue_name: queue_name.into(),
        })
        .await?
        .into_count()
    }
}

fn deliver_after(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>, Error> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| Error::invalid_parameter(format!("delivery delay {delay:?} is out of range")))
}

/// Perform a store operation on `conn`.
async fn apply(conn: &mut SqliteConnection, operation: Operation) -> Result<Outcome, Error> {
    let now = Utc::now();

    let outcome = match operation {
        Operation::QueueMessage(message) => {
            let next_delivery = deliver_after(now, message.delivery_delay.unwrap_or_default())?;
            let id = MessageStore::insert(
                conn,
                NewMessage {
                    queue_name: &message.queue_name,
                    payload: &message.payload,
                    meta_data: &message.meta_data,
                    cause_of_enqueuing: message.cause_of_enqueuing.as_deref(),
                },
                next_delivery,
                now,
            )
            .await?;

            tracing::debug!(
                queue = %message.queue_name,
                message_id = %id,
                payload_type = %message.payload.type_name,
                "queued message"
            );
            Outcome::Id(id)
        }
        Operation::QueueMessages {
            queue_name,
            payloads,
            meta_data,
            delivery_delay,
        } => {
            let next_delivery = deliver_after(now, delivery_delay.unwrap_or_default())?;
            let ids =
                MessageStore::insert_many(conn, &queue_name, &payloads, &meta_data, next_delivery, now)
                    .await?;

            tracing::debug!(queue = %queue_name, count = ids.len(), "queued messages");
            Outcome::Ids(ids)
        }
        Operation::QueueMessageAsDeadLetterMessage {
            queue_name,
            payload,
            meta_data,
            cause,
        } => {
            let id = MessageStore::insert_dead_letter(
                conn,
                NewMessage {
                    queue_name: &queue_name,
                    payload: &payload,
                    meta_data: &meta_data,
                    cause_of_enqueuing: None,
                },
                &cause,
                now,
            )
            .await?;

            tracing::debug!(queue = %queue_name, message_id = %id, "queued dead letter message");
            Outcome::Id(id)
        }
        Operation::RetryMessage {
            id,
            cause,
            delivery_delay,
        } => {
            let next_delivery = deliver_after(now, delivery_delay)?;
            Outcome::Message(MessageStore::retry(conn, id, &cause, next_delivery).await?)
        }
        Operation::MarkAsDeadLetterMessage { id, cause } => {
            Outcome::Message(MessageStore::mark_as_dead_letter(conn, id, &cause, now).await?)
        }
        Operation::ResurrectDeadLetterMessage { id, delivery_delay } => {
            let next_delivery = deliver_after(now, delivery_delay)?;
            let message = MessageStore::resurrect(conn, id, next_delivery).await?;
            if message.is_some() {
                tracing::info!(message_id = %id, "resurrected dead letter message");
            }
            Outcome::Message(message)
        }
        Operation::AcknowledgeMessageAsHandled { id } | Operation::DeleteMessage { id } => {
            Outcome::Bool(MessageStore::delete(conn, id).await?)
        }
        Operation::GetQueuedMessage { id } => {
            Outcome::Message(MessageStore::get_queued(conn, id).await?)
        }
        Operation::GetDeadLetterMessage { id } => {
            Outcome::Message(MessageStore::get_dead_letter(conn, id).await?)
        }
        Operation::GetNextMessageReadyForDelivery { queue_name, order } => {
            Outcome::Message(MessageStore::peek_next_ready(conn, &queue_name, order, now).await?)
        }
        Operation::HasMessagesQueuedFor { queue_name } => {
            Outcome::Bool(MessageStore::has_queued(conn, &queue_name).await?)
        }
        Operation::GetTotalMessagesQueuedFor { queue_name } => {
            Outcome::Count(MessageStore::count_queued(conn, &queue_name).await?)
        }
        Operation::GetTotalDeadLetterMessagesQueuedFor { queue_name } => {
            Outcome::Count(MessageStore::count_dead_letter(conn, &queue_name).await?)
        }
        Operation::GetQueuedMessageCountsFor { queue_name } => {
            Outcome::Counts(MessageStore::counts(conn, &queue_name).await?)
        }
        Operation::GetQueuedMessages {
            queue_name,
            order,
            start_index,
            page_size,
        } => Outcome::Messages(
            MessageStore::list(conn, &queue_name, false, order, start_index, page_size).await?,
        ),
        Operation::GetDeadLetterMessages {
            queue_name,
            order,
            start_index,
            page_size,
        } => Outcome::Messages(
            MessageStore::list(conn, &queue_name, true, order, start_index, page_size).await?,
        ),
        Operation::GetQueueNames => Outcome::QueueNames(MessageStore::queue_names(conn).await?),
        Operation::PurgeQueue { queue_name } => {
            let purged = MessageStore::purge(conn, &queue_name).await?;
            tracing::info!(queue = %queue_name, purged, "purged queue");
            Outcome::Count(purged)
        }
        Operation::ConsumeFromQueue(_) | Operation::StopConsumingFromQueue { .. } => {
            return Err(Error::internal(eyre::eyre!(
                "consumer registration is not a store operation"
            )));
        }
    };

    Ok(outcome)
}
