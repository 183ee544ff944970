//! Queue consumers: the polling workers that claim messages, run the handler and resolve
//! the outcome.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use futures_util::FutureExt;
use rand::Rng;
use sqlx::{Connection, SqliteConnection};
use tokio::{
    sync::{Mutex, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    config::TransactionalMode,
    db::message::MessageStore,
    error::Error,
    handler::{HandlerContext, QueuedMessageHandler},
    lock::{FencedLock, FencedLockManager},
    message::{QueueName, QueuedMessage, QueueingSortOrder},
    polling::PollingOptimizer,
    queues::{DurableQueues, QueueSession},
    redelivery::{DeadLetterReason, RedeliveryAction, RedeliveryPolicy},
    transaction::UnitOfWork,
};

/// Registration of a consumer for one queue.
#[derive(bon::Builder)]
pub struct ConsumeFromQueue {
    #[builder(into)]
    pub queue_name: QueueName,
    pub redelivery_policy: RedeliveryPolicy,
    /// Number of messages handled concurrently.
    #[builder(default = 1)]
    pub parallel_consumers: usize,
    pub handler: Arc<dyn QueuedMessageHandler>,
    /// Overrides the configured base polling interval.
    pub polling_interval: Option<Duration>,
    /// Overrides the configured maximum polling interval.
    pub max_polling_interval: Option<Duration>,
    #[builder(default)]
    pub sort_order: QueueingSortOrder,
}

impl fmt::Debug for ConsumeFromQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumeFromQueue")
            .field("queue_name", &self.queue_name)
            .field("redelivery_policy", &self.redelivery_policy)
            .field("parallel_consumers", &self.parallel_consumers)
            .field("polling_interval", &self.polling_interval)
            .field("max_polling_interval", &self.max_polling_interval)
            .field("sort_order", &self.sort_order)
            .finish_non_exhaustive()
    }
}

pub(crate) type ConsumerRegistry = papaya::HashMap<QueueName, DurableQueueConsumer>;

/// Handle to a running consumer.
///
/// Clones refer to the same consumer. Stopping it through any clone stops it for all.
#[derive(Clone)]
pub struct DurableQueueConsumer {
    inner: Arc<ConsumerState>,
}

struct ConsumerState {
    id: Uuid,
    queue_name: QueueName,
    parallel_consumers: usize,
    sort_order: QueueingSortOrder,
    shutdown: CancellationToken,
    interrupt: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<Result<(), Error>>>>,
    live_tasks: AtomicUsize,
    registry: Weak<ConsumerRegistry>,
}

impl fmt::Debug for DurableQueueConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableQueueConsumer")
            .field("id", &self.inner.id)
            .field("queue_name", &self.inner.queue_name)
            .field("parallel_consumers", &self.inner.parallel_consumers)
            .field("running", &self.is_running())
            .finish()
    }
}

impl DurableQueueConsumer {
    pub(crate) fn new(
        queue_name: QueueName,
        parallel_consumers: usize,
        sort_order: QueueingSortOrder,
        registry: Weak<ConsumerRegistry>,
    ) -> Self {
        Self {
            inner: Arc::new(ConsumerState {
                id: Uuid::new_v4(),
                queue_name,
                parallel_consumers,
                sort_order,
                shutdown: CancellationToken::new(),
                interrupt: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                live_tasks: AtomicUsize::new(0),
                registry,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn queue_name(&self) -> &QueueName {
        &self.inner.queue_name
    }

    pub fn parallel_consumers(&self) -> usize {
        self.inner.parallel_consumers
    }

    pub fn sort_order(&self) -> QueueingSortOrder {
        self.inner.sort_order
    }

    /// `false` once the consumer was stopped, or every one of its tasks failed.
    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    pub(crate) async fn start(&self, queues: DurableQueues, operation: ConsumeFromQueue) {
        let config = queues.config();
        let mode = config.transactional_mode;

        let centralized = config.use_centralized_message_fetcher;
        if centralized && mode == TransactionalMode::FullyTransactional {
            tracing::warn!(
                queue = %self.inner.queue_name,
                "centralized message fetcher is not available in fully transactional mode, using polling workers"
            );
        }
        let centralized = centralized && mode == TransactionalMode::SingleOperationTransaction;

        let runtime = Arc::new(ConsumerRuntime {
            queue_name: operation.queue_name,
            handler: operation.handler,
            policy: operation.redelivery_policy,
            sort_order: operation.sort_order,
            parallel_consumers: operation.parallel_consumers,
            handling_timeout: config.message_handling_timeout(),
            polling_interval: operation
                .polling_interval
                .unwrap_or_else(|| config.polling_interval()),
            max_polling_interval: operation
                .max_polling_interval
                .unwrap_or_else(|| config.max_polling_interval()),
            increment_factor: config.polling_delay_interval_increment_factor,
            fetch_lock_lease: config.centralized_fetcher_lock_lease(),
            lock_manager: queues.lock_manager(),
            mode,
            shutdown: self.inner.shutdown.clone(),
            interrupt: self.inner.interrupt.clone(),
            queues,
        });

        let mut tasks = self.inner.tasks.lock().await;

        if centralized {
            let span = tracing::info_span!("fetcher", queue = %runtime.queue_name);
            tasks.push(tokio::spawn(
                self.supervise(runtime.clone().run_fetcher())
                    .instrument(span),
            ));
        } else {
            for worker in 0..runtime.parallel_consumers {
                let span = tracing::info_span!("consumer", queue = %runtime.queue_name, worker);
                tasks.push(tokio::spawn(
                    self.supervise(runtime.clone().run_worker())
                        .instrument(span),
                ));
            }
        }

        tracing::info!(
            queue = %runtime.queue_name,
            parallel_consumers = runtime.parallel_consumers,
            centralized,
            mode = %mode,
            "started consuming"
        );
    }

    /// Track a consumer task. When the last one ends in an error the consumer stops and
    /// leaves the registry, so the queue can be consumed again.
    fn supervise(
        &self,
        task: impl Future<Output = Result<(), Error>> + Send + 'static,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let consumer = self.clone();
        consumer.inner.live_tasks.fetch_add(1, Ordering::SeqCst);

        async move {
            let result = task.await;
            let remaining = consumer.inner.live_tasks.fetch_sub(1, Ordering::SeqCst) - 1;

            if result.is_err() && remaining == 0 && !consumer.inner.shutdown.is_cancelled() {
                tracing::error!(
                    queue = %consumer.inner.queue_name,
                    "every consumer task failed, stopping consumer"
                );
                consumer.inner.shutdown.cancel();
                consumer.deregister();
            }

            result
        }
    }

    /// Stop polling and wait for in-flight handlers to finish.
    ///
    /// Returns the first fatal error any worker stopped with.
    pub async fn stop(&self) -> Result<(), Error> {
        self.shutdown(false).await
    }

    /// Stop polling and interrupt in-flight handlers.
    ///
    /// Interrupted messages are not resolved. They become deliverable again once their claim
    /// expires, or immediately in fully transactional mode where the claim is rolled back.
    pub async fn stop_now(&self) -> Result<(), Error> {
        self.shutdown(true).await
    }

    async fn shutdown(&self, interrupt: bool) -> Result<(), Error> {
        self.inner.shutdown.cancel();
        if interrupt {
            self.inner.interrupt.cancel();
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);

        let mut first_error = None;
        for task in tasks {
            if let Err(e) = flatten(task.await) {
                first_error.get_or_insert(e);
            }
        }

        self.deregister();

        tracing::info!(queue = %self.inner.queue_name, "stopped consuming");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn deregister(&self) {
        let Some(registry) = self.inner.registry.upgrade() else {
            return;
        };

        let guard = registry.guard();
        let registered = registry
            .get(&self.inner.queue_name, &guard)
            .is_some_and(|consumer| consumer.id() == self.id());
        if registered {
            registry.remove(&self.inner.queue_name, &guard);
        }
    }
}

fn flatten(joined: Result<Result<(), Error>, JoinError>) -> Result<(), Error> {
    joined.map_err(Error::internal)?
}

enum Polled {
    Handled,
    Empty,
    Stopped,
}

struct ConsumerRuntime {
    queues: DurableQueues,
    queue_name: QueueName,
    handler: Arc<dyn QueuedMessageHandler>,
    policy: RedeliveryPolicy,
    sort_order: QueueingSortOrder,
    parallel_consumers: usize,
    handling_timeout: Duration,
    polling_interval: Duration,
    max_polling_interval: Duration,
    increment_factor: f64,
    fetch_lock_lease: Duration,
    lock_manager: Option<Arc<dyn FencedLockManager>>,
    mode: TransactionalMode,
    shutdown: CancellationToken,
    interrupt: CancellationToken,
}

impl ConsumerRuntime {
    fn polling_optimizer(&self) -> PollingOptimizer {
        PollingOptimizer::new(
            self.polling_interval,
            self.max_polling_interval,
            self.increment_factor,
        )
    }

    async fn run_worker(self: Arc<Self>) -> Result<(), Error> {
        let mut polling = self.polling_optimizer();
        let mut backoff = RetryBackoff::default();

        while !self.shutdown.is_cancelled() {
            let polled = match self.mode {
                TransactionalMode::SingleOperationTransaction => self.poll().await,
                TransactionalMode::FullyTransactional => self.poll_in_unit_of_work().await,
            };

            let delay = match polled {
                Ok(Polled::Handled) => {
                    backoff.reset();
                    polling.message_found()
                }
                Ok(Polled::Empty) => {
                    backoff.reset();
                    polling.message_not_found()
                }
                Ok(Polled::Stopped) => break,
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "message store unavailable"
                    );
                    delay
                }
                Err(e) => {
                    tracing::error!(error = %e, "consumer worker failed");
                    return Err(e);
                }
            };

            if !self.pause(delay).await {
                break;
            }
        }

        tracing::debug!("consumer worker stopped");
        Ok(())
    }

    /// Wait before the next poll. Returns `false` once the consumer is stopping.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.shutdown.is_cancelled();
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn claim(&self, conn: &mut SqliteConnection) -> Result<Option<QueuedMessage>, Error> {
        MessageStore::claim_next_ready(
            conn,
            &self.queue_name,
            self.handling_timeout,
            self.sort_order,
            Utc::now(),
        )
        .await
    }

    async fn claim_from_pool(&self) -> Result<Option<QueuedMessage>, Error> {
        let mut conn = self.queues.pool().acquire().await?;
        self.claim(&mut conn).await
    }

    async fn poll(&self) -> Result<Polled, Error> {
        let claimed = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(Polled::Stopped),
            claimed = self.claim_from_pool() => claimed?,
        };

        let Some(message) = claimed else {
            return Ok(Polled::Empty);
        };

        self.deliver(message).await?;

        Ok(Polled::Handled)
    }

    /// Handle a message claimed in its own operation, then resolve it the same way.
    async fn deliver(&self, message: QueuedMessage) -> Result<(), Error> {
        let handled = tokio::select! {
            _ = self.interrupt.cancelled() => {
                tracing::warn!(
                    message_id = %message.id,
                    "handler interrupted, message is redelivered once its claim expires"
                );
                return Ok(());
            }
            handled = self.invoke(&message, HandlerContext::new(&self.queues, None)) => handled,
        };

        let mut session = self.queues.detached();
        match handled {
            Ok(()) => self.acknowledge(&mut session, &message).await,
            Err(report) => self.resolve_failure(&mut session, &message, report).await,
        }
    }

    /// Claim, handle and resolve inside one unit of work.
    ///
    /// The handler runs within a savepoint, so a failing handler only rolls back its own
    /// side effects. The claim and the retry or dead letter decision then commit together.
    async fn poll_in_unit_of_work(&self) -> Result<Polled, Error> {
        let mut uow = UnitOfWork::begin(self.queues.pool()).await?;

        let claimed = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(Polled::Stopped),
            claimed = self.claim(uow.connection()) => claimed?,
        };

        let Some(message) = claimed else {
            uow.rollback().await?;
            return Ok(Polled::Empty);
        };

        let handled = {
            let mut savepoint = uow.connection().begin().await?;

            let handled = tokio::select! {
                _ = self.interrupt.cancelled() => {
                    tracing::warn!(message_id = %message.id, "handler interrupted, rolling back");
                    return Ok(Polled::Stopped);
                }
                handled = self.invoke(&message, HandlerContext::new(&self.queues, Some(&mut *savepoint))) => handled,
            };

            match &handled {
                Ok(()) => savepoint.commit().await?,
                Err(_) => savepoint.rollback().await?,
            }

            handled
        };

        {
            let mut session = self.queues.with_unit_of_work(&mut uow);
            match handled {
                Ok(()) => self.acknowledge(&mut session, &message).await?,
                Err(report) => self.resolve_failure(&mut session, &message, report).await?,
            }
        }

        uow.commit().await?;

        Ok(Polled::Handled)
    }

    async fn invoke(&self, message: &QueuedMessage, ctx: HandlerContext<'_>) -> eyre::Result<()> {
        match AssertUnwindSafe(self.handler.handle(message, ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(eyre::eyre!("handler panicked: {}", panic_message(&*panic))),
        }
    }

    async fn acknowledge(
        &self,
        session: &mut QueueSession<'_>,
        message: &QueuedMessage,
    ) -> Result<(), Error> {
        if session.acknowledge_message_as_handled(message.id).await? {
            tracing::debug!(
                message_id = %message.id,
                attempts = message.delivery_attempts,
                "message handled"
            );
        } else {
            tracing::warn!(
                message_id = %message.id,
                "message was resolved elsewhere while it was being handled"
            );
        }

        Ok(())
    }

    async fn resolve_failure(
        &self,
        session: &mut QueueSession<'_>,
        message: &QueuedMessage,
        report: eyre::Report,
    ) -> Result<(), Error> {
        let decision = self.policy.decide(message.delivery_attempts, &report);
        let cause = format!("{report:#}");
        let failure = Error::handler_failure(message.id, report);

        let resolved = match decision.action {
            RedeliveryAction::RetryAfterDelay => {
                tracing::info!(
                    message_id = %message.id,
                    attempts = message.delivery_attempts,
                    retry_in_ms = decision.delay.as_millis() as u64,
                    error = %failure,
                    "scheduling redelivery"
                );
                session
                    .retry_message(message.id, &cause, decision.delay)
                    .await
            }
            RedeliveryAction::MarkAsDeadLetter(reason) => {
                let error = match reason {
                    DeadLetterReason::PolicyExhausted => Error::PolicyExhausted {
                        id: message.id,
                        attempts: message.delivery_attempts,
                        maximum: self.policy.maximum_number_of_redeliveries(),
                    },
                    DeadLetterReason::NonRetryable => failure,
                };
                tracing::warn!(
                    message_id = %message.id,
                    attempts = message.delivery_attempts,
                    %reason,
                    error = %error,
                    "marking message as dead letter"
                );
                session.mark_as_dead_letter_message(message.id, &cause).await
            }
        };

        match resolved {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                tracing::warn!(
                    message_id = %message.id,
                    "message was removed before its failure could be recorded"
                );
                Ok(())
            }
            Err(Error::AlreadyDeadLetter { id }) => {
                tracing::warn!(message_id = %id, "message was already marked as dead letter");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Single fetch loop claiming on behalf of up to `parallel_consumers` handler tasks.
    async fn run_fetcher(self: Arc<Self>) -> Result<(), Error> {
        let permits = Arc::new(Semaphore::new(self.parallel_consumers));
        let mut handlers = JoinSet::new();
        let mut polling = self.polling_optimizer();
        let mut backoff = RetryBackoff::default();
        let mut lock = None;
        let mut outcome = Ok(());

        'fetch: while !self.shutdown.is_cancelled() {
            while let Some(joined) = handlers.try_join_next() {
                if let Err(e) = flatten(joined) {
                    tracing::error!(error = %e, "message handling failed");
                    outcome = Err(e);
                    break 'fetch;
                }
            }

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let fetched = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                fetched = self.fetch(&mut lock) => fetched,
            };

            let delay = match fetched {
                Ok(Some(message)) => {
                    let runtime = self.clone();
                    handlers.spawn(
                        async move {
                            let _permit = permit;
                            match runtime.deliver(message).await {
                                Err(e) if e.is_transient() => {
                                    tracing::warn!(
                                        error = %e,
                                        "message store unavailable, message is redelivered once its claim expires"
                                    );
                                    Ok(())
                                }
                                delivered => delivered,
                            }
                        }
                        .in_current_span(),
                    );
                    backoff.reset();
                    polling.message_found()
                }
                Ok(None) => {
                    backoff.reset();
                    polling.message_not_found()
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "message store unavailable"
                    );
                    delay
                }
                Err(e) => {
                    tracing::error!(error = %e, "message fetcher failed");
                    outcome = Err(e);
                    break;
                }
            };

            if !self.pause(delay).await {
                break;
            }
        }

        while let Some(joined) = handlers.join_next().await {
            if let Err(e) = flatten(joined) {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        if let (Some(manager), Some(held)) = (&self.lock_manager, lock) {
            if let Err(e) = manager.release(&held).await {
                tracing::warn!(error = %e, lock = held.name(), "failed to release fetcher lock");
            }
        }

        tracing::debug!("message fetcher stopped");
        outcome
    }

    async fn fetch(&self, lock: &mut Option<FencedLock>) -> Result<Option<QueuedMessage>, Error> {
        if let Some(manager) = &self.lock_manager {
            if !self.hold_fetch_lock(manager.as_ref(), lock).await? {
                return Ok(None);
            }
        }

        self.claim_from_pool().await
    }

    /// Make sure this process owns the fetch lock of the queue, renewing the lease once half
    /// of it has passed.
    async fn hold_fetch_lock(
        &self,
        manager: &dyn FencedLockManager,
        lock: &mut Option<FencedLock>,
    ) -> Result<bool, Error> {
        let renew_margin = TimeDelta::milliseconds((self.fetch_lock_lease.as_millis() / 2) as i64);

        if let Some(held) = lock.as_ref() {
            if held.expires_at() - Utc::now() > renew_margin {
                return Ok(true);
            }
        }

        let lock_name = format!("anchorq-fetcher-{}", self.queue_name);
        let acquired = manager.try_acquire_lock(&lock_name).await?;

        match (lock.as_ref(), acquired.as_ref()) {
            (None, Some(now_held)) => {
                tracing::info!(lock = %lock_name, token = now_held.token(), "acquired fetcher lock")
            }
            (Some(_), None) => tracing::warn!(lock = %lock_name, "lost fetcher lock"),
            _ => {}
        }

        *lock = acquired;
        Ok(lock.is_some())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Jittered exponential backoff for transient store errors.
struct RetryBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        let initial = Duration::from_millis(100);
        Self {
            initial,
            max: Duration::from_secs(5),
            current: initial,
        }
    }
}

impl RetryBackoff {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);

        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        delay.mul_f64(jitter)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_with_jitter_and_caps() {
        let mut backoff = RetryBackoff::default();

        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));

        let second = backoff.next_delay();
        assert!(second >= Duration::from_millis(180) && second <= Duration::from_millis(220));

        for _ in 0..20 {
            backoff.next_delay();
        }
        assert!(backoff.next_delay() <= Duration::from_millis(5_500));

        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(110));
    }

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(&*payload), "static message");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned message"));
        assert_eq!(panic_message(&*payload), "owned message");

        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(&*payload), "unknown panic payload");
    }

    #[test]
    fn registration_defaults() {
        let registration = ConsumeFromQueue::builder()
            .queue_name("orders")
            .redelivery_policy(RedeliveryPolicy::fixed_backoff(Duration::from_millis(10), 2))
            .handler(Arc::new(crate::handler::handler_fn(|_| async { Ok(()) })))
            .build();

        assert_eq!(registration.parallel_consumers, 1);
        assert_eq!(registration.sort_order, QueueingSortOrder::Asc);
        assert!(registration.polling_interval.is_none());
    }
}
