//! Durable message queues on SQLite.
//!
//! Messages are persisted in a single table and handed to competing consumers with
//! at-least-once delivery. Failed deliveries are retried according to a
//! [`RedeliveryPolicy`] and end up as dead letter messages once it is exhausted.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, FmtSubscriber};

pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod handler;
pub mod interceptor;
pub mod lock;
pub mod message;
pub mod polling;
pub mod queues;
pub mod redelivery;
pub mod transaction;

pub use config::{Config, TransactionalMode};
pub use consumer::{ConsumeFromQueue, DurableQueueConsumer};
pub use error::{Error, Result};
pub use handler::{handler_fn, HandlerContext, PatternMatchingHandler, QueuedMessageHandler};
pub use interceptor::{DurableQueuesInterceptor, Operation, Outcome, QueueMessage};
pub use message::{
    MessagePayload, Payload, QueueEntryId, QueueName, QueuedMessage, QueuedMessageCounts,
    QueueingSortOrder,
};
pub use queues::{DurableQueues, QueueSession};
pub use redelivery::RedeliveryPolicy;
pub use transaction::UnitOfWork;

/// Install a global `tracing` subscriber filtered by `ANCHORQ_LOG`.
///
/// Debug builds log in a human readable format, release builds as JSON.
pub fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::builder()
        .with_env_var("ANCHORQ_LOG")
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    #[cfg(debug_assertions)]
    FmtSubscriber::builder()
        .pretty()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    #[cfg(not(debug_assertions))]
    FmtSubscriber::builder()
        .json()
        .with_env_filter(filter)
        .finish()
        .try_init()?;

    Ok(())
}
