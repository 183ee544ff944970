//! Persistence for queued messages.
//!
//! Every function takes a plain [`SqliteConnection`], so callers decide whether a call runs
//! on its own or as part of a larger transaction.

use std::{collections::HashMap, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use super::{from_millis, lease_millis, to_millis};
use crate::{
    error::Error,
    message::{
        Payload, QueueEntryId, QueueName, QueuedMessage, QueuedMessageCounts, QueueingSortOrder,
    },
};

#[derive(FromRow)]
struct QueuedMessageRow {
    id: i64,
    queue_name: String,
    message_payload: Vec<u8>,
    message_payload_type: String,
    meta_data: String,
    added_ts: i64,
    next_delivery_ts: i64,
    delivery_ts: Option<i64>,
    delivery_attempts: i64,
    total_delivery_attempts: i64,
    redelivery_attempts: i64,
    last_delivery_error: Option<String>,
    is_being_delivered: bool,
    is_dead_letter_message: bool,
    marked_as_dead_letter_ts: Option<i64>,
    cause_of_enqueuing: Option<String>,
}

impl TryFrom<QueuedMessageRow> for QueuedMessage {
    type Error = Error;

    fn try_from(row: QueuedMessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: QueueEntryId::new(row.id),
            queue_name: QueueName::new(row.queue_name),
            payload: Payload::new(row.message_payload_type, row.message_payload),
            meta_data: serde_json::from_str(&row.meta_data)?,
            added_timestamp: from_millis(row.added_ts)?,
            next_delivery_timestamp: from_millis(row.next_delivery_ts)?,
            delivery_timestamp: row.delivery_ts.map(from_millis).transpose()?,
            delivery_attempts: row.delivery_attempts as u32,
            total_delivery_attempts: row.total_delivery_attempts as u32,
            redelivery_attempts: row.redelivery_attempts as u32,
            last_delivery_error: row.last_delivery_error,
            is_being_delivered: row.is_being_delivered,
            is_dead_letter_message: row.is_dead_letter_message,
            marked_as_dead_letter_at: row.marked_as_dead_letter_ts.map(from_millis).transpose()?,
            cause_of_enqueuing: row.cause_of_enqueuing,
        })
    }
}

fn into_message(row: Option<QueuedMessageRow>) -> Result<Option<QueuedMessage>, Error> {
    row.map(QueuedMessage::try_from).transpose()
}

/// A message about to be inserted.
pub struct NewMessage<'a> {
    pub queue_name: &'a QueueName,
    pub payload: &'a Payload,
    pub meta_data: &'a HashMap<String, String>,
    pub cause_of_enqueuing: Option<&'a str>,
}

pub struct MessageStore;

impl MessageStore {
    pub async fn insert(
        db: &mut SqliteConnection,
        message: NewMessage<'_>,
        next_delivery: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QueueEntryId, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO queued_messages
                (queue_name, message_payload, message_payload_type, meta_data,
                 added_ts, next_delivery_ts, cause_of_enqueuing)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(message.queue_name.as_str())
        .bind(message.payload.data.as_ref())
        .bind(&message.payload.type_name)
        .bind(serde_json::to_string(message.meta_data)?)
        .bind(to_millis(now))
        .bind(to_millis(next_delivery))
        .bind(message.cause_of_enqueuing)
        .fetch_one(&mut *db)
        .await?;

        Ok(QueueEntryId::new(id))
    }

    /// Insert a batch of messages. All of them share `next_delivery`; the returned ids are in
    /// payload order.
    pub async fn insert_many(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
        payloads: &[Payload],
        meta_data: &HashMap<String, String>,
        next_delivery: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueueEntryId>, Error> {
        let mut ids = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let message = NewMessage {
                queue_name,
                payload,
                meta_data,
                cause_of_enqueuing: None,
            };
            ids.push(Self::insert(&mut *db, message, next_delivery, now).await?);
        }

        Ok(ids)
    }

    pub async fn insert_dead_letter(
        db: &mut SqliteConnection,
        message: NewMessage<'_>,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<QueueEntryId, Error> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO queued_messages
                (queue_name, message_payload, message_payload_type, meta_data,
                 added_ts, next_delivery_ts, cause_of_enqueuing, last_delivery_error,
                 is_dead_letter_message, marked_as_dead_letter_ts)
             VALUES ($1, $2, $3, $4, $5, $5, $6, $7, TRUE, $5)
             RETURNING id",
        )
        .bind(message.queue_name.as_str())
        .bind(message.payload.data.as_ref())
        .bind(&message.payload.type_name)
        .bind(serde_json::to_string(message.meta_data)?)
        .bind(to_millis(now))
        .bind(message.cause_of_enqueuing)
        .bind(cause)
        .fetch_one(&mut *db)
        .await?;

        Ok(QueueEntryId::new(id))
    }

    pub async fn get_queued(
        db: &mut SqliteConnection,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        Self::get(db, id, false).await
    }

    pub async fn get_dead_letter(
        db: &mut SqliteConnection,
        id: QueueEntryId,
    ) -> Result<Option<QueuedMessage>, Error> {
        Self::get(db, id, true).await
    }

    async fn get(
        db: &mut SqliteConnection,
        id: QueueEntryId,
        dead_letter: bool,
    ) -> Result<Option<QueuedMessage>, Error> {
        let row = sqlx::query_as::<_, QueuedMessageRow>(
            "SELECT * FROM queued_messages WHERE id = $1 AND is_dead_letter_message = $2",
        )
        .bind(id)
        .bind(dead_letter)
        .fetch_optional(db)
        .await?;

        into_message(row)
    }

    /// Atomically claim the next message that is ready for delivery.
    ///
    /// Fails with [`Error::InvalidParameter`] for a zero or out of range `handling_timeout`.
    ///
    /// Selection and update happen in one statement, which SQLite executes under its single
    /// writer lock, so two claimants can never both receive the same row. The claim is
    /// recorded as a lease: `next_delivery_ts` moves to `now + handling_timeout`, which keeps
    /// the message invisible to other claimants until the lease runs out.
    pub async fn claim_next_ready(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
        handling_timeout: Duration,
        order: QueueingSortOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let now = to_millis(now);
        let lease_expiry =
            now.saturating_add(lease_millis("message handling timeout", handling_timeout)?);

        let row = sqlx::query_as::<_, QueuedMessageRow>(&format!(
            "UPDATE queued_messages
             SET delivery_attempts = delivery_attempts + 1,
                 total_delivery_attempts = total_delivery_attempts + 1,
                 is_being_delivered = TRUE,
                 delivery_ts = $2,
                 next_delivery_ts = $3
             WHERE id = (
                 SELECT id FROM queued_messages
                 WHERE queue_name = $1
                   AND is_dead_letter_message = FALSE
                   AND next_delivery_ts <= $2
                 ORDER BY id {}
                 LIMIT 1
             )
             AND is_dead_letter_message = FALSE
             AND next_delivery_ts <= $2
             RETURNING *",
            order.sql()
        ))
        .bind(queue_name.as_str())
        .bind(now)
        .bind(lease_expiry)
        .fetch_optional(db)
        .await?;

        let message = into_message(row)?;

        if let Some(message) = &message {
            tracing::trace!(
                queue = %queue_name,
                message_id = %message.id,
                attempts = message.delivery_attempts,
                "claimed message"
            );
        }

        Ok(message)
    }

    /// The message [`Self::claim_next_ready`] would return, without claiming it.
    pub async fn peek_next_ready(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
        order: QueueingSortOrder,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let row = sqlx::query_as::<_, QueuedMessageRow>(&format!(
            "SELECT * FROM queued_messages
             WHERE queue_name = $1
               AND is_dead_letter_message = FALSE
               AND next_delivery_ts <= $2
             ORDER BY id {}
             LIMIT 1",
            order.sql()
        ))
        .bind(queue_name.as_str())
        .bind(to_millis(now))
        .fetch_optional(db)
        .await?;

        into_message(row)
    }

    pub async fn retry(
        db: &mut SqliteConnection,
        id: QueueEntryId,
        cause: &str,
        next_delivery: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let row = sqlx::query_as::<_, QueuedMessageRow>(
            "UPDATE queued_messages
             SET next_delivery_ts = $2,
                 last_delivery_error = $3,
                 redelivery_attempts = redelivery_attempts + 1,
                 is_being_delivered = FALSE,
                 delivery_ts = NULL
             WHERE id = $1 AND is_dead_letter_message = FALSE
             RETURNING *",
        )
        .bind(id)
        .bind(to_millis(next_delivery))
        .bind(cause)
        .fetch_optional(&mut *db)
        .await?;

        match into_message(row)? {
            Some(message) => Ok(Some(message)),
            None => match Self::dead_letter_state(db, id).await? {
                Some(true) => Err(Error::AlreadyDeadLetter { id }),
                _ => Ok(None),
            },
        }
    }

    pub async fn mark_as_dead_letter(
        db: &mut SqliteConnection,
        id: QueueEntryId,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let row = sqlx::query_as::<_, QueuedMessageRow>(
            "UPDATE queued_messages
             SET is_dead_letter_message = TRUE,
                 marked_as_dead_letter_ts = $2,
                 last_delivery_error = $3,
                 is_being_delivered = FALSE,
                 delivery_ts = NULL
             WHERE id = $1 AND is_dead_letter_message = FALSE
             RETURNING *",
        )
        .bind(id)
        .bind(to_millis(now))
        .bind(cause)
        .fetch_optional(&mut *db)
        .await?;

        match into_message(row)? {
            Some(message) => Ok(Some(message)),
            None => match Self::dead_letter_state(db, id).await? {
                Some(true) => Err(Error::AlreadyDeadLetter { id }),
                _ => Ok(None),
            },
        }
    }

    /// Move a dead letter message back to the queue with a fresh redelivery budget.
    pub async fn resurrect(
        db: &mut SqliteConnection,
        id: QueueEntryId,
        next_delivery: DateTime<Utc>,
    ) -> Result<Option<QueuedMessage>, Error> {
        let row = sqlx::query_as::<_, QueuedMessageRow>(
            "UPDATE queued_messages
             SET is_dead_letter_message = FALSE,
                 marked_as_dead_letter_ts = NULL,
                 next_delivery_ts = $2,
                 delivery_attempts = 0,
                 redelivery_attempts = 0,
                 is_being_delivered = FALSE,
                 delivery_ts = NULL
             WHERE id = $1 AND is_dead_letter_message = TRUE
             RETURNING *",
        )
        .bind(id)
        .bind(to_millis(next_delivery))
        .fetch_optional(&mut *db)
        .await?;

        match into_message(row)? {
            Some(message) => Ok(Some(message)),
            None => match Self::dead_letter_state(db, id).await? {
                Some(false) => Err(Error::AlreadyQueued { id }),
                _ => Ok(None),
            },
        }
    }

    pub async fn delete(db: &mut SqliteConnection, id: QueueEntryId) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM queued_messages WHERE id = $1")
            .bind(id)
            .execute(db)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn dead_letter_state(
        db: &mut SqliteConnection,
        id: QueueEntryId,
    ) -> Result<Option<bool>, Error> {
        Ok(sqlx::query_scalar(
            "SELECT is_dead_letter_message FROM queued_messages WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(db)
        .await?)
    }

    pub async fn has_queued(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
    ) -> Result<bool, Error> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM queued_messages
                WHERE queue_name = $1 AND is_dead_letter_message = FALSE
             )",
        )
        .bind(queue_name.as_str())
        .fetch_one(db)
        .await?)
    }

    pub async fn count_queued(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
    ) -> Result<u64, Error> {
        Self::count(db, queue_name, false).await
    }

    pub async fn count_dead_letter(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
    ) -> Result<u64, Error> {
        Self::count(db, queue_name, true).await
    }

    async fn count(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
        dead_letter: bool,
    ) -> Result<u64, Error> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM queued_messages
             WHERE queue_name = $1 AND is_dead_letter_message = $2",
        )
        .bind(queue_name.as_str())
        .bind(dead_letter)
        .fetch_one(db)
        .await?;

        Ok(count as u64)
    }

    pub async fn counts(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
    ) -> Result<QueuedMessageCounts, Error> {
        let (queued, dead_letter): (i64, i64) = sqlx::query_as(
            "SELECT
                COALESCE(SUM(CASE WHEN is_dead_letter_message THEN 0 ELSE 1 END), 0),
                COALESCE(SUM(CASE WHEN is_dead_letter_message THEN 1 ELSE 0 END), 0)
             FROM queued_messages
             WHERE queue_name = $1",
        )
        .bind(queue_name.as_str())
        .fetch_one(db)
        .await?;

        Ok(QueuedMessageCounts {
            queue_name: queue_name.clone(),
            number_of_queued_messages: queued as u64,
            number_of_dead_letter_messages: dead_letter as u64,
        })
    }

    /// One page of either the queued or the dead letter messages of a queue.
    pub async fn list(
        db: &mut SqliteConnection,
        queue_name: &QueueName,
        dead_letter: bool,
        order: QueueingSortOrder,
        start_index: u64,
        page_size: u64,
    ) -> Result<Vec<QueuedMessage>, Error> {
        let query = format!(
            "SELECT * FROM queued_messages
             WHERE queue_name = $1 AND is_dead_letter_message = $2
             ORDER BY id {}
             LIMIT $3 OFFSET $4",
            order.sql()
        );

        let mut stream = sqlx::query_as::<_, QueuedMessageRow>(&query)
            .bind(queue_name.as_str())
            .bind(dead_letter)
            .bind(page_size as i64)
            .bind(start_index as i64)
            .fetch(db);

        let mut messages = Vec::new();

        while let Some(row) = stream.next().await.transpose()? {
            messages.push(QueuedMessage::try_from(row)?);
        }

        Ok(messages)
    }

    pub async fn queue_names(db: &mut SqliteConnection) -> Result<Vec<QueueName>, Error> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT queue_name FROM queued_messages ORDER BY queue_name")
                .fetch_all(db)
                .await?;

        Ok(names.into_iter().map(QueueName::new).collect())
    }

    /// Delete every message of the queue, queued and dead letter alike.
    pub async fn purge(db: &mut SqliteConnection, queue_name: &QueueName) -> Result<u64, Error> {
        let result = sqlx::query("DELETE FROM queued_messages WHERE queue_name = $1")
            .bind(queue_name.as_str())
            .execute(db)
            .await?;

        Ok(result.rows_affected())
    }
}
