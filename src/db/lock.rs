//! SQLite implementation of [`FencedLockManager`].

use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;

use super::{from_millis, lease_millis, to_millis};
use crate::{
    error::Error,
    lock::{FencedLock, FencedLockManager},
};

/// Fenced locks stored in the `fenced_locks` table of the queue database.
///
/// Several processes sharing the database file each run their own manager with a distinct
/// owner id; the table row decides who currently holds a lock.
#[derive(Clone)]
pub struct SqliteFencedLockManager {
    pool: SqlitePool,
    owner: String,
    lease: Duration,
}

impl SqliteFencedLockManager {
    /// A manager with a random owner id.
    pub fn new(pool: SqlitePool, lease: Duration) -> Self {
        Self::with_owner(pool, uuid::Uuid::new_v4().to_string(), lease)
    }

    pub fn with_owner(pool: SqlitePool, owner: impl Into<String>, lease: Duration) -> Self {
        Self {
            pool,
            owner: owner.into(),
            lease,
        }
    }

    async fn acquire(&self, lock_name: &str) -> Result<Option<FencedLock>, Error> {
        let now = to_millis(Utc::now());
        let expires = now.saturating_add(lease_millis("fenced lock lease", self.lease)?);

        // The holder extends its own live lease under the same token. Any other takeover,
        // including the holder coming back after expiry or release, bumps the token.
        let row: Option<(i64, i64)> = sqlx::query_as(
            "INSERT INTO fenced_locks
                (lock_name, owner, fencing_token, acquired_ts, last_confirmed_ts, expires_ts)
             VALUES ($1, $2, 1, $3, $3, $4)
             ON CONFLICT (lock_name) DO UPDATE SET
                fencing_token = CASE
                    WHEN fenced_locks.owner = excluded.owner AND fenced_locks.expires_ts > $3
                    THEN fenced_locks.fencing_token
                    ELSE fenced_locks.fencing_token + 1
                END,
                acquired_ts = CASE
                    WHEN fenced_locks.owner = excluded.owner AND fenced_locks.expires_ts > $3
                    THEN fenced_locks.acquired_ts
                    ELSE excluded.acquired_ts
                END,
                owner = excluded.owner,
                last_confirmed_ts = excluded.last_confirmed_ts,
                expires_ts = excluded.expires_ts
             WHERE fenced_locks.owner = excluded.owner OR fenced_locks.expires_ts <= $3
             RETURNING fencing_token, expires_ts",
        )
        .bind(lock_name)
        .bind(&self.owner)
        .bind(now)
        .bind(expires)
        .fetch_optional(&self.pool)
        .await?;

        let Some((token, expires_ts)) = row else {
            tracing::trace!(lock = lock_name, owner = %self.owner, "lock held elsewhere");
            return Ok(None);
        };

        tracing::trace!(lock = lock_name, owner = %self.owner, token, "lock acquired");

        Ok(Some(FencedLock::new(
            lock_name.to_owned(),
            self.owner.clone(),
            token,
            from_millis(expires_ts)?,
        )))
    }

    async fn release_lock(&self, lock: &FencedLock) -> Result<bool, Error> {
        // Expire rather than delete so the fencing token keeps counting up.
        let result = sqlx::query(
            "UPDATE fenced_locks
             SET expires_ts = 0
             WHERE lock_name = $1 AND owner = $2 AND fencing_token = $3",
        )
        .bind(lock.name())
        .bind(lock.owner())
        .bind(lock.token())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

impl FencedLockManager for SqliteFencedLockManager {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn try_acquire_lock<'a>(
        &'a self,
        lock_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<FencedLock>, Error>> {
        Box::pin(self.acquire(lock_name))
    }

    fn release<'a>(&'a self, lock: &'a FencedLock) -> BoxFuture<'a, Result<bool, Error>> {
        Box::pin(self.release_lock(lock))
    }
}
