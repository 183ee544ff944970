//! Distributed fenced locks.
//!
//! A fenced lock is held by one owner at a time for a bounded lease. Every change of owner
//! hands out a strictly larger fencing token, so a stale holder that lost its lease can be
//! told apart from the current one by comparing tokens.

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;

use crate::error::Error;

/// A lease on a named lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FencedLock {
    name: String,
    owner: String,
    token: i64,
    expires_at: DateTime<Utc>,
}

impl FencedLock {
    pub fn new(name: String, owner: String, token: i64, expires_at: DateTime<Utc>) -> Self {
        Self {
            name,
            owner,
            token,
            expires_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Monotonic per lock name. Increases whenever the lock changes owner.
    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Acquires and releases fenced locks on behalf of a single owner.
pub trait FencedLockManager: Send + Sync + 'static {
    /// Identity this manager acquires locks as.
    fn owner(&self) -> &str;

    /// Try to acquire `lock_name`, or extend the lease when this owner already holds it.
    ///
    /// Returns `None` while another owner holds an unexpired lease.
    fn try_acquire_lock<'a>(
        &'a self,
        lock_name: &'a str,
    ) -> BoxFuture<'a, Result<Option<FencedLock>, Error>>;

    /// Give up a lock. Returns `false` when the lease had already passed to someone else.
    fn release<'a>(&'a self, lock: &'a FencedLock) -> BoxFuture<'a, Result<bool, Error>>;
}
