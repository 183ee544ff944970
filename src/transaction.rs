//! Unit of work demarcation.

use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::error::Error;

/// An open database transaction that queue operations and handler side effects can join.
///
/// Dropping a unit of work without committing rolls it back.
pub struct UnitOfWork {
    tx: Transaction<'static, Sqlite>,
}

impl UnitOfWork {
    pub async fn begin(pool: &SqlitePool) -> Result<Self, Error> {
        Ok(Self {
            tx: pool.begin().await?,
        })
    }

    /// The connection the transaction runs on. Use it for the caller's own statements.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), Error> {
        Ok(self.tx.commit().await?)
    }

    pub async fn rollback(self) -> Result<(), Error> {
        Ok(self.tx.rollback().await?)
    }
}
