use snafu::Snafu;

use crate::message::{QueueEntryId, QueueName};

pub type Result<T, E = Error> = std::result::Result<T, E>;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Message store unavailable: {source}"))]
    StorageUnavailable {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error returned from database: {source}"))]
    Database {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display("Message {id} is already a dead letter message"))]
    AlreadyDeadLetter { id: QueueEntryId },

    #[snafu(display("Message {id} is not a dead letter message"))]
    AlreadyQueued { id: QueueEntryId },

    #[snafu(display("Handler failed for message {id}: {message}"))]
    HandlerFailure {
        id: QueueEntryId,
        message: String,
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display(
        "Message {id} exhausted its redelivery policy after {attempts} delivery attempts (maximum redeliveries {maximum})"
    ))]
    PolicyExhausted {
        id: QueueEntryId,
        attempts: u32,
        maximum: u32,
    },

    #[snafu(display("A consumer is already registered for queue {queue}"))]
    DuplicateConsumer { queue: QueueName },

    #[snafu(display("{operation} requires a unit of work in fully transactional mode"))]
    UnitOfWorkRequired { operation: &'static str },

    #[snafu(display("Payload serialization failed"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Invalid parameter: {message}"))]
    InvalidParameter { message: String },

    #[snafu(display("Internal error"))]
    Internal {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        match &source {
            sqlx::Error::RowNotFound => Self::NotFound {
                resource: "row".to_owned(),
            },
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::StorageUnavailable { source },
            sqlx::Error::Database(db) if is_contention(db.code().as_deref()) => {
                Self::StorageUnavailable { source }
            }
            _ => Self::Database { source },
        }
    }
}

/// SQLite reports extended result codes; the primary code is the low byte.
fn is_contention(code: Option<&str>) -> bool {
    code.and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
        .unwrap_or(false)
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::Internal { source: Some(e) }
    }
}

impl Error {
    pub fn internal(e: impl Into<eyre::Report>) -> Self {
        Self::Internal {
            source: Some(e.into()),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn handler_failure(id: QueueEntryId, source: eyre::Report) -> Self {
        Self::HandlerFailure {
            id,
            message: format!("{source:#}"),
            source: Some(source),
        }
    }

    /// Transient errors are worth retrying as a whole; everything else is a caller or
    /// configuration problem that will fail again the same way.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_are_transient() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, Error::StorageUnavailable { .. }));
        assert!(err.is_transient());

        assert!(Error::from(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn missing_row_is_not_found() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn busy_and_locked_codes() {
        assert!(is_contention(Some("5")));
        // SQLITE_BUSY_SNAPSHOT
        assert!(is_contention(Some("517")));
        assert!(is_contention(Some("6")));
        // SQLITE_CONSTRAINT_UNIQUE
        assert!(!is_contention(Some("2067")));
        assert!(!is_contention(None));
    }

    #[test]
    fn state_mismatch_is_permanent() {
        let err = Error::AlreadyDeadLetter {
            id: QueueEntryId::new(7),
        };
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "Message 7 is already a dead letter message");
    }
}
