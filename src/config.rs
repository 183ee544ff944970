use std::time::Duration;

use serde::Deserialize;

use crate::{db::lease_millis, error::Error};

/// How queue operations relate to the caller's database transactions.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionalMode {
    /// Every store operation commits on its own. A claimed message whose outcome is never
    /// resolved becomes deliverable again once the message handling timeout has elapsed.
    #[default]
    SingleOperationTransaction,
    /// Claim, handler side effects and outcome share one unit of work. Mutating operations
    /// must be issued through a [`crate::transaction::UnitOfWork`].
    FullyTransactional,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Database file. When absent an in-memory database is used.
    pub db_path: Option<String>,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub transactional_mode: TransactionalMode,
    pub message_handling_timeout_ms: u64,
    pub polling_interval_ms: u64,
    pub max_polling_interval_ms: u64,
    /// On an empty poll the interval grows by `polling_interval * factor`.
    pub polling_delay_interval_increment_factor: f64,
    pub use_centralized_message_fetcher: bool,
    pub centralized_fetcher_lock_lease_ms: u64,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("ANCHORQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> Option<&str> {
        self.db_path.as_deref()
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn message_handling_timeout(&self) -> Duration {
        Duration::from_millis(self.message_handling_timeout_ms)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn max_polling_interval(&self) -> Duration {
        Duration::from_millis(self.max_polling_interval_ms)
    }

    pub fn centralized_fetcher_lock_lease(&self) -> Duration {
        Duration::from_millis(self.centralized_fetcher_lock_lease_ms)
    }

    /// Reject settings that would let a claim or a fetcher lock expire as soon as it is
    /// taken.
    pub fn validate(&self) -> Result<(), Error> {
        lease_millis("message_handling_timeout_ms", self.message_handling_timeout())?;
        if self.use_centralized_message_fetcher {
            lease_millis(
                "centralized_fetcher_lock_lease_ms",
                self.centralized_fetcher_lock_lease(),
            )?;
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            max_connections: 10,
            busy_timeout_ms: 5_000,
            transactional_mode: TransactionalMode::default(),
            message_handling_timeout_ms: 30_000,
            polling_interval_ms: 100,
            max_polling_interval_ms: 2_000,
            polling_delay_interval_increment_factor: 0.5,
            use_centralized_message_fetcher: false,
            centralized_fetcher_lock_lease_ms: 10_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.db_path(), None);
        assert_eq!(
            config.transactional_mode,
            TransactionalMode::SingleOperationTransaction
        );
        assert_eq!(config.message_handling_timeout(), Duration::from_secs(30));
        assert_eq!(config.polling_interval(), Duration::from_millis(100));
        assert_eq!(config.max_polling_interval(), Duration::from_secs(2));
        assert_eq!(config.polling_delay_interval_increment_factor, 0.5);
        assert!(!config.use_centralized_message_fetcher);
    }

    #[test]
    fn env_overrides() {
        let vars = vec![
            ("ANCHORQ_DB_PATH".to_owned(), "/tmp/queues.db".to_owned()),
            (
                "ANCHORQ_TRANSACTIONAL_MODE".to_owned(),
                "fully_transactional".to_owned(),
            ),
            (
                "ANCHORQ_MESSAGE_HANDLING_TIMEOUT_MS".to_owned(),
                "1500".to_owned(),
            ),
        ];

        let config: Config = envy::prefixed("ANCHORQ_").from_iter(vars).unwrap();

        assert_eq!(config.db_path(), Some("/tmp/queues.db"));
        assert_eq!(
            config.transactional_mode,
            TransactionalMode::FullyTransactional
        );
        assert_eq!(config.message_handling_timeout_ms, 1500);
        // untouched fields keep their defaults
        assert_eq!(config.max_polling_interval_ms, 2_000);
    }

    #[test]
    fn handling_timeout_must_be_a_usable_lease() {
        assert!(Config::default().validate().is_ok());

        let zero = Config {
            message_handling_timeout_ms: 0,
            ..Config::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(Error::InvalidParameter { .. })
        ));

        let huge = Config {
            message_handling_timeout_ms: u64::MAX,
            ..Config::default()
        };
        assert!(matches!(
            huge.validate(),
            Err(Error::InvalidParameter { .. })
        ));
    }

    #[test]
    fn fetcher_lease_only_checked_when_centralized() {
        let config = Config {
            centralized_fetcher_lock_lease_ms: 0,
            ..Config::default()
        };
        assert!(config.validate().is_ok());

        let centralized = Config {
            use_centralized_message_fetcher: true,
            ..config
        };
        assert!(centralized.validate().is_err());
    }

    #[test]
    fn mode_from_str() {
        assert_eq!(
            "single_operation_transaction"
                .parse::<TransactionalMode>()
                .unwrap(),
            TransactionalMode::SingleOperationTransaction
        );
        assert_eq!(
            TransactionalMode::FullyTransactional.to_string(),
            "fully_transactional"
        );
    }
}
