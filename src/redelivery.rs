//! Retry and dead letter decisions for failed message handling.
//!
//! A [`RedeliveryPolicy`] is a pure function of the number of delivery attempts, the handler
//! error and its own configuration. It keeps no state between calls.

use std::{fmt, sync::Arc, time::Duration};

/// How the delay before the next delivery grows with the number of failed attempts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BackoffStrategy {
    Fixed {
        delay: Duration,
    },
    /// `initial + n * increment`, capped at `max`.
    Linear {
        initial: Duration,
        increment: Duration,
        max: Duration,
    },
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay before redelivery number `n + 1`, counting from zero.
    pub fn delay_for(&self, n: u32) -> Duration {
        match *self {
            Self::Fixed { delay } => delay,
            Self::Linear {
                initial,
                increment,
                max,
            } => initial.saturating_add(increment.saturating_mul(n)).min(max),
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let nanos =
                    initial.as_nanos() as f64 * multiplier.powi(n.min(i32::MAX as u32) as i32);
                if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
                    max
                } else {
                    Duration::from_nanos(nanos.max(0.0).round() as u64)
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum ErrorClassification {
    /// Subject to the redelivery limit.
    Retryable,
    /// Dead letter on the first failure.
    NonRetryable,
    /// Retried regardless of the redelivery limit.
    AlwaysRetry,
}

/// Sorts handler errors into [`ErrorClassification`]s.
pub trait ErrorClassifier: Send + Sync + 'static {
    fn classify(&self, error: &eyre::Report) -> ErrorClassification;
}

impl<F> ErrorClassifier for F
where
    F: Fn(&eyre::Report) -> ErrorClassification + Send + Sync + 'static,
{
    fn classify(&self, error: &eyre::Report) -> ErrorClassification {
        self(error)
    }
}

/// Classifier that treats any error chain containing an `E` as non-retryable.
pub fn non_retryable<E>() -> impl ErrorClassifier
where
    E: std::error::Error + Send + Sync + 'static,
{
    |error: &eyre::Report| {
        if error.chain().any(|cause| cause.is::<E>()) {
            ErrorClassification::NonRetryable
        } else {
            ErrorClassification::Retryable
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum DeadLetterReason {
    NonRetryable,
    PolicyExhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RedeliveryAction {
    RetryAfterDelay,
    MarkAsDeadLetter(DeadLetterReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedeliveryDecision {
    pub action: RedeliveryAction,
    /// Zero when the message goes to the dead letter state.
    pub delay: Duration,
}

impl RedeliveryDecision {
    fn retry(delay: Duration) -> Self {
        Self {
            action: RedeliveryAction::RetryAfterDelay,
            delay,
        }
    }

    fn dead_letter(reason: DeadLetterReason) -> Self {
        Self {
            action: RedeliveryAction::MarkAsDeadLetter(reason),
            delay: Duration::ZERO,
        }
    }

    pub fn is_dead_letter(&self) -> bool {
        matches!(self.action, RedeliveryAction::MarkAsDeadLetter(_))
    }
}

#[derive(Clone)]
pub struct RedeliveryPolicy {
    strategy: BackoffStrategy,
    maximum_number_of_redeliveries: u32,
    classifier: Option<Arc<dyn ErrorClassifier>>,
}

impl fmt::Debug for RedeliveryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedeliveryPolicy")
            .field("strategy", &self.strategy)
            .field(
                "maximum_number_of_redeliveries",
                &self.maximum_number_of_redeliveries,
            )
            .field("classifier", &self.classifier.is_some())
            .finish()
    }
}

impl RedeliveryPolicy {
    pub fn new(strategy: BackoffStrategy, maximum_number_of_redeliveries: u32) -> Self {
        Self {
            strategy,
            maximum_number_of_redeliveries,
            classifier: None,
        }
    }

    pub fn fixed_backoff(delay: Duration, maximum_number_of_redeliveries: u32) -> Self {
        Self::new(BackoffStrategy::Fixed { delay }, maximum_number_of_redeliveries)
    }

    pub fn linear_backoff(
        initial: Duration,
        increment: Duration,
        max: Duration,
        maximum_number_of_redeliveries: u32,
    ) -> Self {
        Self::new(
            BackoffStrategy::Linear {
                initial,
                increment,
                max,
            },
            maximum_number_of_redeliveries,
        )
    }

    pub fn exponential_backoff(
        initial: Duration,
        multiplier: f64,
        max: Duration,
        maximum_number_of_redeliveries: u32,
    ) -> Self {
        Self::new(
            BackoffStrategy::Exponential {
                initial,
                multiplier,
                max,
            },
            maximum_number_of_redeliveries,
        )
    }

    pub fn with_classifier(mut self, classifier: impl ErrorClassifier) -> Self {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    pub fn strategy(&self) -> &BackoffStrategy {
        &self.strategy
    }

    pub fn maximum_number_of_redeliveries(&self) -> u32 {
        self.maximum_number_of_redeliveries
    }

    /// Decide what happens to a message whose handler failed on its
    /// `delivery_attempts`-th delivery.
    pub fn decide(&self, delivery_attempts: u32, error: &eyre::Report) -> RedeliveryDecision {
        let classification = self
            .classifier
            .as_ref()
            .map(|classifier| classifier.classify(error))
            .unwrap_or(ErrorClassification::Retryable);

        let delay = self.strategy.delay_for(delivery_attempts.saturating_sub(1));

        match classification {
            ErrorClassification::NonRetryable => {
                RedeliveryDecision::dead_letter(DeadLetterReason::NonRetryable)
            }
            ErrorClassification::AlwaysRetry => RedeliveryDecision::retry(delay),
            ErrorClassification::Retryable
                if delivery_attempts > self.maximum_number_of_redeliveries =>
            {
                RedeliveryDecision::dead_letter(DeadLetterReason::PolicyExhausted)
            }
            ErrorClassification::Retryable => RedeliveryDecision::retry(delay),
        }
    }
}
