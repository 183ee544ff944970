use std::time::Duration;

/// Adaptive polling interval for one consumer loop.
///
/// Every empty poll stretches the interval by `base * increment_factor` up to `max`. A poll
/// that finds a message resets it to `base` and asks for the next poll right away, so a
/// backlog drains at full speed.
#[derive(Clone, Debug)]
pub struct PollingOptimizer {
    base: Duration,
    max: Duration,
    increment: Duration,
    current: Duration,
}

impl PollingOptimizer {
    pub fn new(base: Duration, max: Duration, increment_factor: f64) -> Self {
        let max = max.max(base);
        let increment = if increment_factor.is_finite() && increment_factor > 0.0 {
            Duration::from_nanos((base.as_nanos() as f64 * increment_factor).round() as u64)
        } else {
            Duration::ZERO
        };

        Self {
            base,
            max,
            increment,
            current: base,
        }
    }

    /// Interval the next empty poll will wait.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record an empty poll and return how long to wait before the next one.
    pub fn message_not_found(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_add(self.increment).min(self.max);
        delay
    }

    /// Record a successful poll and return how long to wait before the next one.
    pub fn message_found(&mut self) -> Duration {
        self.current = self.base;
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn misses_grow_linearly_to_max() {
        let mut optimizer = PollingOptimizer::new(ms(100), ms(300), 0.5);

        assert_eq!(optimizer.message_not_found(), ms(100));
        assert_eq!(optimizer.message_not_found(), ms(150));
        assert_eq!(optimizer.message_not_found(), ms(200));
        assert_eq!(optimizer.message_not_found(), ms(250));
        assert_eq!(optimizer.message_not_found(), ms(300));
        assert_eq!(optimizer.message_not_found(), ms(300));
    }

    #[test]
    fn hit_resets_to_base() {
        let mut optimizer = PollingOptimizer::new(ms(100), ms(2_000), 0.5);

        for _ in 0..10 {
            optimizer.message_not_found();
        }
        assert!(optimizer.current() > ms(100));

        assert_eq!(optimizer.message_found(), Duration::ZERO);
        assert_eq!(optimizer.current(), ms(100));
        assert_eq!(optimizer.message_not_found(), ms(100));
    }

    #[test]
    fn zero_factor_keeps_base_interval() {
        let mut optimizer = PollingOptimizer::new(ms(50), ms(2_000), 0.0);

        for _ in 0..5 {
            assert_eq!(optimizer.message_not_found(), ms(50));
        }
    }

    #[test]
    fn max_below_base_is_raised_to_base() {
        let mut optimizer = PollingOptimizer::new(ms(500), ms(100), 1.0);

        assert_eq!(optimizer.message_not_found(), ms(500));
        assert_eq!(optimizer.message_not_found(), ms(500));
    }
}
