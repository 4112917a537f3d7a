use std::time::Duration;

use rand::Rng;

/// Exponential backoff for polling loops.
/// Each call to `next_interval` returns the current wait time and
/// doubles the nominal interval up to the configured maximum; `reset`
/// returns the schedule to the initial interval.
/// Jitter, when enabled, draws the returned wait uniformly from
/// half to one-and-a-half times the nominal interval.
/// See: https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff {
            initial,
            max,
            multiplier: 2.0,
            jitter: false,
            current: initial,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Returns the schedule to the initial interval.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Returns the wait time for the current attempt and advances
    /// the schedule.
    pub fn next_interval(&mut self) -> Duration {
        let nominal = self.current;
        self.current = self
            .current
            .mul_f64(self.multiplier)
            .min(self.max);
        if self.jitter {
            nominal
                .mul_f64(rand::thread_rng().gen_range(0.5..1.5))
                .min(self.max)
        } else {
            nominal
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_doubles_up_to_the_maximum_interval() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_millis(100));

        assert_eq!(backoff.next_interval(), Duration::from_millis(10));
        assert_eq!(backoff.next_interval(), Duration::from_millis(20));
        assert_eq!(backoff.next_interval(), Duration::from_millis(40));
        assert_eq!(backoff.next_interval(), Duration::from_millis(80));
        assert_eq!(backoff.next_interval(), Duration::from_millis(100));
        // Capped from here on.
        assert_eq!(backoff.next_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_reset_returns_to_the_initial_interval() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(60));

        backoff.next_interval();
        backoff.next_interval();
        backoff.reset();

        assert_eq!(backoff.next_interval(), Duration::from_millis(10));
    }

    #[test_log::test]
    fn test_jitter_stays_within_the_expected_bounds() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(60))
            .with_jitter();

        for _ in 0..50 {
            backoff.reset();
            let wait = backoff.next_interval();
            assert!(wait >= Duration::from_millis(50));
            assert!(wait < Duration::from_millis(150));
        }
    }
}
