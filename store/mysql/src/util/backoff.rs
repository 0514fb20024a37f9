use std::time::Duration;

use rand::Rng;

/// Facilitate sleeping between retries of a conflicted transaction. The
/// wait before retry attempt `n` is `n * base` plus a uniformly random
/// jitter from `[0, jitter)`, i.e. it grows linearly, not exponentially.
/// The jitter spreads out retries of transactions that conflicted with
/// each other in the first place.
pub struct RetryBackoff {
    pub attempt: u64,
    base: Duration,
    jitter: Duration,
}

impl RetryBackoff {
    pub fn new(base: Duration, jitter: Duration) -> Self {
        RetryBackoff {
            attempt: 0,
            base,
            jitter,
        }
    }

    /// Record that we are about to make another attempt and sleep for the
    /// appropriate amount of time. Only suspends the calling thread.
    pub fn sleep(&mut self) {
        std::thread::sleep(self.next_attempt());
    }

    /// The delay for the current attempt, including a fresh jitter sample.
    pub fn delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base.saturating_mul(self.attempt as u32) + jitter
    }

    fn next_attempt(&mut self) -> Duration {
        self.attempt += 1;
        self.delay()
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly_with_bounded_jitter() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(1000), Duration::from_millis(1000));
        for n in 1u64..=5 {
            backoff.attempt = n;
            let delay = backoff.delay().as_millis() as u64;
            assert!(delay >= n * 1000, "attempt {}: delay {} too small", n, delay);
            assert!(delay < n * 1000 + 1000, "attempt {}: delay {} too large", n, delay);
        }
    }

    #[test]
    fn zero_jitter_is_deterministic() {
        let mut backoff = RetryBackoff::new(Duration::from_millis(100), Duration::ZERO);
        backoff.attempt = 3;
        assert_eq!(backoff.delay(), Duration::from_millis(300));
        backoff.reset();
        assert_eq!(backoff.delay(), Duration::ZERO);
    }
}
