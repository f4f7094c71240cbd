//! Exponential backoff for 429/503-style responses (spec §4.4), transcribed
//! from the original's `ExponentialBackoff`: delay doubles each attempt up
//! to a ceiling, and the attempt counter resets itself after a minute of
//! disuse so a long-idle limiter doesn't start back at the ceiling.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);
pub const DEFAULT_FACTOR: f64 = 2.0;
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

struct Inner {
    attempts: i32,
    last_reset: Instant,
}

pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    reset_after: Duration,
    inner: Mutex<Inner>,
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self::with_config(base_delay, max_delay, DEFAULT_FACTOR, DEFAULT_RESET_AFTER)
    }

    /// Same as [`Self::new`] but with the growth factor and idle-reset
    /// window exposed, so callers can drive them from
    /// `Config::backoff_factor`/`Config::backoff_reset_after_secs`.
    pub fn with_config(base_delay: Duration, max_delay: Duration, factor: f64, reset_after: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            factor,
            reset_after,
            inner: Mutex::new(Inner {
                attempts: 0,
                last_reset: Instant::now(),
            }),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("backoff mutex poisoned");
        inner.attempts = 0;
        inner.last_reset = Instant::now();
    }

    /// Returns the delay for the current attempt and advances the counter.
    pub fn get_delay(&self) -> Duration {
        let mut inner = self.inner.lock().expect("backoff mutex poisoned");
        let now = Instant::now();
        if now.duration_since(inner.last_reset) > self.reset_after {
            inner.attempts = 0;
        }

        let delay_secs = self.base_delay.as_secs_f64() * self.factor.powi(inner.attempts);
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));
        inner.attempts += 1;
        inner.last_reset = now;
        debug!(attempt = inner.attempts, delay_secs = delay.as_secs_f64(), "backoff delay computed");
        delay
    }

    pub async fn sleep(&self) {
        let delay = self.get_delay();
        tokio::time::sleep(delay).await;
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn delay_doubles_until_ceiling() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(backoff.get_delay(), Duration::from_secs(1));
        assert_eq!(backoff.get_delay(), Duration::from_secs(2));
        assert_eq!(backoff.get_delay(), Duration::from_secs(4));
        assert_eq!(backoff.get_delay(), Duration::from_secs(8));
        assert_eq!(backoff.get_delay(), Duration::from_secs(10));
        assert_eq!(backoff.get_delay(), Duration::from_secs(10));
    }

    #[test]
    fn reset_restarts_from_base_delay() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(300));
        backoff.get_delay();
        backoff.get_delay();
        backoff.reset();
        assert_eq!(backoff.get_delay(), Duration::from_secs(1));
    }

    #[test]
    fn default_matches_spec_constants() {
        let backoff = ExponentialBackoff::default();
        assert_eq!(backoff.get_delay(), Duration::from_secs(1));
    }
}
