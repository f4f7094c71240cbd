//! Two-dimension token-bucket rate limiter (spec §4.4), translated from the
//! original's `TokenBucketRateLimiter`: a daily counter refilled once per
//! `day_seconds`, plus a sliding-window cycle limit maintained as a FIFO of
//! acquisition instants, evicted lazily on each check.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use tracing::debug;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_per_cycle: u32,
    pub cycle_window: Duration,
    pub max_per_day: u32,
    pub day_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_cycle: 20,
            cycle_window: Duration::from_secs(60),
            max_per_day: 100,
            day_window: Duration::from_secs(86_400),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterStatus {
    pub daily_remaining: u32,
    pub daily_limit: u32,
    pub cycle_remaining: u32,
    pub cycle_limit: u32,
    pub cycle_queue_size: usize,
}

struct Inner {
    daily_tokens: u32,
    daily_last_refill: Instant,
    cycle_queue: VecDeque<Instant>,
    cycle_window_start: Instant,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(Inner {
                daily_tokens: config.max_per_day,
                daily_last_refill: now,
                cycle_queue: VecDeque::new(),
                cycle_window_start: now,
            }),
        }
    }

    /// Non-blocking attempt to consume a token from both dimensions.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
        self.refill_daily(&mut inner);
        self.cleanup_cycle(&mut inner);

        let can_consume = inner.daily_tokens > 0 && inner.cycle_queue.len() < self.config.max_per_cycle as usize;
        if !can_consume {
            debug!("rate limit token unavailable");
            return false;
        }

        let now = Instant::now();
        if inner.cycle_queue.is_empty() {
            inner.cycle_window_start = now;
        }
        inner.cycle_queue.push_back(now);
        inner.daily_tokens -= 1;
        true
    }

    /// Blocks (cooperatively, via `tokio::time::sleep`) until a token is
    /// available, then consumes it.
    pub async fn acquire(&self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.next_wait();
            tokio::time::sleep(wait).await;
        }
    }

    pub fn get_status(&self) -> RateLimiterStatus {
        let mut inner = self.inner.lock().expect("rate limiter mutex poisoned");
        self.refill_daily(&mut inner);
        self.cleanup_cycle(&mut inner);
        RateLimiterStatus {
            daily_remaining: inner.daily_tokens,
            daily_limit: self.config.max_per_day,
            cycle_remaining: self.config.max_per_cycle.saturating_sub(inner.cycle_queue.len() as u32),
            cycle_limit: self.config.max_per_cycle,
            cycle_queue_size: inner.cycle_queue.len(),
        }
    }

    fn refill_daily(&self, inner: &mut Inner) {
        let now = Instant::now();
        if now.duration_since(inner.daily_last_refill) >= self.config.day_window {
            inner.daily_tokens = self.config.max_per_day;
            inner.daily_last_refill = now;
        }
    }

    fn cleanup_cycle(&self, inner: &mut Inner) {
        let now = Instant::now();
        while let Some(&front) = inner.cycle_queue.front() {
            if now.duration_since(front) >= self.config.cycle_window {
                inner.cycle_queue.pop_front();
            } else {
                break;
            }
        }
        if inner.cycle_queue.is_empty() {
            inner.cycle_window_start = now;
        }
    }

    fn next_wait(&self) -> Duration {
        let inner = self.inner.lock().expect("rate limiter mutex poisoned");
        let now = Instant::now();
        let mut wait = Duration::from_secs(1);
        if inner.cycle_queue.len() >= self.config.max_per_cycle as usize {
            let next_window = inner.cycle_window_start + self.config.cycle_window;
            wait = wait.max(next_window.saturating_duration_since(now));
        } else if inner.daily_tokens == 0 {
            let tomorrow = inner.daily_last_refill + self.config.day_window;
            wait = wait.max(tomorrow.saturating_duration_since(now));
        }
        wait
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allows_up_to_cycle_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_per_cycle: 3,
            cycle_window: Duration::from_secs(60),
            max_per_day: 100,
            day_window: Duration::from_secs(86_400),
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn daily_limit_caps_independent_of_cycle() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_per_cycle: 1000,
            cycle_window: Duration::from_secs(60),
            max_per_day: 2,
            day_window: Duration::from_secs(86_400),
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn status_reflects_remaining_capacity() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_per_cycle: 5,
            cycle_window: Duration::from_secs(60),
            max_per_day: 10,
            day_window: Duration::from_secs(86_400),
        });
        limiter.try_acquire();
        limiter.try_acquire();
        let status = limiter.get_status();
        assert_eq!(status.cycle_queue_size, 2);
        assert_eq!(status.cycle_remaining, 3);
        assert_eq!(status.daily_remaining, 8);
    }

    #[tokio::test]
    async fn acquire_waits_for_cycle_reset() {
        let limiter = RateLimiter::new(RateLimitConfig {
            max_per_cycle: 1,
            cycle_window: Duration::from_millis(50),
            max_per_day: 100,
            day_window: Duration::from_secs(86_400),
        });
        limiter.acquire().await;
        assert!(!limiter.try_acquire());
        limiter.acquire().await;
    }
}
