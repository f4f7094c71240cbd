//! A small clock abstraction so schedulers and validators can be driven by
//! a fixed instant in tests, mirroring the original's `time_provider`
//! callable (`scheduler.py::CollectionScheduler.__init__`).

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;

/// Returns the current time. Production code uses [`SystemClock`]; tests use
/// [`FixedClock`] to pin `now()` to a specific instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// The real wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that always returns the same instant until explicitly advanced.
/// Used by unit tests that need to cross day/expiry boundaries
/// deterministically.
#[derive(Clone)]
pub struct FixedClock {
    inner: Arc<Mutex<OffsetDateTime>>,
}

impl FixedClock {
    pub fn new(at: OffsetDateTime) -> Self {
        Self {
            inner: Arc::new(Mutex::new(at)),
        }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.inner.lock().expect("FixedClock mutex poisoned") = at;
    }

    pub fn advance(&self, by: time::Duration) {
        let mut guard = self.inner.lock().expect("FixedClock mutex poisoned");
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        *self.inner.lock().expect("FixedClock mutex poisoned")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let start = OffsetDateTime::UNIX_EPOCH;
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(time::Duration::seconds(60));
        assert_eq!(clock.now(), start + time::Duration::seconds(60));
    }
}
