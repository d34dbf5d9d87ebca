//! Wall-clock abstraction so timestamps and accrual can be driven in tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock. Clones share the same instant.
#[derive(Debug, Clone)]
pub struct SharedMockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl SharedMockClock {
    pub fn new() -> Self {
        // Fixed epoch keeps test output stable.
        Self::starting_at(DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap_or_default())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance_time(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Default for SharedMockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SharedMockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
