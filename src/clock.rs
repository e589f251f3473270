//! A single time source for the transition layer.
//!
//! `now()` writes in the Store go through this trait rather than calling
//! `chrono::Utc::now()` directly, so tests can freeze or advance time instead
//! of racing real wall-clock timeouts. The Store's own SQLite `CURRENT_TIMESTAMP`
//! columns are audit-only and not part of logical ordering.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock a test can advance explicitly, for exercising timeout and retry
/// paths without sleeping.
#[derive(Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.current.lock().expect("manual clock lock poisoned");
        *guard = *guard + delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("manual clock lock poisoned")
    }
}
