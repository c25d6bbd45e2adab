//! Time source abstraction.
//!
//! Every expiry and lockout decision in the service goes through a [`Clock`]
//! handle held in `AppState`, so tests can pin or advance time instead of
//! sleeping through lock windows.

use chrono::{DateTime, Utc};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time. The only implementation used outside of tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
