//! Injectable time source for the decision engine.
//!
//! Every timestamp the engine records or compares flows through a [`Clock`],
//! so tests can drive the sliding windows deterministically with a
//! [`VirtualClock`] instead of sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;

/// Time source abstraction for the engine's control paths.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock. Wraps `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually controlled clock for tests.
#[derive(Debug)]
pub struct VirtualClock {
    inner: Mutex<DateTime<Utc>>,
}

impl VirtualClock {
    /// Create a virtual clock seeded at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Mutex::new(start),
        }
    }

    /// Advance the clock by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.inner.lock().expect("virtual clock poisoned");
        *now += delta;
    }

    /// Set the clock to an absolute instant.
    pub fn set(&self, value: DateTime<Utc>) {
        *self.inner.lock().expect("virtual clock poisoned") = value;
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("virtual clock poisoned")
    }
}

/// Convert fractional seconds into a `TimeDelta` with millisecond precision.
pub(crate) fn secs(value: f64) -> TimeDelta {
    TimeDelta::milliseconds((value * 1000.0).round() as i64)
}

/// Whole seconds in `delta`, rounded up. Negative deltas round toward zero.
pub(crate) fn ceil_seconds(delta: TimeDelta) -> i64 {
    let ms = delta.num_milliseconds();
    ms.div_euclid(1000) + i64::from(ms.rem_euclid(1000) > 0)
}
