//! Clock and id-source ports.
//!
//! Components take these instead of calling `Utc::now()` and
//! `Uuid::new_v4()` directly so that cooldown, heartbeat, and ordering
//! logic is testable with a pinned clock.

use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

/// Time source.
pub trait Clock: Send + Sync {
    /// Wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Monotonic reference for durations.
    fn monotonic(&self) -> Instant;
}

/// Unique id source.
pub trait IdSource: Send + Sync {
    fn new_id(&self) -> Uuid;
}

/// Production clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Production id source generating UUIDv4.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidSource;

impl IdSource for UuidSource {
    fn new_id(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Manually advanced clock for tests.
///
/// `now()` must stay non-suspending, so the inner lock is a std lock and
/// is never held across await points.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<RwLock<DateTime<Utc>>>,
    epoch: Instant,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
            epoch: Instant::now(),
        }
    }

    /// Advance wall-clock time by `seconds`.
    pub fn advance_secs(&self, seconds: i64) {
        let mut guard = self.now.write().expect("clock lock poisoned");
        *guard += Duration::seconds(seconds);
    }

    /// Advance wall-clock time by `ms` milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        let mut guard = self.now.write().expect("clock lock poisoned");
        *guard += Duration::milliseconds(ms);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().expect("clock lock poisoned")
    }

    fn monotonic(&self) -> Instant {
        self.epoch
    }
}
