//! Clock abstraction for testable timing behavior.
//!
//! Backoff scheduling, cache TTL expiry, and the background loops all read
//! time through [`Clock`] so tests can control it deterministically.
//! Production code uses [`SystemClock`]; tests inject [`TestClock`].

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};

/// Time source for the delivery pipeline.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Sleeps for the given duration.
    ///
    /// Maps to `tokio::time::sleep` in production. Test clocks advance
    /// virtual time immediately instead of blocking.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Production clock backed by the system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Controllable clock for deterministic tests.
///
/// Starts at a fixed base time and only moves when [`TestClock::advance`]
/// is called (or when a task sleeps, which advances virtual time and
/// yields instead of blocking).
#[derive(Debug, Clone)]
pub struct TestClock {
    base: DateTime<Utc>,
    offset_ms: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock anchored at the current system time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a test clock anchored at a specific time.
    pub fn starting_at(base: DateTime<Utc>) -> Self {
        Self { base, offset_ms: Arc::new(AtomicI64::new(0)) }
    }

    /// Advances virtual time by the given duration.
    pub fn advance(&self, duration: Duration) {
        let ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.offset_ms.fetch_add(ms, Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_utc(&self) -> DateTime<Utc> {
        let offset = self.offset_ms.load(Ordering::Acquire);
        self.base + chrono::Duration::milliseconds(offset)
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
