//! Monotonic-enough wall clock and cancellable delay abstractions (C1).
//!
//! Every timeout window in the Request Store (C8) and every retry backoff in
//! the Blockchain Client (C9) goes through this trait rather than calling
//! `Utc::now()`/`tokio::time::sleep` directly, so tests can swap in
//! [`FakeClock`] and assert exact promotion/retry behaviour without real
//! sleeps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use crate::shutdown::Shutdown;

/// Source of the current time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Cancellable sleep. Implementations race the delay against a shutdown
/// signal; the returned future resolves early (with `false`) if cancelled.
#[async_trait::async_trait]
pub trait Delay: Send + Sync + 'static {
    async fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool;
}

/// Production clock: the system wall clock, `tokio::time::sleep` raced
/// against shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait::async_trait]
impl Delay for SystemClock {
    async fn sleep(&self, duration: Duration, shutdown: &Shutdown) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = shutdown.await_shutdown() => false,
        }
    }
}

/// A manually advanced clock for deterministic tests. Sleeps resolve
/// immediately; `advance` moves `now()` forward without waiting.
#[derive(Debug, Clone)]
pub struct FakeClock {
    millis_since_epoch: Arc<AtomicI64>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis_since_epoch: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis_since_epoch
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.millis_since_epoch.load(Ordering::SeqCst))
            .single()
            .expect("fake clock millis always in range")
    }
}

#[async_trait::async_trait]
impl Delay for FakeClock {
    async fn sleep(&self, duration: Duration, _shutdown: &Shutdown) -> bool {
        self.advance(duration);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }
}
