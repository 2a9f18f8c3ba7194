//! Shared seconds clock.
//!
//! All state code reads time through a [`Clock`] handle instead of calling
//! `Utc::now()` directly. The handle carries a signed offset so the daemon
//! can adopt an older uplink's notion of time at link, and so tests and
//! replays can pin or advance time deterministically.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Clone)]
pub struct Clock {
    inner: Arc<Inner>,
}

struct Inner {
    /// Offset added to the wall clock, in seconds.
    offset: AtomicI64,
    /// When set, `now()` returns this fixed value (test/replay mode).
    fixed: AtomicI64,
    manual: std::sync::atomic::AtomicBool,
}

impl Clock {
    /// A clock tracking the system wall clock.
    pub fn system() -> Self {
        Self {
            inner: Arc::new(Inner {
                offset: AtomicI64::new(0),
                fixed: AtomicI64::new(0),
                manual: std::sync::atomic::AtomicBool::new(false),
            }),
        }
    }

    /// A clock pinned at `when`; only [`Clock::set_time`] moves it.
    #[allow(dead_code)] // Replay drivers and tests pin the clock.
    pub fn fixed(when: i64) -> Self {
        let clock = Self::system();
        clock.inner.manual.store(true, Ordering::Relaxed);
        clock.inner.fixed.store(when, Ordering::Relaxed);
        clock
    }

    /// Current time in seconds since the epoch.
    pub fn now(&self) -> i64 {
        if self.inner.manual.load(Ordering::Relaxed) {
            self.inner.fixed.load(Ordering::Relaxed)
        } else {
            chrono::Utc::now().timestamp() + self.inner.offset.load(Ordering::Relaxed)
        }
    }

    /// Slew the clock so that `now()` returns `when` at this instant.
    ///
    /// Used when adopting an uplink's link timestamp and by replay drivers.
    pub fn set_time(&self, when: i64) {
        if self.inner.manual.load(Ordering::Relaxed) {
            self.inner.fixed.store(when, Ordering::Relaxed);
        } else {
            let real = chrono::Utc::now().timestamp();
            self.inner.offset.store(when - real, Ordering::Relaxed);
        }
    }

    /// Advance a pinned clock by `secs`. No-op slew for system clocks.
    #[allow(dead_code)] // Replay drivers and tests.
    pub fn advance(&self, secs: i64) {
        self.set_time(self.now() + secs);
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").field("now", &self.now()).finish()
    }
}
