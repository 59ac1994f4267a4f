use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Monotonic clock abstraction for control and timing across the stack.
///
/// - now(): returns a monotonic Instant
/// - sleep(): sleeps for the provided duration (implementations may simulate)
/// - ms_since(): helper to compute elapsed milliseconds from an epoch Instant
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, d: Duration);

    /// Milliseconds elapsed since `epoch`, saturating at 0 on underflow.
    fn ms_since(&self, epoch: Instant) -> u64 {
        let dur = self.now().saturating_duration_since(epoch);
        u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Default, real-time monotonic clock backed by std::time::Instant.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    #[inline]
    fn sleep(&self, d: Duration) {
        if d.is_zero() {
            return;
        }
        thread::sleep(d);
    }
}

/// Deterministic clock whose time only moves when advanced.
///
/// now() = origin + offset
/// sleep(d) advances internal time by d without actually sleeping.
/// Clones share the same offset, so a test can hold one handle while the
/// control loop owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Advance the clock by the given duration.
    pub fn advance(&self, d: Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = off.saturating_add(d);
        }
    }

    /// Set the absolute offset relative to origin.
    pub fn set_offset(&self, d: Duration) {
        if let Ok(mut off) = self.offset.lock() {
            *off = d;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let off = self.offset.lock().map(|g| *g).unwrap_or(Duration::ZERO);
        self.origin + off
    }

    fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

/// Wall-clock source used for schedule decisions.
///
/// Returns seconds since the Unix epoch, or `None` while the time source has
/// not been synchronized yet.
pub trait WallClock {
    fn epoch_secs(&self) -> Option<u32>;
}

/// Wall clock backed by the host's system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemWallClock;

impl WallClock for SystemWallClock {
    fn epoch_secs(&self) -> Option<u32> {
        let since = SystemTime::now().duration_since(UNIX_EPOCH).ok()?;
        u32::try_from(since.as_secs()).ok()
    }
}

/// Settable wall clock for tests and simulations. `None` models an
/// unsynchronized RTC.
#[derive(Debug, Clone, Default)]
pub struct ManualWallClock {
    secs: Arc<Mutex<Option<u32>>>,
}

impl ManualWallClock {
    pub fn new(secs: Option<u32>) -> Self {
        Self {
            secs: Arc::new(Mutex::new(secs)),
        }
    }

    pub fn set(&self, secs: Option<u32>) {
        if let Ok(mut s) = self.secs.lock() {
            *s = secs;
        }
    }

    /// Advance by `d` seconds; no-op while unsynchronized.
    pub fn advance_secs(&self, d: u32) {
        if let Ok(mut s) = self.secs.lock() {
            *s = s.map(|v| v.saturating_add(d));
        }
    }
}

impl WallClock for ManualWallClock {
    fn epoch_secs(&self) -> Option<u32> {
        self.secs.lock().ok().and_then(|g| *g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_without_sleeping() {
        let clock = ManualClock::new();
        let epoch = clock.now();
        clock.sleep(Duration::from_millis(250));
        assert_eq!(clock.ms_since(epoch), 250);
        clock.set_offset(Duration::from_secs(2));
        assert_eq!(clock.ms_since(epoch), 2000);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let a = ManualClock::new();
        let b = a.clone();
        let epoch = a.now();
        b.advance(Duration::from_millis(10));
        assert_eq!(a.ms_since(epoch), 10);
    }

    #[test]
    fn manual_wall_clock_stays_unsynced_when_advanced() {
        let w = ManualWallClock::new(None);
        w.advance_secs(5);
        assert_eq!(w.epoch_secs(), None);
        w.set(Some(100));
        w.advance_secs(5);
        assert_eq!(w.epoch_secs(), Some(105));
    }

    #[test]
    fn system_wall_clock_is_past_2023() {
        let secs = SystemWallClock.epoch_secs().unwrap_or(0);
        assert!(secs > 1_672_531_200);
    }
}
