//! Time sources for the engine.
//!
//! Wall time is what gets persisted and shown; monotonic time bounds
//! elapsed intervals so that a wall-clock jump (NTP, manual change, sleep)
//! cannot fabricate work time while the process is alive.

use std::time::Instant;

pub trait Clock: Send + Sync {
    /// Wall-clock Unix timestamp in seconds.
    fn now_secs(&self) -> i64;
    /// Monotonic instant, only comparable within this process.
    fn monotonic(&self) -> Instant;
}

/// Real clocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn monotonic(&self) -> Instant {
        Instant::now()
    }
}

/// Hand-driven clock for simulated seconds in tests.
#[cfg(test)]
pub struct ManualClock {
    base_instant: Instant,
    inner: std::sync::Mutex<ManualInner>,
}

#[cfg(test)]
struct ManualInner {
    wall: i64,
    mono_offset: std::time::Duration,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(wall: i64) -> Self {
        Self {
            base_instant: Instant::now(),
            inner: std::sync::Mutex::new(ManualInner {
                wall,
                mono_offset: std::time::Duration::ZERO,
            }),
        }
    }

    /// Clock starting at the current real wall time.
    pub fn starting_now() -> Self {
        Self::new(chrono::Utc::now().timestamp())
    }

    /// Advance both wall and monotonic time.
    pub fn advance(&self, secs: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.wall += secs as i64;
        inner.mono_offset += std::time::Duration::from_secs(secs);
    }

    /// Move only the wall clock (sleep, NTP jump, manual change).
    pub fn jump_wall(&self, delta: i64) {
        self.inner.lock().unwrap().wall += delta;
    }

    pub fn set_wall(&self, wall: i64) {
        self.inner.lock().unwrap().wall = wall;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.inner.lock().unwrap().wall
    }

    fn monotonic(&self) -> Instant {
        self.base_instant + self.inner.lock().unwrap().mono_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both() {
        let clock = ManualClock::new(1_000);
        let m0 = clock.monotonic();
        clock.advance(5);
        assert_eq!(clock.now_secs(), 1_005);
        assert_eq!(clock.monotonic().duration_since(m0).as_secs(), 5);
    }

    #[test]
    fn test_manual_clock_wall_jump_keeps_monotonic() {
        let clock = ManualClock::new(1_000);
        let m0 = clock.monotonic();
        clock.jump_wall(-300);
        assert_eq!(clock.now_secs(), 700);
        assert_eq!(clock.monotonic(), m0);
    }
}
