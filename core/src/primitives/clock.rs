//! The clock abstraction.
//!
//! Every timestamp recorded by the core — monitoring entries, finalization
//! windows, lease bookkeeping — comes from a [`Clock`], never from
//! `SystemTime::now()` sprinkled inline. Production wires [`SystemClock`];
//! tests wire [`ManualClock`] and move time by hand, which is the only way
//! to test a finality window without actually waiting for one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. The core's only unit of wall time.
pub type Millis = u64;

/// A source of time. Must be monotone non-decreasing between calls on the
/// same instance; the core never assumes two clocks agree.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds.
    fn now(&self) -> Millis;

    /// Elapsed duration since an earlier reading from the same clock.
    /// Saturates at zero if `earlier` is in the future (clock skew on
    /// restore, manual clock rewinds in tests).
    fn since(&self, earlier: Millis) -> Duration {
        Duration::from_millis(self.now().saturating_sub(earlier))
    }
}

// ---------------------------------------------------------------------------
// SystemClock
// ---------------------------------------------------------------------------

/// The real clock. Monotonicity is enforced by ratcheting: if the OS clock
/// steps backwards (NTP corrections happen), readings hold at the previous
/// high-water mark instead of rewinding.
#[derive(Debug, Default)]
pub struct SystemClock {
    high_water: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for the common `Arc<dyn Clock>` wiring.
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Millis {
        let raw = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.high_water.fetch_max(raw, Ordering::Relaxed);
        self.high_water.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// A clock that moves only when told to. Cloneable handles share the same
/// underlying instant so a test can hand the clock to the system under
/// test and keep a remote control.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start)),
        }
    }

    /// Advances the clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.now
            .fetch_add(delta.as_millis() as u64, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, at: Millis) {
        self.now.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_monotone() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn manual_clock_advances_on_command() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now(), 1_000);

        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now(), 1_500);
    }

    #[test]
    fn manual_clock_handles_share_time() {
        let clock = ManualClock::new(0);
        let handle = clock.clone();

        handle.advance(Duration::from_secs(2));
        assert_eq!(clock.now(), 2_000);
    }

    #[test]
    fn since_saturates_on_future_instants() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.since(5_000), Duration::ZERO);
        assert_eq!(clock.since(400), Duration::from_millis(600));
    }
}
