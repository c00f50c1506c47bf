//! Monotonic nanosecond clock and short/long epoch tick derivation.
//!
//! Spec.md's two scheduling timescales (~1 ms short epoch, ~1 s long epoch)
//! are both just "has at least `period_ns` elapsed since the last tick",
//! evaluated on every pass of a core's or the Scheduler's loop - there is no
//! timer thread or blocking sleep anywhere on the data path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A source of the monotonic nanosecond timestamps every core's pass and the
/// Scheduler's long-epoch tick are driven from. Abstracted behind a trait so
/// integration tests can drive deterministic epoch boundaries without
/// sleeping wall-clock time.
pub trait TimeSource: Send + Sync {
    /// Current time, in nanoseconds, relative to some fixed but arbitrary
    /// origin (consistent for the lifetime of one `TimeSource`).
    fn now_ns(&self) -> u64;
}

/// The real clock: nanoseconds elapsed since this clock was created.
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    /// Creates a clock anchored to the current instant.
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemClock {
    fn now_ns(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }
}

/// A test double: the caller sets or advances the clock explicitly, letting
/// integration tests land packets at exact epoch boundaries instead of
/// racing real time.
#[derive(Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the clock to an absolute timestamp.
    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    /// Advances the clock by `delta_ns`.
    pub fn advance(&self, delta_ns: u64) {
        let _ = self.now_ns.fetch_add(delta_ns, Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

/// Tracks elapsed-time ticks of a fixed period, used for both the
/// short-epoch (~1 ms) and long-epoch (~1 s) boundaries.
pub struct EpochTicker {
    period_ns: u64,
    last_tick_ns: u64,
    epoch_id: u64,
}

impl EpochTicker {
    /// Creates a ticker of `period_ns`, with its first window starting at
    /// `now_ns`.
    pub fn new(period_ns: u64, now_ns: u64) -> Self {
        Self {
            period_ns,
            last_tick_ns: now_ns,
            epoch_id: 0,
        }
    }

    /// If at least `period_ns` has elapsed since the last tick, advances the
    /// window and returns the new epoch id. Otherwise returns `None` and
    /// leaves the window unchanged.
    pub fn try_tick(&mut self, now_ns: u64) -> Option<u64> {
        if now_ns.saturating_sub(self.last_tick_ns) >= self.period_ns {
            self.last_tick_ns = now_ns;
            self.epoch_id += 1;
            Some(self.epoch_id)
        } else {
            None
        }
    }

    /// The configured period, in nanoseconds.
    pub fn period_ns(&self) -> u64 {
        self.period_ns
    }

    /// The id of the most recently closed epoch (0 before the first tick).
    pub fn epoch_id(&self) -> u64 {
        self.epoch_id
    }

    /// Nanoseconds remaining until the next tick would fire, given `now_ns`.
    pub fn remaining_ns(&self, now_ns: u64) -> u64 {
        self.period_ns.saturating_sub(now_ns.saturating_sub(self.last_tick_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_only_after_period_elapses() {
        let mut ticker = EpochTicker::new(1_000, 0);
        assert!(ticker.try_tick(500).is_none());
        assert_eq!(ticker.try_tick(1_000), Some(1));
        assert!(ticker.try_tick(1_200).is_none());
        assert_eq!(ticker.try_tick(2_500), Some(2));
    }

    #[test]
    fn remaining_ns_counts_down_within_a_window() {
        let ticker = EpochTicker::new(1_000, 0);
        assert_eq!(ticker.remaining_ns(300), 700);
        assert_eq!(ticker.remaining_ns(2_000), 0);
    }
}
