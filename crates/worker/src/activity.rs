//! A single enum-valued atomic per core, replacing the original dataplane's
//! scattered atomic flags (`disabled_`, `mark_to_disable_`, ...). The core
//! mutates its own state in response to a `RuntimeBus` command or internal
//! transition; other components only read it (for liveness/diagnostics).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// The lifecycle state of one core's cooperative loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreActivity {
    /// Normal operation.
    Running,
    /// Draining a migrating bucket or sw-queue before going idle.
    Draining,
    /// Parked: an `Unused`-role core slot, or a `ReservedCore` with nothing
    /// assigned.
    Paused,
    /// Finished its last batch after a `Stop` command; safe to join.
    Drained,
}

impl CoreActivity {
    fn to_u8(self) -> u8 {
        match self {
            CoreActivity::Running => 0,
            CoreActivity::Draining => 1,
            CoreActivity::Paused => 2,
            CoreActivity::Drained => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => CoreActivity::Running,
            1 => CoreActivity::Draining,
            2 => CoreActivity::Paused,
            _ => CoreActivity::Drained,
        }
    }
}

/// A shared, atomically-updated `CoreActivity` cell.
#[derive(Clone)]
pub struct ActivityCell(Arc<AtomicU8>);

impl ActivityCell {
    /// Creates a cell starting in `initial` state.
    pub fn new(initial: CoreActivity) -> Self {
        Self(Arc::new(AtomicU8::new(initial.to_u8())))
    }

    /// Reads the current state.
    pub fn get(&self) -> CoreActivity {
        CoreActivity::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Sets the state.
    pub fn set(&self, activity: CoreActivity) {
        self.0.store(activity.to_u8(), Ordering::Release);
    }
}

impl Default for ActivityCell {
    fn default() -> Self {
        Self::new(CoreActivity::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_every_state() {
        let cell = ActivityCell::new(CoreActivity::Running);
        assert_eq!(cell.get(), CoreActivity::Running);
        cell.set(CoreActivity::Draining);
        assert_eq!(cell.get(), CoreActivity::Draining);
        cell.set(CoreActivity::Drained);
        assert_eq!(cell.get(), CoreActivity::Drained);
    }
}
