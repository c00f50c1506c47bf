//! Per-core drop-class counters, named one-to-one with the original
//! dataplane's `epoch_drop1_..4_` counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// A capacity-exhaustion reason a packet was dropped for. Never propagated
/// as an error - these are expected, steady-state outcomes, only ever
/// surfaced through these counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DropClass {
    /// The local ring or a sw-queue ring was full at enqueue time
    /// (original `epoch_drop3_`).
    LocalQueueOverflow,
    /// First-fit admission found no local room and no sw-queue could absorb
    /// the flow (original `epoch_drop1_`).
    NoRoom,
    /// A single flow's short-epoch arrival rate exceeds what any one core
    /// can absorb (original `epoch_drop4_`).
    SuperFlow,
    /// A packet arrived for an `offload_target = SwQueue(k)` whose consumer
    /// is gone or the queue has since idled out (original `epoch_drop2_`).
    StaleOffload,
    /// The NIC rejected a packet at send time.
    NicTxDrop,
}

/// Atomic counters for every drop class, aggregated into `get_stats()`.
#[derive(Default)]
pub struct DropCounters {
    local_queue_overflow: AtomicU64,
    no_room: AtomicU64,
    super_flow: AtomicU64,
    stale_offload: AtomicU64,
    nic_tx_drop: AtomicU64,
}

/// A point-in-time snapshot of every drop class's counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DropCountersSnapshot {
    /// `DropClass::LocalQueueOverflow` count.
    pub local_queue_overflow: u64,
    /// `DropClass::NoRoom` count.
    pub no_room: u64,
    /// `DropClass::SuperFlow` count.
    pub super_flow: u64,
    /// `DropClass::StaleOffload` count.
    pub stale_offload: u64,
    /// `DropClass::NicTxDrop` count.
    pub nic_tx_drop: u64,
}

impl DropCounters {
    /// Creates a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bumps the counter for `class` by one.
    pub fn bump(&self, class: DropClass) {
        let counter = match class {
            DropClass::LocalQueueOverflow => &self.local_queue_overflow,
            DropClass::NoRoom => &self.no_room,
            DropClass::SuperFlow => &self.super_flow,
            DropClass::StaleOffload => &self.stale_offload,
            DropClass::NicTxDrop => &self.nic_tx_drop,
        };
        let _ = counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Bumps the counter for `class` by `count`.
    pub fn bump_by(&self, class: DropClass, count: u64) {
        if count == 0 {
            return;
        }
        let counter = match class {
            DropClass::LocalQueueOverflow => &self.local_queue_overflow,
            DropClass::NoRoom => &self.no_room,
            DropClass::SuperFlow => &self.super_flow,
            DropClass::StaleOffload => &self.stale_offload,
            DropClass::NicTxDrop => &self.nic_tx_drop,
        };
        let _ = counter.fetch_add(count, Ordering::Relaxed);
    }

    /// Reads every counter without resetting them.
    pub fn snapshot(&self) -> DropCountersSnapshot {
        DropCountersSnapshot {
            local_queue_overflow: self.local_queue_overflow.load(Ordering::Relaxed),
            no_room: self.no_room.load(Ordering::Relaxed),
            super_flow: self.super_flow.load(Ordering::Relaxed),
            stale_offload: self.stale_offload.load(Ordering::Relaxed),
            nic_tx_drop: self.nic_tx_drop.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_snapshot() {
        let counters = DropCounters::new();
        counters.bump(DropClass::SuperFlow);
        counters.bump(DropClass::SuperFlow);
        counters.bump(DropClass::NoRoom);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.super_flow, 2);
        assert_eq!(snapshot.no_room, 1);
        assert_eq!(snapshot.local_queue_overflow, 0);
    }

    #[test]
    fn bump_by_zero_is_a_no_op() {
        let counters = DropCounters::new();
        counters.bump_by(DropClass::NicTxDrop, 0);
        assert_eq!(counters.snapshot().nic_tx_drop, 0);
    }
}
