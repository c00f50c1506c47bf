#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! `RssBucket` and the global `BucketStats` table.
//!
//! Each bucket is written only by the `NormalCore` that currently owns it and
//! read by the `Scheduler` once per long epoch. Rather than the
//! reader-writer lock the spec describes as one valid contract, this uses
//! per-entry atomics - the spec explicitly allows either ("contract is
//! identical").

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};

/// A core id of `0xFFFF` denotes "invalid/unused", per the bit-exact shapes
/// section of the spec.
pub const INVALID_CORE: u16 = 0xFFFF;

/// Default RSS table size.
pub const DEFAULT_RSS_SIZE: u16 = 512;

/// One entry of the global bucket table.
struct BucketEntry {
    owner_core: AtomicU16,
    packet_count_epoch: AtomicU64,
    unique_flow_count_epoch: AtomicU64,
    pending_move_to: AtomicU16,
}

impl BucketEntry {
    fn new() -> Self {
        Self {
            owner_core: AtomicU16::new(INVALID_CORE),
            packet_count_epoch: AtomicU64::new(0),
            unique_flow_count_epoch: AtomicU64::new(0),
            pending_move_to: AtomicU16::new(INVALID_CORE),
        }
    }
}

/// A snapshot record for one bucket: `{u64 packet_count, u64 flow_count}`,
/// the wire shape exposed through `get_stats()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketStatsRecord {
    /// Packets observed for this bucket over the snapshotted period.
    pub packet_count: u64,
    /// Distinct flows observed for this bucket over the snapshotted period.
    pub flow_count: u64,
}

/// The fixed, global table of per-RSS-bucket counters.
pub struct BucketStats {
    entries: Vec<BucketEntry>,
}

impl BucketStats {
    /// Creates a table with `rss_size` entries, all initially unowned.
    pub fn new(rss_size: u16) -> Self {
        let mut entries = Vec::with_capacity(usize::from(rss_size));
        entries.resize_with(usize::from(rss_size), BucketEntry::new);
        Self { entries }
    }

    /// Number of buckets in this table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no buckets (never true for a correctly
    /// configured worker).
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sets the owning core for a bucket. Only the Scheduler calls this, at
    /// commit time of a bucket move.
    pub fn set_owner(&self, bucket: u16, core_id: u16) {
        self.entries[usize::from(bucket)].owner_core.store(core_id, Ordering::Release);
    }

    /// Returns the current owner of a bucket.
    pub fn owner(&self, bucket: u16) -> u16 {
        self.entries[usize::from(bucket)].owner_core.load(Ordering::Acquire)
    }

    /// Marks a bucket as pending a move to `new_owner`. Packets continuing to
    /// arrive at the old owner are still accepted until the drain completes.
    pub fn mark_pending_move(&self, bucket: u16, new_owner: u16) {
        self.entries[usize::from(bucket)]
            .pending_move_to
            .store(new_owner, Ordering::Release);
    }

    /// Clears a bucket's pending-move marker once the drain protocol
    /// completes.
    pub fn clear_pending_move(&self, bucket: u16) {
        self.entries[usize::from(bucket)]
            .pending_move_to
            .store(INVALID_CORE, Ordering::Release);
    }

    /// Returns the pending-move target for a bucket, if any.
    pub fn pending_move_to(&self, bucket: u16) -> Option<u16> {
        match self.entries[usize::from(bucket)].pending_move_to.load(Ordering::Acquire) {
            INVALID_CORE => None,
            core => Some(core),
        }
    }

    /// Records that one packet arrived for `bucket`. Called by the owning
    /// core on every packet it processes.
    pub fn record_packet(&self, bucket: u16) {
        self.entries[usize::from(bucket)]
            .packet_count_epoch
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Records that a new distinct flow was observed in `bucket` this epoch.
    pub fn record_new_flow(&self, bucket: u16) {
        self.entries[usize::from(bucket)]
            .unique_flow_count_epoch
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshots and resets every bucket's epoch counters in one pass, for
    /// the Scheduler's long-epoch read. Returns one record per bucket, in
    /// bucket-index order.
    pub fn snapshot_and_reset(&self) -> Vec<BucketStatsRecord> {
        self.entries
            .iter()
            .map(|entry| BucketStatsRecord {
                packet_count: entry.packet_count_epoch.swap(0, Ordering::AcqRel),
                flow_count: entry.unique_flow_count_epoch.swap(0, Ordering::AcqRel),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_defaults_to_invalid() {
        let stats = BucketStats::new(8);
        assert_eq!(stats.owner(0), INVALID_CORE);
    }

    #[test]
    fn record_and_snapshot_resets_counters() {
        let stats = BucketStats::new(4);
        stats.record_packet(2);
        stats.record_packet(2);
        stats.record_new_flow(2);

        let snapshot = stats.snapshot_and_reset();
        assert_eq!(snapshot[2].packet_count, 2);
        assert_eq!(snapshot[2].flow_count, 1);

        let second = stats.snapshot_and_reset();
        assert_eq!(second[2].packet_count, 0);
    }

    #[test]
    fn pending_move_roundtrip() {
        let stats = BucketStats::new(4);
        assert_eq!(stats.pending_move_to(1), None);
        stats.mark_pending_move(1, 7);
        assert_eq!(stats.pending_move_to(1), Some(7));
        stats.clear_pending_move(1);
        assert_eq!(stats.pending_move_to(1), None);
    }
}
