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

//! `FlowKey`, `FlowState` and the per-core `FlowTable`.
//!
//! `FlowTable` is a single-writer/single-reader open-addressing map: only the
//! owning `NormalCore` ever mutates it. This consolidates what the original
//! dataplane spread across cuckoo, ordered and dense hash-map flavors into
//! one deterministic structure, keyed by `FlowKey` and probed linearly from
//! `FlowKey::crc32c() as usize`.

/// L4 protocol carried by a flow's 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum L4Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
}

/// A 5-tuple flow key: source/destination IPv4 address, L4 protocol, and
/// source/destination ports.
///
/// Equality is bytewise over the tuple; the hash used for table placement is
/// CRC32C over the same bytes, per the data model's "13 bytes packed to 16
/// for hashing" requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Source IPv4 address, network byte order value as a u32.
    pub src_ip: u32,
    /// Destination IPv4 address.
    pub dst_ip: u32,
    /// L4 protocol.
    pub proto: L4Protocol,
    /// Source port.
    pub src_port: u16,
    /// Destination port.
    pub dst_port: u16,
}

impl FlowKey {
    /// Creates a new flow key.
    pub fn new(src_ip: [u8; 4], dst_ip: [u8; 4], proto: L4Protocol, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip: u32::from_be_bytes(src_ip),
            dst_ip: u32::from_be_bytes(dst_ip),
            proto,
            src_port,
            dst_port,
        }
    }

    /// Packs the tuple into 16 bytes (13 meaningful bytes, zero-padded) and
    /// returns its CRC32C hash.
    pub fn crc32c(&self) -> u32 {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.src_ip.to_be_bytes());
        buf[4..8].copy_from_slice(&self.dst_ip.to_be_bytes());
        buf[8] = match self.proto {
            L4Protocol::Tcp => 6,
            L4Protocol::Udp => 17,
        };
        buf[9..11].copy_from_slice(&self.src_port.to_be_bytes());
        buf[11..13].copy_from_slice(&self.dst_port.to_be_bytes());
        crc32c::crc32c(&buf)
    }
}

/// Destination for a flow's packets for the remainder of a short epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffloadTarget {
    /// No offload: packets stay on the local ring.
    None,
    /// Dropped: no sw-queue room was available this epoch (capacity class
    /// `NoRoom`).
    DumpNoRoom,
    /// Dropped: the flow alone exceeds what any one core can absorb
    /// (capacity class `SuperFlow`).
    DumpSuperFlow,
    /// Routed to sw-queue `k`.
    SwQueue(u16),
}

/// Per-flow state, owned exclusively by the `NormalCore` that currently owns
/// the flow's RSS bucket.
#[derive(Debug, Clone)]
pub struct FlowState {
    /// The flow's key (kept alongside the state for convenience of iteration).
    pub key: FlowKey,
    /// RSS bucket this flow's key hashes to, in `[0, rss_size)`.
    pub rss_bucket: u16,
    /// Monotonic count of packets that arrived for this flow.
    pub ingress_count: u64,
    /// Monotonic count of packets that left this flow (processed or
    /// dropped-with-accounting).
    pub egress_count: u64,
    /// Packets observed in the current short epoch; reset to 0 at epoch
    /// close.
    pub short_epoch_count: u64,
    /// Packets currently sitting in the owning core's local ring for this
    /// flow.
    pub queued: u64,
    /// Current offload target.
    pub offload_target: OffloadTarget,
}

impl FlowState {
    /// Creates a fresh flow state for a flow observed for the first time.
    pub fn new(key: FlowKey, rss_bucket: u16) -> Self {
        Self {
            key,
            rss_bucket,
            ingress_count: 0,
            egress_count: 0,
            short_epoch_count: 0,
            queued: 0,
            offload_target: OffloadTarget::None,
        }
    }

    /// Packets currently queued but not yet accounted for: `ingress -
    /// egress`.
    pub fn queued_packet_count(&self) -> u64 {
        self.ingress_count.saturating_sub(self.egress_count)
    }
}

enum Slot {
    Empty,
    Tombstone,
    Occupied(FlowKey, FlowState),
}

/// Single-writer/single-reader open-addressing map from `FlowKey` to
/// `FlowState`, owned by one `NormalCore`.
pub struct FlowTable {
    slots: Vec<Slot>,
    occupied: usize,
    tombstones: usize,
    mask: usize,
}

const MAX_LOAD_FACTOR: f64 = 0.7;

impl FlowTable {
    /// Creates a new table with at least `capacity_hint` slots (rounded up
    /// to a power of two).
    pub fn with_capacity(capacity_hint: usize) -> Self {
        let capacity = capacity_hint.max(16).next_power_of_two();
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self {
            slots,
            occupied: 0,
            tombstones: 0,
            mask: capacity - 1,
        }
    }

    /// Number of live flows in the table.
    pub fn len(&self) -> usize {
        self.occupied
    }

    /// Whether the table has no live flows.
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    fn probe_start(&self, key: &FlowKey) -> usize {
        (key.crc32c() as usize) & self.mask
    }

    /// Returns the current slot index for `key`, if present. Used only as a
    /// locality hint cached on a packet (the per-packet `flow_slot`,
    /// replacing the original's raw `FlowState*`); not stable across a
    /// `grow()`, so callers must re-resolve via `lookup`/`lookup_mut` rather
    /// than trust the index indefinitely.
    pub fn slot_index(&self, key: &FlowKey) -> Option<u32> {
        let mut idx = self.probe_start(key);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, _) if k == key => return Some(idx as u32),
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Resolves a cached `flow_slot` hint: returns the state at `idx` only
    /// if that slot is still occupied by `key`. A packet carries the index
    /// its flow was found at forward through its processing pass so the
    /// remaining touches skip re-hashing; the hint goes stale across a
    /// `grow()` or if the slot was since reclaimed by another flow, so
    /// callers must fall back to `lookup`/`lookup_mut` on a `None`.
    pub fn get_checked(&self, idx: u32, key: &FlowKey) -> Option<&FlowState> {
        match self.slots.get(idx as usize) {
            Some(Slot::Occupied(k, state)) if k == key => Some(state),
            _ => None,
        }
    }

    /// Mutable counterpart of [`FlowTable::get_checked`].
    pub fn get_checked_mut(&mut self, idx: u32, key: &FlowKey) -> Option<&mut FlowState> {
        match self.slots.get_mut(idx as usize) {
            Some(Slot::Occupied(k, state)) if k == key => Some(state),
            _ => None,
        }
    }

    /// Looks up the flow state for `key`, if present.
    pub fn lookup(&self, key: &FlowKey) -> Option<&FlowState> {
        let mut idx = self.probe_start(key);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, state) if k == key => return Some(state),
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Looks up the flow state for `key` mutably, if present.
    pub fn lookup_mut(&mut self, key: &FlowKey) -> Option<&mut FlowState> {
        let mut idx = self.probe_start(key);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, _) if k == key => {
                    if let Slot::Occupied(_, state) = &mut self.slots[idx] {
                        return Some(state);
                    }
                    unreachable!()
                }
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Inserts a new flow, or replaces the state of an existing one.
    /// Triggers a rehash if the table has grown past its load factor.
    pub fn insert(&mut self, key: FlowKey, state: FlowState) {
        if (self.occupied + self.tombstones + 1) as f64 > self.slots.len() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }

        let mut idx = self.probe_start(&key);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let target = first_tombstone.unwrap_or(idx);
                    if first_tombstone.is_some() {
                        self.tombstones -= 1;
                    }
                    self.slots[target] = Slot::Occupied(key, state);
                    self.occupied += 1;
                    return;
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) if *k == key => {
                    self.slots[idx] = Slot::Occupied(key, state);
                    return;
                }
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// Looks up `key`, inserting `make()`'s result if absent. Returns the
    /// slot index (the value a caller caches as a packet's `flow_slot`
    /// hint), whether the entry was newly created, and a mutable reference
    /// to its state — one probe where a separate insert-then-lookup would
    /// need two.
    pub fn get_or_insert_with(&mut self, key: FlowKey, make: impl FnOnce() -> FlowState) -> (u32, bool, &mut FlowState) {
        if (self.occupied + self.tombstones + 1) as f64 > self.slots.len() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }

        let mut idx = self.probe_start(&key);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let target = first_tombstone.unwrap_or(idx);
                    if first_tombstone.is_some() {
                        self.tombstones -= 1;
                    }
                    self.slots[target] = Slot::Occupied(key, make());
                    self.occupied += 1;
                    let state = match &mut self.slots[target] {
                        Slot::Occupied(_, state) => state,
                        _ => unreachable!(),
                    };
                    return (target as u32, true, state);
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) if *k == key => {
                    let state = match &mut self.slots[idx] {
                        Slot::Occupied(_, state) => state,
                        _ => unreachable!(),
                    };
                    return (idx as u32, false, state);
                }
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
    }

    /// Removes the flow state for `key`, returning it if it was present.
    pub fn erase(&mut self, key: &FlowKey) -> Option<FlowState> {
        let mut idx = self.probe_start(key);
        for _ in 0..self.slots.len() {
            match &self.slots[idx] {
                Slot::Empty => return None,
                Slot::Tombstone => {}
                Slot::Occupied(k, _) if k == key => {
                    let removed = std::mem::replace(&mut self.slots[idx], Slot::Tombstone);
                    self.occupied -= 1;
                    self.tombstones += 1;
                    return match removed {
                        Slot::Occupied(_, state) => Some(state),
                        _ => unreachable!(),
                    };
                }
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Detaches every flow whose `rss_bucket == bucket`, returning them for
    /// the migration protocol. The caller (the owning core, at the
    /// scheduler's request) transfers the returned states to the new owner.
    pub fn drain_bucket(&mut self, bucket: u16) -> Vec<(FlowKey, FlowState)> {
        let mut drained = Vec::new();
        for slot in self.slots.iter_mut() {
            let matches = matches!(slot, Slot::Occupied(_, state) if state.rss_bucket == bucket);
            if matches {
                let removed = std::mem::replace(slot, Slot::Tombstone);
                if let Slot::Occupied(key, state) = removed {
                    drained.push((key, state));
                    self.occupied -= 1;
                    self.tombstones += 1;
                }
            }
        }
        drained
    }

    /// Iterates over all live flow states.
    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, &FlowState)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied(k, s) => Some((k, s)),
            _ => None,
        })
    }

    /// Iterates mutably over all live flow states.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&FlowKey, &mut FlowState)> {
        self.slots.iter_mut().filter_map(|slot| match slot {
            Slot::Occupied(k, s) => Some((&*k, s)),
            _ => None,
        })
    }

    fn grow(&mut self) {
        let new_capacity = (self.slots.len() * 2).max(16);
        let old_slots = std::mem::replace(&mut self.slots, {
            let mut v = Vec::with_capacity(new_capacity);
            v.resize_with(new_capacity, || Slot::Empty);
            v
        });
        self.mask = new_capacity - 1;
        self.occupied = 0;
        self.tombstones = 0;
        for slot in old_slots {
            if let Slot::Occupied(key, state) = slot {
                self.insert(key, state);
            }
        }
    }
}

impl Default for FlowTable {
    fn default() -> Self {
        Self::with_capacity(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(src_port: u16) -> FlowKey {
        FlowKey::new([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, src_port, 80)
    }

    #[test]
    fn insert_lookup_erase_roundtrip() {
        let mut table = FlowTable::with_capacity(4);
        let k = key(1);
        table.insert(k, FlowState::new(k, 3));
        assert!(table.lookup(&k).is_some());
        assert_eq!(table.len(), 1);

        let removed = table.erase(&k);
        assert!(removed.is_some());
        assert!(table.lookup(&k).is_none());
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn grows_past_load_factor() {
        let mut table = FlowTable::with_capacity(4);
        for port in 0..50u16 {
            let k = key(port);
            table.insert(k, FlowState::new(k, port % 512));
        }
        assert_eq!(table.len(), 50);
        for port in 0..50u16 {
            assert!(table.lookup(&key(port)).is_some());
        }
    }

    #[test]
    fn drain_bucket_detaches_matching_flows_only() {
        let mut table = FlowTable::with_capacity(16);
        for port in 0..10u16 {
            let k = key(port);
            let bucket = if port < 5 { 1 } else { 2 };
            table.insert(k, FlowState::new(k, bucket));
        }

        let drained = table.drain_bucket(1);
        assert_eq!(drained.len(), 5);
        assert_eq!(table.len(), 5);
        for (_, state) in table.iter() {
            assert_eq!(state.rss_bucket, 2);
        }
    }

    #[test]
    fn queued_packet_count_is_ingress_minus_egress() {
        let mut state = FlowState::new(key(1), 0);
        state.ingress_count = 10;
        state.egress_count = 4;
        assert_eq!(state.queued_packet_count(), 6);
    }

    #[test]
    fn get_or_insert_with_reuses_the_same_slot_on_repeat_lookups() {
        let mut table = FlowTable::with_capacity(16);
        let k = key(1);

        let (slot, is_new, state) = table.get_or_insert_with(k, || FlowState::new(k, 7));
        assert!(is_new);
        state.ingress_count += 1;

        let (slot_again, is_new_again, state_again) = table.get_or_insert_with(k, || FlowState::new(k, 7));
        assert_eq!(slot, slot_again);
        assert!(!is_new_again);
        assert_eq!(state_again.ingress_count, 1);

        assert_eq!(table.get_checked(slot, &k).unwrap().ingress_count, 1);
    }

    #[test]
    fn get_checked_rejects_a_stale_slot_hint() {
        let mut table = FlowTable::with_capacity(16);
        let k1 = key(1);
        let k2 = key(2);
        table.insert(k1, FlowState::new(k1, 0));
        let slot = table.slot_index(&k1).unwrap();

        table.erase(&k1);
        table.insert(k2, FlowState::new(k2, 0));

        // The hint may now point at a slot reused by a different flow (or
        // one still empty); either way it must not be mistaken for k1's.
        assert!(table.get_checked(slot, &k1).is_none());
    }
}
