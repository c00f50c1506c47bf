//! `NormalCore`: the per-core receive/admission/process/epoch-close loop.
//! Expressed as a plain loop with explicit phases (`Recv`, `Admit`,
//! `Process`, `EpochClose`) in place of the cooperative `goto` chain
//! `nfv_core.cc`'s task-scheduling loop used.

use std::collections::{HashSet, VecDeque};

use flow::{FlowKey, FlowState, FlowTable, OffloadTarget};
use packet::Packet;
use runtime_bus::{Command, MigrationBatch, Notification};
use swqueue::Phase;

use crate::activity::{ActivityCell, CoreActivity};
use crate::drop_counters::{DropClass, DropCounters, DropCountersSnapshot};
use crate::nf::NfContext;
use crate::runtime::SharedRuntime;

/// One pull pulls at most this many batches from the NIC queue.
const MAX_BATCHES_PER_PULL: usize = 8;
/// Each NIC batch (and each local/sw-queue processing batch) is at most this
/// many packets.
const BATCH_SIZE: usize = 32;
/// Pulling this many packets in one pass is "busy" enough to consider
/// entering boost mode (a full `MAX_BATCHES_PER_PULL` worth).
const BUSY_PULL_THRESHOLD: usize = MAX_BATCHES_PER_PULL * BATCH_SIZE;

#[derive(Debug, Clone, Copy)]
struct PendingMove {
    bucket: u16,
    new_owner: u16,
    signaled_at_ns: u64,
}

/// A per-core cooperative receive/admission/process pipeline. Owns its
/// `FlowTable` exclusively; every other piece of shared state it touches is
/// either a lock-free ring or an atomic, reached through its `SharedRuntime`
/// handle.
pub struct NormalCore {
    core_id: u16,
    qid: u16,
    runtime: SharedRuntime,
    command_rx: flume::Receiver<Command>,
    migration_rx: flume::Receiver<MigrationBatch>,

    flow_table: FlowTable,
    local_ring: VecDeque<Packet>,
    boost_ring: VecDeque<Packet>,
    in_boost: bool,
    owned_queues: Vec<u16>,
    short_epoch: crate::clock::EpochTicker,
    long_epoch: crate::clock::EpochTicker,
    consecutive_large_queue_epochs: u32,
    pending_moves: Vec<PendingMove>,
    drops: DropCounters,
    activity: ActivityCell,
}

impl NormalCore {
    /// Creates a new core. `command_rx`/`migration_rx` must be this core's
    /// own receivers, taken once from the `RuntimeBus` at startup.
    pub fn new(
        core_id: u16,
        qid: u16,
        runtime: SharedRuntime,
        command_rx: flume::Receiver<Command>,
        migration_rx: flume::Receiver<MigrationBatch>,
    ) -> Self {
        let now = runtime.clock.now_ns();
        let short_epoch_ns = runtime.config.short_epoch_ns;
        let long_epoch_ns = runtime.config.long_epoch_ns;
        Self {
            core_id,
            qid,
            runtime,
            command_rx,
            migration_rx,
            flow_table: FlowTable::with_capacity(1024),
            local_ring: VecDeque::new(),
            boost_ring: VecDeque::new(),
            in_boost: false,
            owned_queues: Vec::new(),
            short_epoch: crate::clock::EpochTicker::new(short_epoch_ns, now),
            long_epoch: crate::clock::EpochTicker::new(long_epoch_ns, now),
            consecutive_large_queue_epochs: 0,
            pending_moves: Vec::new(),
            drops: DropCounters::new(),
            activity: ActivityCell::new(CoreActivity::Running),
        }
    }

    /// This core's id.
    pub fn core_id(&self) -> u16 {
        self.core_id
    }

    /// A view of this core's lifecycle state.
    pub fn activity(&self) -> ActivityCell {
        self.activity.clone()
    }

    /// Snapshot of this core's drop-class counters.
    pub fn drop_counters(&self) -> DropCountersSnapshot {
        self.drops.snapshot()
    }

    /// Number of packets currently sitting in the local ring.
    pub fn local_ring_len(&self) -> usize {
        self.local_ring.len()
    }

    /// Number of short epochs closed so far.
    pub fn short_epoch_id(&self) -> u64 {
        self.short_epoch.epoch_id()
    }

    /// Looks up a flow's current state, for tests and diagnostics.
    pub fn flow_state(&self, key: &FlowKey) -> Option<&FlowState> {
        self.flow_table.lookup(key)
    }

    /// Number of sw-queues this core currently owns as a producer.
    pub fn owned_queue_count(&self) -> usize {
        self.owned_queues.len()
    }

    /// Runs the core's cooperative loop until a `Stop` command is observed
    /// and the current batch finishes.
    pub fn run(&mut self) {
        self.activity.set(CoreActivity::Running);
        loop {
            if !self.handle_commands() {
                break;
            }
            if self.activity.get() == CoreActivity::Paused {
                continue;
            }
            self.step();
        }
        self.activity.set(CoreActivity::Drained);
        let _ = self
            .runtime
            .bus
            .notification_sender()
            .send(Notification::Drained { core_id: self.core_id });
    }

    /// Runs exactly one pass of `Recv -> Admit -> Process -> EpochClose`,
    /// without touching the command channel. Exposed for tests that drive
    /// the core deterministically against a `ManualClock`.
    pub fn step(&mut self) {
        self.absorb_migrations();
        let pulled = self.recv_and_route();
        self.maybe_enter_boost(pulled);
        self.process_local();
        self.maybe_close_short_epoch();
    }

    /// Drains pending commands without blocking. Returns `false` if a `Stop`
    /// was observed (caller should finish up and exit its loop).
    pub fn handle_commands(&mut self) -> bool {
        let now = self.runtime.clock.now_ns();
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::BeginBucketMove { bucket, new_owner } => {
                    self.pending_moves.push(PendingMove {
                        bucket,
                        new_owner,
                        signaled_at_ns: now,
                    });
                }
                Command::Pause => {
                    self.activity.set(CoreActivity::Paused);
                    tracing::info!(core_id = self.core_id, "normal core parked (role demoted to unused)");
                }
                Command::Resume => {
                    self.activity.set(CoreActivity::Running);
                    tracing::info!(core_id = self.core_id, "normal core resumed (role promoted to normal)");
                }
                Command::Stop => {
                    self.activity.set(CoreActivity::Draining);
                    return false;
                }
                other => {
                    tracing::warn!(core_id = self.core_id, %other, "normal core received an unexpected command");
                }
            }
        }
        true
    }

    fn absorb_migrations(&mut self) {
        while let Ok(batch) = self.migration_rx.try_recv() {
            let count = batch.flows.len();
            for (key, state) in batch.flows {
                self.flow_table.insert(key, state);
            }
            self.runtime.bucket_stats.set_owner(batch.bucket, self.core_id);
            self.runtime.bucket_stats.clear_pending_move(batch.bucket);
            tracing::info!(core_id = self.core_id, bucket = batch.bucket, flows = count, "absorbed migrated bucket");
        }
    }

    /// Steps 1-2 of §4.4: pull up to `MAX_BATCHES_PER_PULL` batches from the
    /// NIC and route each packet per its flow's `offload_target`. Returns the
    /// total number of packets pulled this pass.
    fn recv_and_route(&mut self) -> usize {
        let mut pulled_total = 0usize;
        for _ in 0..MAX_BATCHES_PER_PULL {
            let batch = self.runtime.nic.recv(self.qid, BATCH_SIZE);
            if batch.is_empty() {
                break;
            }
            pulled_total += batch.len();
            for packet in batch {
                self.route_one(packet);
            }
        }
        pulled_total
    }

    fn route_one(&mut self, mut packet: Packet) {
        let Some(key) = packet.flow_key() else {
            return; // non-L4, freed
        };
        let bucket = packet.rss_bucket(self.runtime.config.rss_size);

        let (slot, is_new, state) = self.flow_table.get_or_insert_with(key, || FlowState::new(key, bucket));
        state.ingress_count += 1;
        state.short_epoch_count += 1;
        let target = state.offload_target;
        packet.flow_slot = Some(slot);
        if is_new {
            self.runtime.bucket_stats.record_new_flow(bucket);
        }

        match target {
            OffloadTarget::None => {
                if let Some(state) = self.flow_table.get_checked_mut(slot, &key) {
                    state.queued += 1;
                }
                if self.in_boost {
                    self.boost_ring.push_back(packet);
                } else {
                    self.local_ring.push_back(packet);
                }
                self.runtime.bucket_stats.record_packet(bucket);
            }
            OffloadTarget::DumpNoRoom => {
                self.account_drop_egress(&key, Some(slot));
                self.drops.bump(DropClass::NoRoom);
            }
            OffloadTarget::DumpSuperFlow => {
                self.account_drop_egress(&key, Some(slot));
                self.drops.bump(DropClass::SuperFlow);
            }
            OffloadTarget::SwQueue(qid) => {
                if self.runtime.sw_queues.consumer_core(qid).is_none() {
                    // Consumer gone or never bound: same as DumpSuperFlow —
                    // reset offload (so the flow re-enters next epoch's
                    // unoffload admission set instead of staying pinned to
                    // a dead queue) and treat as a drop.
                    if let Some(state) = self.flow_table.get_checked_mut(slot, &key) {
                        state.offload_target = OffloadTarget::None;
                    }
                    self.account_drop_egress(&key, Some(slot));
                    self.drops.bump(DropClass::StaleOffload);
                } else {
                    self.account_drop_egress(&key, Some(slot));
                    let enqueued = self.runtime.sw_queues.enqueue_burst(qid, std::iter::once(packet));
                    if enqueued == 0 {
                        self.drops.bump(DropClass::LocalQueueOverflow);
                    } else {
                        self.runtime.bucket_stats.record_packet(bucket);
                    }
                }
            }
        }
    }

    /// Looks up `key` via its cached slot hint first, falling back to a
    /// full probe if the hint is absent or stale.
    fn account_drop_egress(&mut self, key: &FlowKey, hint: Option<u32>) {
        let state = match hint.and_then(|idx| self.flow_table.get_checked_mut(idx, key)) {
            Some(state) => Some(state),
            None => self.flow_table.lookup_mut(key),
        };
        if let Some(state) = state {
            if state.ingress_count > state.egress_count {
                state.egress_count += 1;
            }
        }
    }

    fn large_queue_threshold(&self) -> usize {
        (self.runtime.config.epoch_packet_thresh as f64 * self.runtime.config.large_queue_thresh_ratio).round() as usize
    }

    /// Step 4 of §4.4: enter boost when a pass pulled a full load or the
    /// local ring backed up; leave once the ring has drained to half the
    /// large-queue threshold.
    fn maybe_enter_boost(&mut self, pulled_this_pass: usize) {
        let large_thresh = self.large_queue_threshold();
        if !self.in_boost && (pulled_this_pass >= BUSY_PULL_THRESHOLD || self.local_ring.len() >= large_thresh) {
            self.in_boost = true;
            tracing::debug!(core_id = self.core_id, "entering boost mode");
        }
        if self.in_boost && self.local_ring.len() < large_thresh / 2 {
            self.in_boost = false;
            tracing::debug!(core_id = self.core_id, "leaving boost mode");
        }
    }

    /// Step 3 of §4.4: while the local ring has work and the core is not
    /// boosting, drain it in batches of `BATCH_SIZE` through the NF.
    fn process_local(&mut self) {
        if self.in_boost {
            self.process_boost_ring();
            return;
        }
        while !self.local_ring.is_empty() {
            let take = self.local_ring.len().min(BATCH_SIZE);
            let batch: Vec<Packet> = self.local_ring.drain(..take).collect();
            self.call_nf(batch);
        }
    }

    fn process_boost_ring(&mut self) {
        if self.boost_ring.is_empty() {
            return;
        }
        let take = self.boost_ring.len().min(BATCH_SIZE);
        let batch: Vec<Packet> = self.boost_ring.drain(..take).collect();
        self.call_nf(batch);
    }

    fn call_nf(&mut self, mut batch: Vec<Packet>) {
        // Each packet was already counted once against its bucket at
        // classification time (`route_one`'s `OffloadTarget::None`/`SwQueue`
        // arms) — don't recount it here, or locally-served buckets would
        // read ~2x their true offered load against the scheduler's pps
        // estimate.
        let snapshot: Vec<(FlowKey, Option<u32>)> = batch
            .iter()
            .filter_map(|p| p.flow_key().map(|key| (key, p.flow_slot)))
            .collect();

        let ctx = NfContext {
            now_ns: self.runtime.clock.now_ns(),
            core_id: self.core_id,
        };
        self.runtime.nf.process_batch(&ctx, &mut batch);

        for (key, hint) in snapshot {
            let state = match hint.and_then(|idx| self.flow_table.get_checked_mut(idx, &key)) {
                Some(state) => Some(state),
                None => self.flow_table.lookup_mut(&key),
            };
            if let Some(state) = state {
                if state.ingress_count > state.egress_count {
                    state.egress_count += 1;
                }
                state.queued = state.queued.saturating_sub(1);
            }
        }
    }

    /// Step 5 of §4.4: short-epoch close - admission, split, sw-queue
    /// lifecycle upkeep, consecutive-large-queue tracking, and bucket-move
    /// progress.
    fn maybe_close_short_epoch(&mut self) {
        let now = self.runtime.clock.now_ns();
        if self.short_epoch.try_tick(now).is_none() {
            return;
        }

        self.run_admission();
        let touched = self.split_local_ring_to_sw_queues();
        self.update_owned_queue_lifecycle(&touched);

        let large_thresh = self.large_queue_threshold();
        if self.local_ring.len() >= large_thresh {
            self.consecutive_large_queue_epochs += 1;
        } else {
            self.consecutive_large_queue_epochs = 0;
        }
        if self.consecutive_large_queue_epochs > 1 {
            let _ = self
                .runtime
                .bus
                .notification_sender()
                .send(Notification::RebalanceNow { core_id: self.core_id });
        }

        if self.long_epoch.remaining_ns(now) <= self.short_epoch.period_ns() {
            self.publish_bucket_stats();
        }

        for (_, state) in self.flow_table.iter_mut() {
            state.short_epoch_count = 0;
        }

        self.progress_pending_moves(now);
    }

    /// §4.4.1: first-fit packing of this epoch's touched, unassigned flows
    /// onto the local ring, existing owned sw-queues, or a newly claimed one.
    fn run_admission(&mut self) {
        let thresh = self.runtime.config.epoch_packet_thresh;
        let mut local_assigned: u64 = 0;

        let touched_keys: Vec<FlowKey> = self
            .flow_table
            .iter()
            .filter(|(_, state)| state.short_epoch_count > 0 && state.offload_target == OffloadTarget::None)
            .map(|(key, _)| *key)
            .collect();

        let mut decisions = Vec::with_capacity(touched_keys.len());
        for key in touched_keys {
            let queued = self.flow_table.lookup(&key).map(FlowState::queued_packet_count).unwrap_or(0);

            let target = if queued > thresh {
                OffloadTarget::DumpSuperFlow
            } else if local_assigned + queued < thresh {
                local_assigned += queued;
                OffloadTarget::None
            } else if let Some(qid) = self.first_fit_existing_queue(queued, thresh) {
                OffloadTarget::SwQueue(qid)
            } else if let Some(qid) = self.runtime.sw_queues.claim(self.core_id) {
                self.owned_queues.push(qid);
                OffloadTarget::SwQueue(qid)
            } else {
                OffloadTarget::DumpNoRoom
            };
            decisions.push((key, target));
        }

        for (key, target) in decisions {
            if let Some(state) = self.flow_table.lookup_mut(&key) {
                state.offload_target = target;
            }
        }
    }

    fn first_fit_existing_queue(&self, queued: u64, thresh: u64) -> Option<u16> {
        self.owned_queues.iter().copied().find(|&qid| {
            let assigned = self.runtime.sw_queues.ring_len(qid) as u64;
            assigned + queued < thresh
        })
    }

    /// Scans the entire local ring once, routing each packet per its flow's
    /// (possibly just-reassigned) `offload_target`. Returns the set of
    /// sw-queues that received at least one packet this pass.
    fn split_local_ring_to_sw_queues(&mut self) -> HashSet<u16> {
        let mut touched = HashSet::new();
        let pending: Vec<Packet> = self.local_ring.drain(..).collect();
        let mut keep_local = Vec::with_capacity(pending.len());

        for packet in pending {
            let key = packet.flow_key();
            let hint = packet.flow_slot;
            let target = key.and_then(|k| {
                hint.and_then(|idx| self.flow_table.get_checked(idx, &k))
                    .or_else(|| self.flow_table.lookup(&k))
                    .map(|s| s.offload_target)
            });

            match target {
                None | Some(OffloadTarget::None) => keep_local.push(packet),
                Some(OffloadTarget::DumpSuperFlow) => {
                    if let Some(key) = key {
                        self.account_drop_egress(&key, hint);
                    }
                    self.drops.bump(DropClass::SuperFlow);
                }
                Some(OffloadTarget::DumpNoRoom) => {
                    if let Some(key) = key {
                        self.account_drop_egress(&key, hint);
                    }
                    self.drops.bump(DropClass::NoRoom);
                }
                Some(OffloadTarget::SwQueue(qid)) => {
                    let claimed_or_active = matches!(self.runtime.sw_queues.phase(qid), Phase::Claimed | Phase::Active);
                    if let Some(key) = key {
                        self.account_drop_egress(&key, hint);
                    }
                    if !claimed_or_active {
                        if let Some(k) = key {
                            let state = hint
                                .and_then(|idx| self.flow_table.get_checked_mut(idx, &k))
                                .or_else(|| self.flow_table.lookup_mut(&k));
                            if let Some(state) = state {
                                state.offload_target = OffloadTarget::None;
                            }
                        }
                        self.drops.bump(DropClass::StaleOffload);
                        continue;
                    }
                    let enqueued = self.runtime.sw_queues.enqueue_burst(qid, std::iter::once(packet));
                    if enqueued == 1 {
                        let _ = touched.insert(qid);
                    } else {
                        self.drops.bump(DropClass::LocalQueueOverflow);
                    }
                }
            }
        }

        self.local_ring.extend(keep_local);
        touched
    }

    fn update_owned_queue_lifecycle(&mut self, touched: &HashSet<u16>) {
        let owned = self.owned_queues.clone();
        for qid in owned {
            if touched.contains(&qid) {
                if matches!(self.runtime.sw_queues.phase(qid), Phase::Claimed) {
                    match self.runtime.reserved_directory.acquire_idle() {
                        Some(rcore) => {
                            self.runtime.sw_queues.bind_consumer(qid, rcore);
                            self.runtime.bus.send_command(rcore, Command::ToWork { queue_id: qid });
                            tracing::info!(core_id = self.core_id, queue_id = qid, reserved_core = rcore, "activated reserved core for sw-queue");
                        }
                        None => {
                            tracing::warn!(core_id = self.core_id, queue_id = qid, "sw-queue claimed but no reserved core is available");
                        }
                    }
                }
                continue;
            }

            match self.runtime.sw_queues.phase(qid) {
                Phase::Active => {
                    let idle_epochs = self.runtime.sw_queues.age_idle_epoch(qid);
                    if idle_epochs >= self.runtime.config.sw_queue_idle_epochs_threshold {
                        if let Some(consumer) = self.runtime.sw_queues.consumer_core(qid) {
                            self.runtime.bus.send_command(consumer, Command::ToRest { queue_id: qid });
                        }
                        self.owned_queues.retain(|&q| q != qid);
                    }
                }
                Phase::Claimed => {
                    // Claimed but never successfully enqueued into: hand it
                    // back rather than let it sit idle.
                    self.runtime.sw_queues.release(qid);
                    self.owned_queues.retain(|&q| q != qid);
                }
                Phase::Draining | Phase::Free => {
                    self.owned_queues.retain(|&q| q != qid);
                }
            }
        }
    }

    fn publish_bucket_stats(&self) {
        tracing::trace!(core_id = self.core_id, "publishing per-bucket stats ahead of long-epoch tick");
    }

    /// §4.6's commit protocol, old-owner side: once the draining grace
    /// period (one short epoch) has elapsed since `BeginBucketMove` was
    /// observed, detach the bucket's flows and hand them to the new owner.
    fn progress_pending_moves(&mut self, now_ns: u64) {
        let grace_ns = self.short_epoch.period_ns();
        let mut ready = Vec::new();
        self.pending_moves.retain(|mv| {
            if now_ns.saturating_sub(mv.signaled_at_ns) >= grace_ns {
                ready.push(*mv);
                false
            } else {
                true
            }
        });

        for mv in ready {
            let drained = self.flow_table.drain_bucket(mv.bucket);
            tracing::info!(
                core_id = self.core_id,
                bucket = mv.bucket,
                new_owner = mv.new_owner,
                flows = drained.len(),
                "draining bucket for migration"
            );
            self.runtime.bus.send_migration(
                mv.new_owner,
                MigrationBatch {
                    bucket: mv.bucket,
                    flows: drained,
                },
            );
            let _ = self
                .runtime
                .bus
                .notification_sender()
                .send(Notification::BucketMoveComplete { bucket: mv.bucket });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bucket::BucketStats;
    use flow::L4Protocol;
    use nfv_config::{ProfilePoint, WorkerConfig};
    use nic::FakeNic;
    use packet::build_test_packet;
    use runtime_bus::{ReservedCoreDirectory, RuntimeBus};
    use swqueue::SwQueuePool;

    use super::*;
    use crate::clock::ManualClock;
    use crate::nf::NoopNf;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            ncore: 1,
            rcore: 1,
            rss_size: 512,
            sw_queue_pool_size: 4,
            ring_capacity: 64,
            epoch_packet_thresh: 4,
            short_epoch_ns: 1_000,
            long_epoch_ns: 1_000_000,
            migrate_headroom: 0.1,
            assign_headroom: 0.2,
            consolidation_min_liveness_epochs: 4,
            sw_queue_idle_epochs_threshold: 100,
            rss_update_min_interval_ns: 5_000_000,
            large_queue_thresh_ratio: 1.0,
            spare_normal_cores: 1,
            profile_curve: vec![ProfilePoint {
                flow_count: 1_000,
                max_pps: 1_000_000.0,
            }],
        }
    }

    fn test_core(nic: Arc<FakeNic>) -> (NormalCore, Arc<RuntimeBus>) {
        let mut bus = RuntimeBus::new(2);
        let command_rx = bus.take_command_receiver(0).unwrap();
        let migration_rx = bus.take_migration_receiver(0).unwrap();
        let bus = Arc::new(bus);
        let runtime = SharedRuntime {
            config: Arc::new(test_config()),
            nic,
            bucket_stats: Arc::new(BucketStats::new(512)),
            sw_queues: Arc::new(SwQueuePool::new(4, 64)),
            bus: Arc::clone(&bus),
            reserved_directory: Arc::new(ReservedCoreDirectory::new([1u16])),
            nf: Arc::new(NoopNf),
            clock: Arc::new(ManualClock::new()),
        };
        (NormalCore::new(0, 0, runtime, command_rx, migration_rx), bus)
    }

    #[test]
    fn recv_routes_new_flow_onto_local_ring() {
        let nic = Arc::new(FakeNic::new(1));
        nic.inject(0, vec![build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 0)]);
        let (mut core, _bus) = test_core(nic);

        core.recv_and_route();
        assert_eq!(core.local_ring_len(), 1);
    }

    #[test]
    fn routed_packet_carries_a_flow_slot_hint_matching_the_table() {
        let nic = Arc::new(FakeNic::new(1));
        let (mut core, _bus) = test_core(nic);
        let key = FlowKey::new([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80);

        core.route_one(build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 0));

        let packet = core.local_ring.front().expect("packet should have landed in the local ring");
        let slot = packet.flow_slot.expect("route_one should populate flow_slot");
        assert_eq!(core.flow_table.get_checked(slot, &key).unwrap().ingress_count, 1);
    }

    #[test]
    fn stale_sw_queue_offload_resets_to_none_instead_of_pinning_the_flow() {
        let nic = Arc::new(FakeNic::new(1));
        let (mut core, _bus) = test_core(nic);
        let key = FlowKey::new([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80);
        let mut state = FlowState::new(key, 0);
        state.offload_target = OffloadTarget::SwQueue(2); // no consumer bound to qid 2
        core.flow_table.insert(key, state);

        core.route_one(build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 0));

        assert_eq!(core.drop_counters().stale_offload, 1);
        assert_eq!(
            core.flow_state(&key).unwrap().offload_target,
            OffloadTarget::None,
            "a flow whose sw-queue consumer is gone must re-enter the unoffload admission set"
        );
    }

    #[test]
    fn locally_served_packets_are_counted_exactly_once_against_bucket_stats() {
        let nic = Arc::new(FakeNic::new(1));
        let (mut core, _bus) = test_core(nic);
        let bucket_stats = Arc::clone(&core.runtime.bucket_stats);

        core.route_one(build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 0));
        core.process_local();

        let bucket = build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80, 0)
            .rss_bucket(core.runtime.config.rss_size);
        assert_eq!(bucket_stats.snapshot_and_reset()[usize::from(bucket)].packet_count, 1);
    }

    #[test]
    fn admission_sends_overflow_flows_to_a_claimed_sw_queue() {
        let nic = Arc::new(FakeNic::new(1));
        let (mut core, _bus) = test_core(nic);

        for port in 0..10u16 {
            let packet = build_test_packet([10, 0, 0, 1], [10, 0, 0, port as u8 + 1], L4Protocol::Tcp, port, 80, 0);
            core.route_one(packet);
        }
        assert_eq!(core.local_ring.len(), 10);

        core.run_admission();
        let offloaded = core
            .flow_table
            .iter()
            .filter(|(_, state)| matches!(state.offload_target, OffloadTarget::SwQueue(_)))
            .count();
        assert!(offloaded > 0, "at least one flow should have been pushed to a sw-queue");
    }

    #[test]
    fn boost_mode_engages_when_local_ring_backs_up() {
        let nic = Arc::new(FakeNic::new(1));
        let (mut core, _bus) = test_core(nic);
        for port in 0..5u16 {
            core.route_one(build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, port, 80, 0));
        }
        core.maybe_enter_boost(0);
        assert!(core.in_boost, "a ring at the large-queue threshold should trigger boost");
    }

    #[test]
    fn full_step_processes_a_simple_flow_through_the_noop_nf() {
        let nic = Arc::new(FakeNic::new(1));
        nic.inject(0, vec![build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Udp, 1, 2, 0)]);
        let (mut core, _bus) = test_core(nic);

        core.step();
        assert_eq!(core.local_ring_len(), 0, "the lone packet should clear the local ring in one step");
    }

    #[test]
    fn bucket_move_drains_and_delivers_via_migration_channel() {
        let nic = Arc::new(FakeNic::new(1));
        let mut bus = RuntimeBus::new(2);
        let command_rx = bus.take_command_receiver(0).unwrap();
        let migration_rx = bus.take_migration_receiver(0).unwrap();
        let new_owner_migration_rx = bus.take_migration_receiver(1).unwrap();
        let bus = Arc::new(bus);
        let runtime = SharedRuntime {
            config: Arc::new(test_config()),
            nic,
            bucket_stats: Arc::new(BucketStats::new(512)),
            sw_queues: Arc::new(SwQueuePool::new(4, 64)),
            bus: Arc::clone(&bus),
            reserved_directory: Arc::new(ReservedCoreDirectory::new([1u16])),
            nf: Arc::new(NoopNf),
            clock: Arc::new(ManualClock::new()),
        };
        let mut old_owner = NormalCore::new(0, 0, runtime, command_rx, migration_rx);

        let packet = build_test_packet([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1, 2, 0);
        let bucket = packet.rss_bucket(512);
        old_owner.route_one(packet);

        old_owner.handle_commands();
        bus.send_command(0, Command::BeginBucketMove { bucket, new_owner: 1 });
        assert!(old_owner.handle_commands());

        old_owner.progress_pending_moves(0);
        assert!(old_owner.pending_moves.len() == 1, "grace period has not elapsed yet");

        old_owner.progress_pending_moves(old_owner.short_epoch.period_ns());
        assert!(old_owner.pending_moves.is_empty());

        let delivered = new_owner_migration_rx.try_recv().expect("migration batch should have been sent");
        assert_eq!(delivered.bucket, bucket);
        assert_eq!(delivered.flows.len(), 1);
    }
}
