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

//! `Scheduler`: the long-term, per-long-epoch bucket-to-core repacking
//! algorithm, plus its on-demand single-core variant and the rate-limited
//! RSS indirection commit protocol.
//!
//! Grounded on `nfv_ctrl_long.cc`'s `LongTermOptimization`/`FindMoves` and
//! `nfv_ctrl.h`'s `OnDemandLongEpochProcess`: evict a core's buckets
//! last-added-first until it is back under `(1 - migrate_headroom) *
//! capacity`, place evicted buckets first-fit onto existing cores (or
//! activate a parked one), then try to consolidate the least-loaded core
//! back to `Unused` if that can be done without activating anything new.

use std::collections::BTreeMap;
use std::sync::Arc;

use bucket::{BucketStats, BucketStatsRecord, INVALID_CORE};
use nfv_config::WorkerConfig;
use nic::NicAdapter;
use runtime_bus::{Command, RuntimeBus};
use worker::{ActivityCell, CoreActivity, TimeSource};

/// The role a candidate core currently plays in the placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRole {
    /// Actively owns zero or more RSS buckets and runs the short-epoch loop.
    Normal,
    /// Parked: no buckets owned, hot loop paused, available for activation.
    Unused,
}

/// The Scheduler's bookkeeping for one candidate core - the Rust analogue of
/// the original's `core_bucket_mapping_` entry, updated at decision time
/// rather than waiting for the drain protocol to complete.
#[derive(Debug, Clone)]
pub struct CoreState {
    /// Current role.
    pub role: CoreRole,
    /// Consecutive long epochs this core has held `Normal` role while
    /// non-empty and without having a bucket evicted off it; reset to 1 the
    /// moment a bucket is shed, so a core that was just rebalanced can't
    /// look stable again right away. Consolidation eligibility requires this
    /// to exceed `consolidation_min_liveness_epochs`.
    pub liveness_epochs: u32,
    /// Buckets currently assigned to this core, in assignment order (the
    /// back of this vector is "most recently added", the LIFO eviction
    /// order `nfv_ctrl_long.cc` uses).
    pub owned_buckets: Vec<u16>,
    /// This core's aggregate packets-per-second over the last measured
    /// window.
    pub current_rate_pps: f64,
    /// This core's aggregate distinct flow count over the last measured
    /// window.
    pub flow_count: u32,
}

impl CoreState {
    fn new(role: CoreRole) -> Self {
        Self {
            role,
            liveness_epochs: 0,
            owned_buckets: Vec::new(),
            current_rate_pps: 0.0,
            flow_count: 0,
        }
    }
}

/// A snapshot of the Scheduler's view of the world, for the control-plane
/// `get_stats()` surface; the binary combines this with each core's
/// `DropCountersSnapshot` to assemble the full shape.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    /// Per-core packets-per-second, Normal-role cores only.
    pub per_core_rate: BTreeMap<u16, f64>,
    /// Per-core distinct flow count, Normal-role cores only.
    pub per_core_flow_count: BTreeMap<u16, u32>,
    /// Number of long epochs processed so far.
    pub epoch_id: u64,
    /// Core ids currently in the `Normal` role.
    pub active_cores: Vec<u16>,
}

/// The long-term placement and rebalancing authority. Runs on its own
/// thread (or is driven synchronously by the binary's control loop);
/// everything it touches is either owned outright (`core_states`) or a
/// shared, already-thread-safe handle (`bucket_stats`, `bus`, `nic`).
pub struct Scheduler {
    config: Arc<WorkerConfig>,
    nic: Arc<dyn NicAdapter>,
    bucket_stats: Arc<BucketStats>,
    bus: Arc<RuntimeBus>,
    clock: Arc<dyn TimeSource>,
    core_states: BTreeMap<u16, CoreState>,
    activity: BTreeMap<u16, ActivityCell>,
    long_epoch: worker::EpochTicker,
    last_rss_update_ns: u64,
    epoch_id: u64,
}

impl Scheduler {
    /// Creates a Scheduler over `normal_core_ids` (initially active) and
    /// `unused_core_ids` (initially parked, available for activation),
    /// performs the initial round-robin bucket assignment, and programs the
    /// NIC's RSS table once up front.
    pub fn new(
        config: Arc<WorkerConfig>,
        nic: Arc<dyn NicAdapter>,
        bucket_stats: Arc<BucketStats>,
        bus: Arc<RuntimeBus>,
        clock: Arc<dyn TimeSource>,
        normal_core_ids: impl IntoIterator<Item = u16>,
        unused_core_ids: impl IntoIterator<Item = u16>,
        activity: BTreeMap<u16, ActivityCell>,
    ) -> Self {
        let mut core_states = BTreeMap::new();
        for core_id in normal_core_ids {
            let _ = core_states.insert(core_id, CoreState::new(CoreRole::Normal));
        }
        for core_id in unused_core_ids {
            let _ = core_states.insert(core_id, CoreState::new(CoreRole::Unused));
        }

        let now = clock.now_ns();
        let long_epoch_ns = config.long_epoch_ns;
        let mut scheduler = Self {
            config,
            nic,
            bucket_stats,
            bus,
            clock,
            core_states,
            activity,
            long_epoch: worker::EpochTicker::new(long_epoch_ns, now),
            last_rss_update_ns: 0,
            epoch_id: 0,
        };
        scheduler.initial_assignment();
        scheduler
    }

    /// A read-only view of every candidate core's current bookkeeping.
    pub fn core_states(&self) -> &BTreeMap<u16, CoreState> {
        &self.core_states
    }

    /// A snapshot suitable for the control-plane `get_stats()` surface.
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            epoch_id: self.epoch_id,
            ..Default::default()
        };
        for (&core_id, state) in &self.core_states {
            if state.role == CoreRole::Normal {
                stats.active_cores.push(core_id);
                let _ = stats.per_core_rate.insert(core_id, state.current_rate_pps);
                let _ = stats.per_core_flow_count.insert(core_id, state.flow_count);
            }
        }
        stats
    }

    fn initial_assignment(&mut self) {
        let normal_ids: Vec<u16> = self.core_states.iter().filter(|(_, s)| s.role == CoreRole::Normal).map(|(&id, _)| id).collect();
        if normal_ids.is_empty() {
            tracing::warn!("scheduler initialized with no normal cores; every bucket is unassigned");
            return;
        }
        for bucket in 0..self.config.rss_size {
            let core_id = normal_ids[usize::from(bucket) % normal_ids.len()];
            self.bucket_stats.set_owner(bucket, core_id);
            if let Some(state) = self.core_states.get_mut(&core_id) {
                state.owned_buckets.push(bucket);
            }
        }
        let table = self.build_indirection_table();
        match self.nic.update_rss(&table) {
            Ok(()) => self.last_rss_update_ns = self.clock.now_ns(),
            Err(error) => tracing::error!(%error, "initial RSS table programming failed"),
        }
    }

    fn build_indirection_table(&self) -> Vec<u16> {
        let mut table = vec![INVALID_CORE; usize::from(self.config.rss_size)];
        for (&core_id, state) in &self.core_states {
            for &bucket in &state.owned_buckets {
                table[usize::from(bucket)] = core_id;
            }
        }
        table
    }

    fn bucket_owner_map(&self) -> Vec<Option<u16>> {
        let mut owner = vec![None; usize::from(self.config.rss_size)];
        for (&core_id, state) in &self.core_states {
            for &bucket in &state.owned_buckets {
                owner[usize::from(bucket)] = Some(core_id);
            }
        }
        owner
    }

    /// First-fit placement of `buckets` (bucket, rate, flow_count) onto
    /// existing `Normal` cores in `states` (lowest id first, skipping
    /// `exclude`), activating the lowest-id `Unused` core when nothing
    /// fits. Returns the resulting moves, which cores were newly activated,
    /// and which buckets could not be placed at all (pool exhausted).
    fn find_moves(
        states: &mut BTreeMap<u16, CoreState>,
        buckets: &[(u16, f64, u32)],
        exclude: Option<u16>,
        config: &WorkerConfig,
    ) -> (Vec<(u16, u16)>, Vec<u16>, Vec<u16>) {
        let mut moves = Vec::new();
        let mut activated = Vec::new();
        let mut unplaced = Vec::new();

        for &(bucket, rate, flow_count) in buckets {
            let candidate_ids: Vec<u16> = states
                .iter()
                .filter(|(&id, s)| s.role == CoreRole::Normal && Some(id) != exclude)
                .map(|(&id, _)| id)
                .collect();

            let mut placed_on = None;
            for id in candidate_ids {
                let state = states.get(&id).expect("candidate id came from this map");
                let projected_flow = state.flow_count + flow_count;
                let capacity = config.max_pps_per_core(projected_flow);
                if state.current_rate_pps + rate < capacity * (1.0 - config.assign_headroom) {
                    placed_on = Some(id);
                    break;
                }
            }

            if placed_on.is_none() {
                if let Some(&new_id) = states.iter().find(|(_, s)| s.role == CoreRole::Unused).map(|(id, _)| id) {
                    let state = states.get_mut(&new_id).expect("candidate id came from this map");
                    state.role = CoreRole::Normal;
                    state.liveness_epochs = 0;
                    activated.push(new_id);
                    placed_on = Some(new_id);
                }
            }

            match placed_on {
                Some(id) => {
                    let state = states.get_mut(&id).expect("candidate id came from this map");
                    state.owned_buckets.push(bucket);
                    state.current_rate_pps += rate;
                    state.flow_count += flow_count;
                    moves.push((bucket, id));
                }
                None => unplaced.push(bucket),
            }
        }

        (moves, activated, unplaced)
    }

    /// Evicts buckets from `core_id`, last-added-first, until its rate is
    /// back under `(1 - migrate_headroom) * capacity` or it owns nothing
    /// more to give up.
    fn evict_overloaded(&mut self, core_id: u16, bucket_rates: &[f64], records: &[BucketStatsRecord]) -> Vec<(u16, f64, u32)> {
        let mut evicted = Vec::new();
        loop {
            let Some(state) = self.core_states.get(&core_id) else { break };
            if state.owned_buckets.is_empty() {
                break;
            }
            let capacity = self.config.max_pps_per_core(state.flow_count);
            if state.current_rate_pps <= capacity * (1.0 - self.config.migrate_headroom) {
                break;
            }
            let state = self.core_states.get_mut(&core_id).expect("checked above");
            let bucket = state.owned_buckets.pop().expect("checked non-empty above");
            let rate = bucket_rates[usize::from(bucket)];
            let flow_count = records[usize::from(bucket)].flow_count as u32;
            state.current_rate_pps -= rate;
            state.flow_count = state.flow_count.saturating_sub(flow_count);
            // A core that just got rebalanced shouldn't look "stable" again
            // immediately: reset its liveness the moment a bucket is shed.
            state.liveness_epochs = 1;
            evicted.push((bucket, rate, flow_count));
        }
        evicted
    }

    /// Applies a set of `(bucket, new_owner)` moves: marks the bucket
    /// pending-move in the shared table and tells its current owner to
    /// begin the drain protocol. Buckets with no prior owner (should only
    /// occur if `initial_assignment` somehow skipped one) are committed
    /// directly.
    fn apply_moves(&self, moves: &[(u16, u16)], prior_owner: &[Option<u16>]) {
        for &(bucket, new_owner) in moves {
            match prior_owner[usize::from(bucket)] {
                Some(old_owner) if old_owner != new_owner => {
                    self.bucket_stats.mark_pending_move(bucket, new_owner);
                    self.bus.send_command(old_owner, Command::BeginBucketMove { bucket, new_owner });
                }
                Some(_) => {}
                None => self.bucket_stats.set_owner(bucket, new_owner),
            }
        }
    }

    fn activate(&mut self, core_ids: &[u16]) {
        for &core_id in core_ids {
            if let Some(activity) = self.activity.get(&core_id) {
                activity.set(CoreActivity::Running);
            }
            self.bus.send_command(core_id, Command::Resume);
            tracing::info!(core_id, "activated unused core to absorb overload");
        }
    }

    fn try_consolidate(&mut self, bucket_rates: &[f64], records: &[BucketStatsRecord]) -> Vec<(u16, u16)> {
        let active_normal: Vec<u16> = self.core_states.iter().filter(|(_, s)| s.role == CoreRole::Normal).map(|(&id, _)| id).collect();
        if active_normal.len() <= 1 {
            return Vec::new();
        }

        let eligible = active_normal
            .iter()
            .copied()
            .filter(|id| self.core_states[id].liveness_epochs > self.config.consolidation_min_liveness_epochs)
            .min_by(|a, b| {
                self.core_states[a]
                    .current_rate_pps
                    .partial_cmp(&self.core_states[b].current_rate_pps)
                    .expect("rates are never NaN")
            });

        let Some(candidate) = eligible else { return Vec::new() };
        let candidate_state = self.core_states[&candidate].clone();
        let capacity = self.config.max_pps_per_core(candidate_state.flow_count);
        if candidate_state.current_rate_pps > capacity / 2.0 {
            tracing::debug!(core_id = candidate, "consolidation skipped: candidate is not under half capacity");
            return Vec::new();
        }
        if candidate_state.owned_buckets.is_empty() {
            // Nothing to drain; safe to consolidate immediately.
            if let Some(state) = self.core_states.get_mut(&candidate) {
                state.role = CoreRole::Unused;
                state.liveness_epochs = 0;
            }
            if let Some(activity) = self.activity.get(&candidate) {
                activity.set(CoreActivity::Paused);
            }
            self.bus.send_command(candidate, Command::Pause);
            return Vec::new();
        }

        let buckets_to_move: Vec<(u16, f64, u32)> = candidate_state
            .owned_buckets
            .iter()
            .map(|&b| (b, bucket_rates[usize::from(b)], records[usize::from(b)].flow_count as u32))
            .collect();

        let mut trial_states = self.core_states.clone();
        let (trial_moves, activated, unplaced) = Self::find_moves(&mut trial_states, &buckets_to_move, Some(candidate), &self.config);

        if !activated.is_empty() || !unplaced.is_empty() {
            tracing::debug!(core_id = candidate, "consolidation trial rejected: would activate a new core or leave buckets unplaced");
            return Vec::new();
        }

        self.core_states = trial_states;
        if let Some(state) = self.core_states.get_mut(&candidate) {
            state.role = CoreRole::Unused;
            state.liveness_epochs = 0;
        }
        if let Some(activity) = self.activity.get(&candidate) {
            activity.set(CoreActivity::Paused);
        }
        self.bus.send_command(candidate, Command::Pause);
        tracing::info!(core_id = candidate, moved_buckets = trial_moves.len(), "consolidated core back to unused");
        trial_moves
    }

    /// Recomputes every core's `current_rate_pps`/`flow_count` from a fresh
    /// bucket-stats snapshot and the current ownership map. Returns the
    /// per-bucket pps rates, for eviction/placement bookkeeping.
    fn recompute_rates(&mut self, records: &[BucketStatsRecord], elapsed_secs: f64) -> Vec<f64> {
        for state in self.core_states.values_mut() {
            state.current_rate_pps = 0.0;
            state.flow_count = 0;
        }
        let owner = self.bucket_owner_map();
        let mut bucket_rates = vec![0.0f64; records.len()];
        for (bucket, record) in records.iter().enumerate() {
            let pps = record.packet_count as f64 / elapsed_secs;
            bucket_rates[bucket] = pps;
            if let Some(core_id) = owner[bucket] {
                if let Some(state) = self.core_states.get_mut(&core_id) {
                    state.current_rate_pps += pps;
                    state.flow_count += record.flow_count as u32;
                }
            }
        }
        bucket_rates
    }

    /// If at least one long-epoch period has elapsed, runs one full pass:
    /// evict overloaded cores, place their buckets (activating a parked
    /// core if needed), try to consolidate the least-loaded core back to
    /// `Unused`, and commit the resulting RSS table. Returns whether a pass
    /// actually ran.
    pub fn run_long_epoch(&mut self) -> bool {
        let now = self.clock.now_ns();
        if self.long_epoch.try_tick(now).is_none() {
            return false;
        }

        let records = self.bucket_stats.snapshot_and_reset();
        let elapsed_secs = (self.config.long_epoch_ns as f64 / 1_000_000_000.0).max(1e-9);
        let prior_owner = self.bucket_owner_map();
        let bucket_rates = self.recompute_rates(&records, elapsed_secs);

        for state in self.core_states.values_mut() {
            if state.role == CoreRole::Normal && !state.owned_buckets.is_empty() {
                state.liveness_epochs += 1;
            }
        }

        let overloaded_ids: Vec<u16> = self.core_states.iter().filter(|(_, s)| s.role == CoreRole::Normal).map(|(&id, _)| id).collect();
        let mut to_place = Vec::new();
        for core_id in overloaded_ids {
            to_place.extend(self.evict_overloaded(core_id, &bucket_rates, &records));
        }

        let mut all_moves = Vec::new();
        if !to_place.is_empty() {
            let (moves, activated, unplaced) = Self::find_moves(&mut self.core_states, &to_place, None, &self.config);
            self.activate(&activated);
            for bucket in unplaced {
                if let Some(core_id) = prior_owner[usize::from(bucket)] {
                    if let Some(state) = self.core_states.get_mut(&core_id) {
                        state.owned_buckets.push(bucket);
                        state.current_rate_pps += bucket_rates[usize::from(bucket)];
                        state.flow_count += records[usize::from(bucket)].flow_count as u32;
                    }
                    tracing::warn!(bucket, core_id, "no core available to absorb an overloaded bucket; leaving it in place");
                }
            }
            all_moves.extend(moves);
        }

        all_moves.extend(self.try_consolidate(&bucket_rates, &records));

        self.apply_moves(&all_moves, &prior_owner);
        if !all_moves.is_empty() {
            self.try_commit_rss(now);
        }

        self.epoch_id += 1;
        self.report_worker_info();
        true
    }

    /// The on-demand variant (`nfv_ctrl.h`'s `OnDemandLongEpochProcess`):
    /// triggered by a `RebalanceNow` notification from a core that has seen
    /// two or more consecutive short epochs with a large local-ring
    /// backlog. Forces a fresh bucket-stats snapshot (so, like the
    /// original, every core's rate is re-measured as a side effect, not
    /// just the requester's) and rebalances only `requesting_core`. Gated
    /// by the same RSS update rate limit as the long-epoch path; returns
    /// `false` without doing anything if the gate isn't open yet or the
    /// core turns out not to be overloaded after all.
    pub fn rebalance_now(&mut self, requesting_core: u16) -> bool {
        let now = self.clock.now_ns();
        if now.saturating_sub(self.last_rss_update_ns) < self.config.rss_update_min_interval_ns {
            tracing::debug!(core_id = requesting_core, "on-demand rebalance deferred: RSS update rate limit not yet elapsed");
            return false;
        }
        if !matches!(self.core_states.get(&requesting_core).map(|s| s.role), Some(CoreRole::Normal)) {
            return false;
        }

        let records = self.bucket_stats.snapshot_and_reset();
        let elapsed_secs = (self.config.short_epoch_ns as f64 * 2.0 / 1_000_000_000.0).max(1e-9);
        let prior_owner = self.bucket_owner_map();
        let bucket_rates = self.recompute_rates(&records, elapsed_secs);

        let to_place = self.evict_overloaded(requesting_core, &bucket_rates, &records);
        if to_place.is_empty() {
            tracing::debug!(core_id = requesting_core, "on-demand rebalance found nothing to move");
            return false;
        }

        let (moves, activated, unplaced) = Self::find_moves(&mut self.core_states, &to_place, Some(requesting_core), &self.config);
        self.activate(&activated);
        for bucket in unplaced {
            if let Some(state) = self.core_states.get_mut(&requesting_core) {
                state.owned_buckets.push(bucket);
                state.current_rate_pps += bucket_rates[usize::from(bucket)];
                state.flow_count += records[usize::from(bucket)].flow_count as u32;
            }
        }

        self.apply_moves(&moves, &prior_owner);
        if !moves.is_empty() {
            self.try_commit_rss(now);
        }
        !moves.is_empty()
    }

    fn try_commit_rss(&mut self, now_ns: u64) {
        if now_ns.saturating_sub(self.last_rss_update_ns) < self.config.rss_update_min_interval_ns {
            tracing::debug!("rss table commit skipped: within the minimum update interval");
            return;
        }
        let table = self.build_indirection_table();
        match self.nic.update_rss(&table) {
            Ok(()) => self.last_rss_update_ns = now_ns,
            Err(error) => tracing::warn!(%error, "update_rss failed, will retry next long epoch"),
        }
    }

    /// Checks the global ownership-uniqueness invariant: every RSS bucket
    /// has exactly one `Normal`-role owner, and the Scheduler's own
    /// bookkeeping (`owned_buckets`) agrees with the shared `BucketStats`
    /// table. Returns a diagnostic dump of both tables on violation - this
    /// should be unreachable, so the caller is expected to abort the process
    /// (exit code 4) rather than try to recover.
    pub fn assert_ownership_invariant(&self, bucket_stats: &BucketStats) -> Result<(), String> {
        let mut claims: BTreeMap<u16, Vec<u16>> = BTreeMap::new();
        for (&core_id, state) in &self.core_states {
            if state.role != CoreRole::Normal {
                continue;
            }
            for &bucket in &state.owned_buckets {
                claims.entry(bucket).or_default().push(core_id);
            }
        }

        let mut violations = Vec::new();
        for (&bucket, owners) in &claims {
            if owners.len() > 1 {
                violations.push(format!("bucket {bucket} claimed by cores {owners:?} (CoreState)"));
            }
        }
        for bucket in 0..self.config.rss_size {
            let recorded_owner = bucket_stats.owner(bucket);
            let scheduler_owner = claims.get(&bucket).and_then(|owners| owners.first().copied());
            match (scheduler_owner, recorded_owner) {
                (Some(expected), actual) if actual != expected && bucket_stats.pending_move_to(bucket).is_none() => {
                    violations.push(format!(
                        "bucket {bucket}: CoreState says core {expected}, BucketStats says core {actual} (RssBucket)"
                    ));
                }
                _ => {}
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(format!(
                "ownership invariant violated:\n{}\ncore states: {:?}",
                violations.join("\n"),
                self.core_states
            ))
        }
    }

    fn report_worker_info(&self) {
        for (&core_id, state) in &self.core_states {
            if state.role == CoreRole::Normal {
                tracing::info!(
                    core_id,
                    rate_pps = state.current_rate_pps,
                    flow_count = state.flow_count,
                    owned_buckets = state.owned_buckets.len(),
                    liveness_epochs = state.liveness_epochs,
                    "worker info"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use bucket::BucketStats;
    use nic::FakeNic;
    use runtime_bus::RuntimeBus;
    use worker::{ActivityCell, CoreActivity, ManualClock};

    use super::*;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            ncore: 2,
            rcore: 1,
            rss_size: 8,
            sw_queue_pool_size: 4,
            ring_capacity: 64,
            epoch_packet_thresh: 100,
            short_epoch_ns: 1_000,
            long_epoch_ns: 1_000_000_000,
            migrate_headroom: 0.1,
            assign_headroom: 0.2,
            consolidation_min_liveness_epochs: 2,
            sw_queue_idle_epochs_threshold: 100,
            rss_update_min_interval_ns: 5_000_000,
            large_queue_thresh_ratio: 1.0,
            spare_normal_cores: 1,
            profile_curve: vec![nfv_config::ProfilePoint {
                flow_count: 1_000_000,
                max_pps: 1_000.0,
            }],
        }
    }

    fn test_scheduler(normal: Vec<u16>, unused: Vec<u16>) -> (Scheduler, Arc<BucketStats>, Arc<FakeNic>, Arc<ManualClock>) {
        let config = Arc::new(test_config());
        let nic = Arc::new(FakeNic::new(4));
        let bucket_stats = Arc::new(BucketStats::new(config.rss_size));
        let bus = Arc::new(RuntimeBus::new(4));
        let clock = Arc::new(ManualClock::new());
        let mut activity = BTreeMap::new();
        for id in normal.iter().chain(unused.iter()) {
            let _ = activity.insert(*id, ActivityCell::new(CoreActivity::Running));
        }
        let scheduler = Scheduler::new(
            Arc::clone(&config),
            Arc::clone(&nic),
            Arc::clone(&bucket_stats),
            Arc::clone(&bus),
            Arc::clone(&clock),
            normal,
            unused,
            activity,
        );
        (scheduler, bucket_stats, nic, clock)
    }

    #[test]
    fn initial_assignment_round_robins_every_bucket_and_programs_rss() {
        let (scheduler, bucket_stats, nic, _clock) = test_scheduler(vec![0, 1], vec![2]);

        assert_eq!(nic.rss_update_call_count(), 1);
        let table = nic.last_rss_table().unwrap();
        assert_eq!(table.len(), 8);
        assert_eq!(bucket_stats.owner(0), 0);
        assert_eq!(bucket_stats.owner(1), 1);
        assert_eq!(scheduler.core_states()[&0].owned_buckets.len(), 4);
        assert_eq!(scheduler.core_states()[&1].owned_buckets.len(), 4);
        assert!(scheduler.core_states()[&2].owned_buckets.is_empty());
    }

    #[test]
    fn overloaded_core_sheds_buckets_and_activates_an_unused_core() {
        let (mut scheduler, bucket_stats, nic, clock) = test_scheduler(vec![0], vec![1]);

        // Core 0 owns every bucket; push enough traffic through bucket 7
        // (last-added, so first evicted) to exceed capacity.
        for _ in 0..5_000 {
            bucket_stats.record_packet(7);
        }
        clock.advance(scheduler_long_epoch_ns(&scheduler));

        assert!(scheduler.run_long_epoch());

        assert_eq!(scheduler.core_states()[&1].role, CoreRole::Normal, "core 1 should have been activated");
        assert!(!scheduler.core_states()[&1].owned_buckets.is_empty());
        assert!(nic.rss_update_call_count() >= 1);
    }

    #[test]
    fn consolidation_parks_an_idle_core_when_buckets_fit_elsewhere() {
        let (mut scheduler, bucket_stats, _nic, clock) = test_scheduler(vec![0, 1], vec![]);

        // Core 0 carries a little steady traffic (keeping it uniquely
        // non-minimal); core 1 stays idle. After enough epochs core 1
        // becomes consolidation-eligible (liveness > the configured
        // threshold) and, being strictly the lowest-rate core, is the one
        // parked.
        for _ in 0..4 {
            for _ in 0..50 {
                bucket_stats.record_packet(0);
            }
            clock.advance(scheduler_long_epoch_ns(&scheduler));
            let _ = scheduler.run_long_epoch();
        }

        assert_eq!(scheduler.core_states()[&1].role, CoreRole::Unused, "idle core should have been consolidated away");
        assert_eq!(scheduler.core_states()[&0].owned_buckets.len(), 8, "core 0 should have absorbed core 1's buckets");
    }

    #[test]
    fn rss_commit_respects_the_minimum_update_interval() {
        let (mut scheduler, bucket_stats, nic, clock) = test_scheduler(vec![0], vec![1]);
        let calls_after_init = nic.rss_update_call_count();

        for _ in 0..5_000 {
            bucket_stats.record_packet(7);
        }
        clock.advance(scheduler_long_epoch_ns(&scheduler));
        assert!(scheduler.run_long_epoch());
        assert!(nic.rss_update_call_count() > calls_after_init, "a real move should commit the RSS table");

        // An on-demand rebalance arriving well within the 5ms RSS update
        // interval must be deferred rather than issuing a second NIC call.
        let calls_after_first_move = nic.rss_update_call_count();
        for _ in 0..5_000 {
            bucket_stats.record_packet(0);
        }
        clock.advance(1_000);
        let rebalanced = scheduler.rebalance_now(0);
        assert!(!rebalanced, "on-demand rebalance should be gated by the RSS update rate limit");
        assert_eq!(nic.rss_update_call_count(), calls_after_first_move, "rate limit should suppress a too-soon second commit");
    }

    #[test]
    fn ownership_invariant_holds_after_initial_assignment() {
        let (scheduler, bucket_stats, _nic, _clock) = test_scheduler(vec![0, 1], vec![2]);
        assert!(scheduler.assert_ownership_invariant(&bucket_stats).is_ok());
    }

    #[test]
    fn ownership_invariant_catches_a_duplicate_claim() {
        let (mut scheduler, bucket_stats, _nic, _clock) = test_scheduler(vec![0, 1], vec![]);
        let stolen = scheduler.core_states()[&0].owned_buckets[0];
        scheduler.core_states.get_mut(&1).unwrap().owned_buckets.push(stolen);

        let result = scheduler.assert_ownership_invariant(&bucket_stats);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains(&format!("bucket {stolen}")));
    }

    fn scheduler_long_epoch_ns(_scheduler: &Scheduler) -> u64 {
        1_000_000_000
    }
}
