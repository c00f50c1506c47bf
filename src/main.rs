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

//! `nfvd`: the per-server NFV dataplane worker binary. Wires a `WorkerConfig`
//! into a fixed set of `NormalCore`/`ReservedCore` threads (one OS thread per
//! core, pinned where possible) plus a `Scheduler` driving the long-term
//! epoch from the main thread.
//!
//! No real NIC driver is available in this environment, so the `NicAdapter`
//! wired in here is `nic::FakeNic`, an in-memory double. A deployment with a
//! DPDK/AF_XDP-backed adapter would implement `nic::NicAdapter` and swap it
//! in at the single call site below.

mod cli;

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bucket::BucketStats;
use nfv_config::WorkerConfig;
use nic::{FakeNic, NicAdapter};
use runtime_bus::{Command, Notification, ReservedCoreDirectory, RuntimeBus};
use scheduler::Scheduler;
use swqueue::SwQueuePool;
use worker::{ActivityCell, NoopNf, NormalCore, ReservedCore, SharedRuntime, SystemClock};

/// Exit code: ran and shut down cleanly.
const EXIT_OK: u8 = 0;
/// Exit code: configuration missing, malformed, or failed validation.
const EXIT_CONFIG_ERROR: u8 = 2;
/// Exit code: NIC initialization failed.
const EXIT_NIC_ERROR: u8 = 3;
/// Exit code: an internal invariant was violated (bucket double-ownership).
const EXIT_INVARIANT_VIOLATION: u8 = 4;

/// How often the control loop polls for long-epoch work and notifications.
/// Short relative to any realistic `long_epoch_ns`/`short_epoch_ns` so the
/// relevant `EpochTicker`s are the ones deciding when real work happens.
const CONTROL_LOOP_POLL: Duration = Duration::from_millis(1);

fn main() -> ExitCode {
    init_tracing();
    match run() {
        Ok(()) => ExitCode::from(EXIT_OK),
        Err(code) => ExitCode::from(code),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn run() -> Result<(), u8> {
    let args = cli::Args::parse(std::env::args().skip(1)).map_err(|message| {
        eprintln!("{message}");
        cli::print_usage();
        EXIT_CONFIG_ERROR
    })?;

    let mut config = WorkerConfig::load(&args.config_path).map_err(|error| {
        tracing::error!(%error, "failed to load configuration");
        EXIT_CONFIG_ERROR
    })?;
    args.apply_overrides(&mut config);
    let config = Arc::new(config);

    let topology = Topology::new(&config);
    tracing::info!(
        ncore = config.ncore,
        spare = config.spare_normal_cores,
        rcore = config.rcore,
        "starting worker"
    );

    let bucket_stats = Arc::new(BucketStats::new(config.rss_size));
    let sw_queues = Arc::new(SwQueuePool::new(config.sw_queue_pool_size, config.ring_capacity));
    let clock = Arc::new(SystemClock::new());
    let nf = Arc::new(NoopNf);
    let reserved_directory = Arc::new(ReservedCoreDirectory::new(topology.reserved_ids.iter().copied()));

    let nic: Arc<dyn NicAdapter> = Arc::new(FakeNic::new(topology.nic_qid_count()));
    // FakeNic::new never fails; a real adapter's fallible init belongs here,
    // mapped to EXIT_NIC_ERROR, e.g.:
    //   let nic: Arc<dyn NicAdapter> = Arc::new(RealNic::open(&config).map_err(|error| {
    //       tracing::error!(%error, "NIC initialization failed");
    //       EXIT_NIC_ERROR
    //   })?);

    let mut bus = RuntimeBus::new(topology.total_core_slots());
    let mut command_rxs = BTreeMap::new();
    for &core_id in topology.all_core_ids() {
        let rx = bus
            .take_command_receiver(core_id)
            .expect("every core id in the topology has its own command channel");
        let _ = command_rxs.insert(core_id, rx);
    }
    let mut migration_rxs = BTreeMap::new();
    for &core_id in topology.normal_and_spare_ids() {
        let rx = bus
            .take_migration_receiver(core_id)
            .expect("every normal/spare core id has its own migration channel");
        let _ = migration_rxs.insert(core_id, rx);
    }
    let bus = Arc::new(bus);

    let runtime_template = SharedRuntime {
        config: Arc::clone(&config),
        nic: Arc::clone(&nic),
        bucket_stats: Arc::clone(&bucket_stats),
        sw_queues: Arc::clone(&sw_queues),
        bus: Arc::clone(&bus),
        reserved_directory: Arc::clone(&reserved_directory),
        nf,
        clock: Arc::clone(&clock),
    };

    let cpu_ids = core_affinity::get_core_ids().unwrap_or_default();
    let mut threads = Vec::with_capacity(topology.total_core_slots());
    let mut activity_map: BTreeMap<u16, ActivityCell> = BTreeMap::new();

    for &core_id in topology.normal_and_spare_ids() {
        let command_rx = command_rxs.remove(&core_id).expect("normal/spare command receiver taken above");
        let migration_rx = migration_rxs.remove(&core_id).expect("normal/spare migration receiver taken above");
        let runtime = runtime_template.clone();
        let mut core = NormalCore::new(core_id, core_id, runtime, command_rx, migration_rx);
        let _ = activity_map.insert(core_id, core.activity());

        // Spare core slots start parked; the Scheduler promotes them with
        // Command::Resume the first time it needs to activate a new core.
        if topology.spare_ids.contains(&core_id) {
            bus.send_command(core_id, Command::Pause);
        }

        let pin = pick_affinity(&cpu_ids, core_id);
        threads.push(
            thread::Builder::new()
                .name(format!("nfv-normal-{core_id}"))
                .spawn(move || {
                    if let Some(pin) = pin {
                        let _ = core_affinity::set_for_current(pin);
                    }
                    core.run();
                })
                .expect("failed to spawn normal core thread"),
        );
    }

    for &core_id in topology.reserved_ids.iter() {
        let command_rx = command_rxs.remove(&core_id).expect("reserved command receiver taken above");
        let runtime = runtime_template.clone();
        let mut core = ReservedCore::new(core_id, runtime, command_rx);
        let pin = pick_affinity(&cpu_ids, core_id);
        threads.push(
            thread::Builder::new()
                .name(format!("nfv-reserved-{core_id}"))
                .spawn(move || {
                    if let Some(pin) = pin {
                        let _ = core_affinity::set_for_current(pin);
                    }
                    core.run();
                })
                .expect("failed to spawn reserved core thread"),
        );
    }

    let mut scheduler = Scheduler::new(
        Arc::clone(&config),
        Arc::clone(&nic),
        Arc::clone(&bucket_stats),
        Arc::clone(&bus),
        Arc::clone(&clock),
        topology.normal_ids.iter().copied(),
        topology.spare_ids.iter().copied(),
        activity_map,
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            tracing::info!("received shutdown signal");
            shutdown.store(true, Ordering::SeqCst);
        })
        .expect("failed to install Ctrl+C handler");
    }

    let mut exit_code = EXIT_OK;
    while !shutdown.load(Ordering::SeqCst) {
        let _ = scheduler.run_long_epoch();

        for notification in bus.drain_notifications() {
            if let Notification::RebalanceNow { core_id } = notification {
                let _ = scheduler.rebalance_now(core_id);
            }
        }

        if let Err(diagnostic) = scheduler.assert_ownership_invariant(&bucket_stats) {
            tracing::error!(%diagnostic, "fatal: bucket ownership invariant violated, shutting down");
            exit_code = EXIT_INVARIANT_VIOLATION;
            break;
        }

        thread::sleep(CONTROL_LOOP_POLL);
    }

    tracing::info!("stopping all cores");
    for &core_id in topology.all_core_ids() {
        bus.send_command(core_id, Command::Stop);
    }
    for handle in threads {
        if handle.join().is_err() {
            tracing::error!("a core thread panicked during shutdown");
            exit_code = exit_code.max(EXIT_INVARIANT_VIOLATION);
        }
    }

    if exit_code == EXIT_OK {
        Ok(())
    } else {
        Err(exit_code)
    }
}

/// Pins to the `core_id`-th available OS core id, if `core_affinity` managed
/// to enumerate any; falls back to no pinning (still correct, just without
/// the cache-locality benefit) when the platform doesn't support it.
fn pick_affinity(cpu_ids: &[core_affinity::CoreId], core_id: u16) -> Option<core_affinity::CoreId> {
    if cpu_ids.is_empty() {
        return None;
    }
    Some(cpu_ids[usize::from(core_id) % cpu_ids.len()])
}

/// The fixed core-id layout for one worker process: `0..ncore` Normal, then
/// `spare_normal_cores` additional Normal-capable slots parked `Unused` until
/// the Scheduler needs them, then `rcore` Reserved cores. Reserved cores have
/// no NIC queue of their own; they only ever drain sw-queues.
struct Topology {
    normal_ids: Vec<u16>,
    spare_ids: Vec<u16>,
    reserved_ids: Vec<u16>,
    all_ids: Vec<u16>,
    normal_and_spare: Vec<u16>,
}

impl Topology {
    fn new(config: &WorkerConfig) -> Self {
        let ncore = config.ncore as u16;
        let spare = config.spare_normal_cores as u16;
        let rcore = config.rcore as u16;

        let normal_ids: Vec<u16> = (0..ncore).collect();
        let spare_ids: Vec<u16> = (ncore..ncore + spare).collect();
        let reserved_ids: Vec<u16> = (ncore + spare..ncore + spare + rcore).collect();

        let mut normal_and_spare = normal_ids.clone();
        normal_and_spare.extend_from_slice(&spare_ids);

        let mut all_ids = normal_and_spare.clone();
        all_ids.extend_from_slice(&reserved_ids);

        Self {
            normal_ids,
            spare_ids,
            reserved_ids,
            all_ids,
            normal_and_spare,
        }
    }

    fn total_core_slots(&self) -> usize {
        self.all_ids.len()
    }

    fn nic_qid_count(&self) -> usize {
        self.normal_and_spare.len()
    }

    fn all_core_ids(&self) -> &[u16] {
        &self.all_ids
    }

    fn normal_and_spare_ids(&self) -> &[u16] {
        &self.normal_and_spare
    }
}
