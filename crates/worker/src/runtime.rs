//! `SharedRuntime`: the per-process handle bundle every core thread is
//! handed at startup, replacing global singletons and static arrays indexed
//! by core id. Core code receives its handle at thread start and never
//! touches sibling state except through well-typed channels.

use std::sync::Arc;

use bucket::BucketStats;
use nfv_config::WorkerConfig;
use nic::NicAdapter;
use runtime_bus::{ReservedCoreDirectory, RuntimeBus};
use swqueue::SwQueuePool;

use crate::clock::TimeSource;
use crate::nf::NfCallback;

/// Everything a `NormalCore` or `ReservedCore` needs beyond its own identity
/// and private state, cloned cheaply (every field is an `Arc`) into each
/// core's thread.
#[derive(Clone)]
pub struct SharedRuntime {
    /// Validated worker configuration.
    pub config: Arc<WorkerConfig>,
    /// The NIC boundary.
    pub nic: Arc<dyn NicAdapter>,
    /// The global per-bucket counters table.
    pub bucket_stats: Arc<BucketStats>,
    /// The fixed pool of sw-queues.
    pub sw_queues: Arc<SwQueuePool>,
    /// The control-plane command/notification/migration bus.
    pub bus: Arc<RuntimeBus>,
    /// The registry of currently idle reserved cores.
    pub reserved_directory: Arc<ReservedCoreDirectory>,
    /// The downstream NF callback.
    pub nf: Arc<dyn NfCallback>,
    /// The time source driving epoch boundaries.
    pub clock: Arc<dyn TimeSource>,
}
