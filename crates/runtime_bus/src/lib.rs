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

//! The `RuntimeBus`: lock-free control messages connecting the `Scheduler`
//! to the cores, replacing the original dataplane's ad-hoc atomic flags
//! (`rte_atomic16_t disabled_`, `mark_to_disable_`, ...) with a single
//! enum-valued command channel per core plus a shared notification channel
//! back to the Scheduler.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use flow::{FlowKey, FlowState};

/// A command sent from the `Scheduler` to exactly one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Command {
    /// Activate a `ReservedCore` to drain sw-queue `queue_id`.
    ToWork {
        /// The sw-queue to drain.
        queue_id: u16,
    },
    /// Tell a `ReservedCore` to finish in-flight work on `queue_id` and
    /// return to idle.
    ToRest {
        /// The sw-queue to stop draining.
        queue_id: u16,
    },
    /// A bucket this core owns is being migrated to `new_owner`; the core
    /// should begin the drain protocol for it.
    BeginBucketMove {
        /// The bucket being moved.
        bucket: u16,
        /// The new owning core.
        new_owner: u16,
    },
    /// Park a `NormalCore`'s hot loop: the Scheduler has demoted this core's
    /// role to `Unused`. The core keeps polling its command channel but
    /// stops running `Recv/Admit/Process/EpochClose` passes.
    Pause,
    /// Resume a parked `NormalCore`: the Scheduler has promoted this core's
    /// role back to `Normal`.
    Resume,
    /// Graceful shutdown: finish the current batch, then exit.
    Stop,
}

/// A notification sent from a core back to the `Scheduler`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Notification {
    /// The core observed two or more consecutive short epochs with a
    /// large local-ring backlog; request an on-demand rebalance.
    RebalanceNow {
        /// The requesting core.
        core_id: u16,
    },
    /// The core observed a NIC receive error (transient, logged, not
    /// propagated further) but the Scheduler should know about core
    /// liveness.
    NicError {
        /// The reporting core.
        core_id: u16,
    },
    /// The core finished draining a bucket move and handed its flows to the
    /// new owner.
    BucketMoveComplete {
        /// The bucket that finished moving.
        bucket: u16,
    },
    /// The core has observed its `Stop` command and drained; safe to join.
    Drained {
        /// The core that drained.
        core_id: u16,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::ToWork { queue_id } => write!(f, "ToWork({queue_id})"),
            Command::ToRest { queue_id } => write!(f, "ToRest({queue_id})"),
            Command::BeginBucketMove { bucket, new_owner } => {
                write!(f, "BeginBucketMove({bucket} -> {new_owner})")
            }
            Command::Pause => write!(f, "Pause"),
            Command::Resume => write!(f, "Resume"),
            Command::Stop => write!(f, "Stop"),
        }
    }
}

/// A batch of flow states handed from the old owner of a bucket to its new
/// owner, once the draining grace period has elapsed. This is the
/// single-producer/single-consumer transfer ring of the bucket-move commit
/// protocol, carried as a bounded MPSC channel (single producer in practice:
/// only the bucket's old owner ever sends into a given transfer).
#[derive(Debug)]
#[non_exhaustive]
pub struct MigrationBatch {
    /// The bucket that moved.
    pub bucket: u16,
    /// The flows detached from the old owner's `FlowTable`, to be inserted
    /// into the new owner's.
    pub flows: Vec<(FlowKey, FlowState)>,
}

/// A per-core command endpoint pair, plus the shared notification channel
/// back to the Scheduler.
pub struct RuntimeBus {
    command_senders: Vec<flume::Sender<Command>>,
    command_receivers: Vec<Option<flume::Receiver<Command>>>,
    notification_sender: flume::Sender<Notification>,
    notification_receiver: flume::Receiver<Notification>,
    migration_senders: Vec<flume::Sender<MigrationBatch>>,
    migration_receivers: Vec<Option<flume::Receiver<MigrationBatch>>>,
}

impl RuntimeBus {
    /// Creates a bus with one command channel per core slot (`core_count`
    /// total) and a single shared notification channel.
    pub fn new(core_count: usize) -> Self {
        let mut command_senders = Vec::with_capacity(core_count);
        let mut command_receivers = Vec::with_capacity(core_count);
        let mut migration_senders = Vec::with_capacity(core_count);
        let mut migration_receivers = Vec::with_capacity(core_count);
        for _ in 0..core_count {
            let (tx, rx) = flume::unbounded();
            command_senders.push(tx);
            command_receivers.push(Some(rx));

            let (mtx, mrx) = flume::unbounded();
            migration_senders.push(mtx);
            migration_receivers.push(Some(mrx));
        }
        let (notification_sender, notification_receiver) = flume::unbounded();
        Self {
            command_senders,
            command_receivers,
            notification_sender,
            notification_receiver,
            migration_senders,
            migration_receivers,
        }
    }

    /// Sends a command to a specific core. Never blocks.
    pub fn send_command(&self, core_id: u16, command: Command) {
        if let Some(sender) = self.command_senders.get(usize::from(core_id)) {
            if let Err(error) = sender.send(command) {
                tracing::warn!(%core_id, %error, "failed to deliver runtime bus command, core channel closed");
            }
        } else {
            tracing::error!(%core_id, "runtime bus command targets an unknown core id");
        }
    }

    /// Takes ownership of the command receiver for `core_id`. Each core
    /// calls this exactly once at startup; the command channel is then
    /// theirs alone to poll (single-consumer per core).
    pub fn take_command_receiver(&mut self, core_id: u16) -> Option<flume::Receiver<Command>> {
        self.command_receivers.get_mut(usize::from(core_id)).and_then(Option::take)
    }

    /// A cloneable sender any core can use to notify the Scheduler.
    pub fn notification_sender(&self) -> flume::Sender<Notification> {
        self.notification_sender.clone()
    }

    /// Non-blocking drain of all pending notifications; the Scheduler calls
    /// this at the start of each long-epoch pass and opportunistically
    /// between passes to react to `RebalanceNow`.
    pub fn drain_notifications(&self) -> Vec<Notification> {
        self.notification_receiver.drain().collect()
    }

    /// Sends a drained bucket's flows to its new owner. Never blocks.
    pub fn send_migration(&self, new_owner: u16, batch: MigrationBatch) {
        if let Some(sender) = self.migration_senders.get(usize::from(new_owner)) {
            if let Err(error) = sender.send(batch) {
                tracing::warn!(%new_owner, %error, "failed to deliver bucket migration, core channel closed");
            }
        } else {
            tracing::error!(%new_owner, "bucket migration targets an unknown core id");
        }
    }

    /// Takes ownership of the migration receiver for `core_id`. Each core
    /// calls this exactly once at startup, same single-use contract as
    /// `take_command_receiver`.
    pub fn take_migration_receiver(&mut self, core_id: u16) -> Option<flume::Receiver<MigrationBatch>> {
        self.migration_receivers.get_mut(usize::from(core_id)).and_then(Option::take)
    }
}

/// A registry of `ReservedCore` ids currently idle, used by a `NormalCore`'s
/// short-epoch admission pass to pick a reserved core to activate via
/// `Command::ToWork` without routing that choice through the Scheduler.
pub struct ReservedCoreDirectory {
    idle: Mutex<VecDeque<u16>>,
}

impl ReservedCoreDirectory {
    /// Creates a directory with every given reserved core id initially idle.
    pub fn new(reserved_core_ids: impl IntoIterator<Item = u16>) -> Self {
        Self {
            idle: Mutex::new(reserved_core_ids.into_iter().collect()),
        }
    }

    /// Pops one idle reserved core id, if any are available.
    pub fn acquire_idle(&self) -> Option<u16> {
        self.idle.lock().expect("reserved core directory lock poisoned").pop_front()
    }

    /// Returns a reserved core id to the idle pool, once it has finished
    /// draining its last assigned queue.
    pub fn release(&self, core_id: u16) {
        self.idle.lock().expect("reserved core directory lock poisoned").push_back(core_id);
    }

    /// Number of reserved cores currently idle.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("reserved core directory lock poisoned").len()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_is_delivered_to_the_right_core() {
        let mut bus = RuntimeBus::new(2);
        let rx0 = bus.take_command_receiver(0).unwrap();
        let rx1 = bus.take_command_receiver(1).unwrap();

        bus.send_command(1, Command::ToWork { queue_id: 3 });
        assert!(rx0.try_recv().is_err());
        assert_eq!(rx1.try_recv().unwrap(), Command::ToWork { queue_id: 3 });
    }

    #[test]
    fn notifications_are_shared_and_drained() {
        let bus = RuntimeBus::new(1);
        let sender = bus.notification_sender();
        sender.send(Notification::RebalanceNow { core_id: 0 }).unwrap();
        sender.send(Notification::NicError { core_id: 0 }).unwrap();

        let drained = bus.drain_notifications();
        assert_eq!(drained.len(), 2);
        assert!(bus.drain_notifications().is_empty());
    }

    #[test]
    fn take_command_receiver_is_single_use() {
        let mut bus = RuntimeBus::new(1);
        assert!(bus.take_command_receiver(0).is_some());
        assert!(bus.take_command_receiver(0).is_none());
    }

    #[test]
    fn migration_batch_is_delivered_to_the_new_owner() {
        use flow::{FlowKey, FlowState, L4Protocol};

        let mut bus = RuntimeBus::new(2);
        let rx1 = bus.take_migration_receiver(1).unwrap();

        let key = FlowKey::new([10, 0, 0, 1], [10, 0, 0, 2], L4Protocol::Tcp, 1000, 80);
        bus.send_migration(
            1,
            MigrationBatch {
                bucket: 7,
                flows: vec![(key, FlowState::new(key, 7))],
            },
        );

        let received = rx1.try_recv().unwrap();
        assert_eq!(received.bucket, 7);
        assert_eq!(received.flows.len(), 1);
    }
}
