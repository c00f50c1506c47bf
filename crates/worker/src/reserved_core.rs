//! `ReservedCore`: a demand-activated worker that drains one sw-queue at a
//! time. Modeled on `nfv_rcore.h`/`nfv_rcore.cc`'s `RunTask`: check the
//! remove-queue first, then the add-queue, then drain a burst from whichever
//! sw-queue is currently bound and hand it to the same downstream NF a
//! `NormalCore` would call.

use runtime_bus::{Command, Notification};

use crate::activity::{ActivityCell, CoreActivity};
use crate::nf::NfContext;
use crate::runtime::SharedRuntime;

const BATCH_SIZE: usize = 32;

/// A reserved core, idle until the Scheduler (via a `NormalCore`'s admission
/// pass) activates it with `Command::ToWork { queue_id }`.
pub struct ReservedCore {
    core_id: u16,
    runtime: SharedRuntime,
    command_rx: flume::Receiver<Command>,
    bound_queue: Option<u16>,
    draining: Option<u16>,
    activity: ActivityCell,
}

impl ReservedCore {
    /// Creates a new reserved core. `command_rx` must be this core's own
    /// receiver, taken once from the `RuntimeBus` at startup.
    pub fn new(core_id: u16, runtime: SharedRuntime, command_rx: flume::Receiver<Command>) -> Self {
        Self {
            core_id,
            runtime,
            command_rx,
            bound_queue: None,
            draining: None,
            activity: ActivityCell::new(CoreActivity::Paused),
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

    /// The sw-queue currently bound for draining, if any.
    pub fn bound_queue(&self) -> Option<u16> {
        self.bound_queue
    }

    /// Runs the core's cooperative loop until a `Stop` command is observed.
    pub fn run(&mut self) {
        self.activity.set(CoreActivity::Paused);
        loop {
            if !self.handle_commands() {
                break;
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

    /// Runs one drain pass against whichever queue is currently bound.
    /// Exposed for tests that drive the core deterministically.
    pub fn step(&mut self) {
        let Some(qid) = self.bound_queue else {
            return;
        };

        let batch = self.runtime.sw_queues.dequeue_burst(qid, BATCH_SIZE);
        if !batch.is_empty() {
            let mut batch = batch;
            let ctx = NfContext {
                now_ns: self.runtime.clock.now_ns(),
                core_id: self.core_id,
            };
            self.runtime.nf.process_batch(&ctx, &mut batch);
        }

        if self.draining == Some(qid) && self.runtime.sw_queues.finish_drain_if_empty(qid) {
            tracing::info!(core_id = self.core_id, queue_id = qid, "reserved core finished draining, returning to idle");
            self.bound_queue = None;
            self.draining = None;
            self.activity.set(CoreActivity::Paused);
            self.runtime.reserved_directory.release(self.core_id);
        }
    }

    /// Drains pending commands without blocking. Returns `false` if a `Stop`
    /// was observed.
    pub fn handle_commands(&mut self) -> bool {
        while let Ok(command) = self.command_rx.try_recv() {
            match command {
                Command::ToWork { queue_id } => {
                    self.bound_queue = Some(queue_id);
                    self.draining = None;
                    self.activity.set(CoreActivity::Running);
                    tracing::info!(core_id = self.core_id, queue_id, "reserved core bound to sw-queue");
                }
                Command::ToRest { queue_id } => {
                    if self.bound_queue == Some(queue_id) {
                        self.runtime.sw_queues.begin_drain(queue_id);
                        self.draining = Some(queue_id);
                        self.activity.set(CoreActivity::Draining);
                    }
                }
                Command::Stop => {
                    self.activity.set(CoreActivity::Draining);
                    return false;
                }
                other => {
                    tracing::warn!(core_id = self.core_id, %other, "reserved core received an unexpected command");
                }
            }
        }
        true
    }
}
