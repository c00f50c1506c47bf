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

//! `NicAdapter`: the NIC boundary this crate drives - burst receive/send and
//! RSS indirection-table updates - plus an in-memory `FakeNic` test double
//! used by the integration tests (no real NIC or elevated privileges are
//! available in this workspace).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use packet::Packet;

/// Errors a `NicAdapter` implementation can surface. NIC errors are
/// treated as transient: a failed `recv`/`send` is ignored by the caller,
/// and a failed `update_rss` is logged and retried next long epoch.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The NIC could not be initialized (fatal at startup, exit code 3).
    #[error("NIC initialization failed: {reason}")]
    InitFailed {
        /// Human-readable reason.
        reason: String,
    },
    /// A transient, retriable failure updating the RSS indirection table.
    #[error("update_rss failed (will retry next long epoch): {reason}")]
    RssUpdateFailed {
        /// Human-readable reason.
        reason: String,
    },
}

/// The NIC boundary: non-blocking burst receive/send and RSS indirection
/// table updates.
pub trait NicAdapter: Send + Sync {
    /// Non-blocking burst receive of up to `max` packets from queue `qid`.
    fn recv(&self, qid: u16, max: usize) -> Vec<Packet>;

    /// Non-blocking burst send; returns how many of `batch` were accepted.
    /// Packets beyond the accepted count are dropped by the caller as
    /// `NicTxDrop`.
    fn send(&self, qid: u16, batch: Vec<Packet>) -> usize;

    /// Updates the 512-entry RSS indirection table. May block up to several
    /// milliseconds in a real NIC; the Scheduler never calls this more than
    /// once per configured minimum interval.
    fn update_rss(&self, indirection_table: &[u16]) -> Result<(), Error>;

    /// Optional NIC-side clock, used only to fit a piecewise-linear
    /// NIC-to-CPU clock conversion for timestamped packets; not on the data
    /// path.
    fn nic_clock_ns(&self) -> Option<u64> {
        None
    }
}

/// An in-memory `NicAdapter` for tests: one inbound FIFO queue per `qid`,
/// packets can be injected with `inject`, sent packets are captured for
/// assertions, and every `update_rss` call is recorded with its table.
#[derive(Default)]
pub struct FakeNic {
    rx_queues: Vec<Mutex<VecDeque<Packet>>>,
    tx_log: Mutex<Vec<(u16, Packet)>>,
    rss_update_calls: AtomicUsize,
    last_rss_table: Mutex<Option<Vec<u16>>>,
}

impl FakeNic {
    /// Creates a fake NIC with `qid_count` independent receive queues.
    pub fn new(qid_count: usize) -> Self {
        let mut rx_queues = Vec::with_capacity(qid_count);
        rx_queues.resize_with(qid_count, || Mutex::new(VecDeque::new()));
        Self {
            rx_queues,
            tx_log: Mutex::new(Vec::new()),
            rss_update_calls: AtomicUsize::new(0),
            last_rss_table: Mutex::new(None),
        }
    }

    /// Injects packets into queue `qid`, to be returned by subsequent
    /// `recv` calls.
    pub fn inject(&self, qid: u16, packets: impl IntoIterator<Item = Packet>) {
        let mut queue = self.rx_queues[usize::from(qid)].lock().expect("rx queue lock poisoned");
        queue.extend(packets);
    }

    /// Number of packets still pending in queue `qid`.
    pub fn pending(&self, qid: u16) -> usize {
        self.rx_queues[usize::from(qid)].lock().expect("rx queue lock poisoned").len()
    }

    /// Number of times `update_rss` has been called.
    pub fn rss_update_call_count(&self) -> usize {
        self.rss_update_calls.load(Ordering::Acquire)
    }

    /// The most recently applied RSS indirection table, if any.
    pub fn last_rss_table(&self) -> Option<Vec<u16>> {
        self.last_rss_table.lock().expect("rss table lock poisoned").clone()
    }

    /// Number of packets sent so far, across all queues.
    pub fn sent_count(&self) -> usize {
        self.tx_log.lock().expect("tx log lock poisoned").len()
    }
}

impl NicAdapter for FakeNic {
    fn recv(&self, qid: u16, max: usize) -> Vec<Packet> {
        let Some(queue_mutex) = self.rx_queues.get(usize::from(qid)) else {
            return Vec::new();
        };
        let mut queue = queue_mutex.lock().expect("rx queue lock poisoned");
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    fn send(&self, qid: u16, batch: Vec<Packet>) -> usize {
        let mut log = self.tx_log.lock().expect("tx log lock poisoned");
        let accepted = batch.len();
        log.extend(batch.into_iter().map(|packet| (qid, packet)));
        accepted
    }

    fn update_rss(&self, indirection_table: &[u16]) -> Result<(), Error> {
        let _ = self.rss_update_calls.fetch_add(1, Ordering::AcqRel);
        *self.last_rss_table.lock().expect("rss table lock poisoned") = Some(indirection_table.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow::L4Protocol;
    use packet::build_test_packet;

    #[test]
    fn inject_then_recv_returns_injected_packets() {
        let nic = FakeNic::new(2);
        nic.inject(
            0,
            vec![build_test_packet([1, 1, 1, 1], [2, 2, 2, 2], L4Protocol::Tcp, 1, 2, 0)],
        );
        assert_eq!(nic.pending(0), 1);
        let batch = nic.recv(0, 8);
        assert_eq!(batch.len(), 1);
        assert_eq!(nic.pending(0), 0);
    }

    #[test]
    fn update_rss_is_recorded() {
        let nic = FakeNic::new(1);
        let table = vec![0u16; 512];
        nic.update_rss(&table).unwrap();
        assert_eq!(nic.rss_update_call_count(), 1);
        assert_eq!(nic.last_rss_table().unwrap().len(), 512);
    }
}
