//! The downstream network-function callback: the one external capability
//! this crate hands batches to. Concrete NFs (NAT, LB, ACL, IDS, ...) are out
//! of scope; this module only defines the boundary and a couple of no-op
//! test doubles.

use std::sync::atomic::{AtomicU64, Ordering};

use packet::Packet;

/// Per-call context handed to a `NfCallback`: the calling core and the
/// current monotonic timestamp.
#[derive(Debug, Clone, Copy)]
pub struct NfContext {
    /// Current monotonic timestamp, nanoseconds since process start.
    pub now_ns: u64,
    /// The core id driving this call.
    pub core_id: u16,
}

/// The downstream network-function boundary. A batch is up to 32 packet
/// handles; the callback may mutate, drop (by shrinking `batch`), or pass
/// packets through - gate selection and multi-gate emission are a concrete
/// NF's concern, not this crate's.
pub trait NfCallback: Send + Sync {
    /// Processes one batch in place.
    fn process_batch(&self, ctx: &NfContext, batch: &mut Vec<Packet>);
}

/// A no-op NF: passes every packet through unchanged. Used where a test only
/// cares about scheduling behavior, not NF semantics.
#[derive(Debug, Default)]
pub struct NoopNf;

impl NfCallback for NoopNf {
    fn process_batch(&self, _ctx: &NfContext, _batch: &mut Vec<Packet>) {}
}

/// An NF that counts every packet it sees and then drops the batch, for
/// tests that assert on throughput without needing a real packet sink.
#[derive(Debug, Default)]
pub struct CountingNf {
    processed: AtomicU64,
}

impl CountingNf {
    /// Creates a fresh counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Total packets processed so far.
    pub fn processed_count(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }
}

impl NfCallback for CountingNf {
    fn process_batch(&self, _ctx: &NfContext, batch: &mut Vec<Packet>) {
        let _ = self.processed.fetch_add(batch.len() as u64, Ordering::Relaxed);
        batch.clear();
    }
}
