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

//! `SwQueuePool`: a fixed set of single-producer/single-consumer packet
//! rings shared between `NormalCore`s (producers) and `ReservedCore`s
//! (consumers).
//!
//! The pool owns the ring storage (`ringbuf::HeapRb`); cores only ever hold a
//! `u16` queue id, exactly as the spec's design notes ask ("the SwQueuePool
//! owns the ring storage; cores hold only a queue id and access via the
//! pool"). State-machine transitions (`Free -> Claimed -> Active -> Draining
//! -> Free`) are brief, lock-guarded operations that happen only at
//! claim/release/bind time, never once per packet.

use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

use packet::Packet;
use ringbuf::{HeapConsumer, HeapProducer, HeapRb};

/// Sentinel for "no core bound".
pub const NO_CORE: u16 = 0xFFFF;

/// Idle-epoch threshold after which an Active queue transitions to
/// Draining (default: 100).
pub const DEFAULT_IDLE_EPOCHS_THRESHOLD: i64 = 100;

/// Lifecycle phase of one sw-queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No producer or consumer bound.
    Free,
    /// A producer (NormalCore) is bound, no consumer yet.
    Claimed,
    /// Both a producer and a consumer (ReservedCore) are bound.
    Active,
    /// The producer has released the queue; the consumer is finishing
    /// whatever remains in the ring.
    Draining,
}

struct Slot {
    producer: Mutex<Option<HeapProducer<Packet>>>,
    consumer: Mutex<Option<HeapConsumer<Packet>>>,
    phase: Mutex<Phase>,
    producer_core: AtomicU16,
    consumer_core: AtomicU16,
    idle_epochs: AtomicI64,
    assigned_packets: AtomicU64,
    processed_packets: AtomicU64,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        let (producer, consumer) = HeapRb::<Packet>::new(capacity).split();
        Self {
            producer: Mutex::new(Some(producer)),
            consumer: Mutex::new(Some(consumer)),
            phase: Mutex::new(Phase::Free),
            producer_core: AtomicU16::new(NO_CORE),
            consumer_core: AtomicU16::new(NO_CORE),
            idle_epochs: AtomicI64::new(-1),
            assigned_packets: AtomicU64::new(0),
            processed_packets: AtomicU64::new(0),
        }
    }
}

/// A fixed-size pool of SPSC packet rings.
pub struct SwQueuePool {
    slots: Vec<Slot>,
    ring_capacity: usize,
}

impl SwQueuePool {
    /// Creates a pool of `pool_size` queues, each ring holding up to
    /// `ring_capacity` packets (a power of two, typically 2048-32768).
    pub fn new(pool_size: usize, ring_capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(pool_size);
        slots.resize_with(pool_size, || Slot::new(ring_capacity));
        Self { slots, ring_capacity }
    }

    /// Number of queues in the pool.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no queues (a misconfiguration).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The configured ring capacity.
    pub fn ring_capacity(&self) -> usize {
        self.ring_capacity
    }

    /// Current lifecycle phase of a queue.
    pub fn phase(&self, queue_id: u16) -> Phase {
        *self.slots[usize::from(queue_id)].phase.lock().expect("phase lock poisoned")
    }

    /// Claims the first `Free` queue for `core_id`, transitioning it to
    /// `Claimed`. Returns `None` if every queue is in use.
    pub fn claim(&self, core_id: u16) -> Option<u16> {
        for (id, slot) in self.slots.iter().enumerate() {
            let mut phase = slot.phase.lock().expect("phase lock poisoned");
            if *phase == Phase::Free {
                *phase = Phase::Claimed;
                slot.producer_core.store(core_id, Ordering::Release);
                slot.idle_epochs.store(-1, Ordering::Release);
                slot.assigned_packets.store(0, Ordering::Release);
                slot.processed_packets.store(0, Ordering::Release);
                return Some(id as u16);
            }
        }
        None
    }

    /// Releases a queue the calling `NormalCore` no longer needs. Valid from
    /// `Claimed` or `Draining`; transitions straight back to `Free`.
    pub fn release(&self, queue_id: u16) {
        let slot = &self.slots[usize::from(queue_id)];
        let mut phase = slot.phase.lock().expect("phase lock poisoned");
        *phase = Phase::Free;
        slot.producer_core.store(NO_CORE, Ordering::Release);
        slot.consumer_core.store(NO_CORE, Ordering::Release);
        slot.idle_epochs.store(-1, Ordering::Release);
        tracing::trace!(%queue_id, "sw-queue released back to the pool");
    }

    /// Binds a `ReservedCore` as the consumer of a `Claimed` queue,
    /// transitioning it to `Active`. This is the `ToWork(queue_id)` event.
    pub fn bind_consumer(&self, queue_id: u16, core_id: u16) {
        let slot = &self.slots[usize::from(queue_id)];
        let mut phase = slot.phase.lock().expect("phase lock poisoned");
        *phase = Phase::Active;
        slot.consumer_core.store(core_id, Ordering::Release);
        slot.idle_epochs.store(0, Ordering::Release);
    }

    /// Marks an `Active` queue as `Draining`: the producer has let go, the
    /// consumer finishes whatever remains. This is the `ToRest(queue_id)`
    /// event, from the producer side.
    pub fn begin_drain(&self, queue_id: u16) {
        let slot = &self.slots[usize::from(queue_id)];
        let mut phase = slot.phase.lock().expect("phase lock poisoned");
        if *phase == Phase::Active {
            *phase = Phase::Draining;
        }
    }

    /// Called by the consumer once it observes `Draining` and the ring is
    /// empty: completes `Draining -> Free`.
    pub fn finish_drain_if_empty(&self, queue_id: u16) -> bool {
        let slot = &self.slots[usize::from(queue_id)];
        let mut phase = slot.phase.lock().expect("phase lock poisoned");
        if *phase != Phase::Draining {
            return false;
        }
        let empty = slot
            .consumer
            .lock()
            .expect("consumer lock poisoned")
            .as_ref()
            .map(|c| c.is_empty())
            .unwrap_or(true);
        if empty {
            *phase = Phase::Free;
            slot.producer_core.store(NO_CORE, Ordering::Release);
            slot.consumer_core.store(NO_CORE, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Enqueues a burst of packets into `queue_id` from its bound producer.
    /// Returns the number actually enqueued; the remainder overflowed and
    /// must be freed by the caller, accounted as `LocalQueueOverflow`.
    pub fn enqueue_burst(&self, queue_id: u16, packets: impl IntoIterator<Item = Packet>) -> usize {
        let slot = &self.slots[usize::from(queue_id)];
        let mut guard = slot.producer.lock().expect("producer lock poisoned");
        let producer = guard.as_mut().expect("enqueue on a queue with no bound producer");
        let mut enqueued = 0usize;
        for packet in packets {
            if producer.push(packet).is_err() {
                break;
            }
            enqueued += 1;
        }
        if enqueued > 0 {
            slot.assigned_packets.fetch_add(enqueued as u64, Ordering::Relaxed);
            slot.idle_epochs.store(0, Ordering::Release);
        }
        enqueued
    }

    /// Dequeues up to `max` packets from `queue_id`'s bound consumer.
    pub fn dequeue_burst(&self, queue_id: u16, max: usize) -> Vec<Packet> {
        let slot = &self.slots[usize::from(queue_id)];
        let mut guard = slot.consumer.lock().expect("consumer lock poisoned");
        let consumer = guard.as_mut().expect("dequeue on a queue with no bound consumer");
        let mut batch = Vec::with_capacity(max);
        for _ in 0..max {
            match consumer.pop() {
                Some(packet) => batch.push(packet),
                None => break,
            }
        }
        if !batch.is_empty() {
            slot.processed_packets.fetch_add(batch.len() as u64, Ordering::Relaxed);
        }
        batch
    }

    /// Number of packets assigned to a queue in the current admission round
    /// (used by the first-fit admission algorithm as `assigned`).
    pub fn assigned_packets(&self, queue_id: u16) -> u64 {
        self.slots[usize::from(queue_id)].assigned_packets.load(Ordering::Acquire)
    }

    /// Current number of packets actually sitting in the ring
    /// (`llring_count`), the live figure the short-epoch admission algorithm
    /// packs against rather than the lifetime `assigned_packets` counter.
    pub fn ring_len(&self, queue_id: u16) -> usize {
        self.slots[usize::from(queue_id)]
            .producer
            .lock()
            .expect("producer lock poisoned")
            .as_ref()
            .map(|p| p.len())
            .unwrap_or(0)
    }

    /// Resets the per-epoch `assigned_packets` counter, called once at the
    /// start of each short-epoch admission pass for queues this core owns.
    pub fn reset_assigned(&self, queue_id: u16) {
        self.slots[usize::from(queue_id)].assigned_packets.store(0, Ordering::Release);
    }

    /// Ages a queue's idle-epoch counter by one short epoch if nothing was
    /// enqueued (the producer calls this once per epoch close for every
    /// queue it owns); returns the updated value.
    pub fn age_idle_epoch(&self, queue_id: u16) -> i64 {
        self.slots[usize::from(queue_id)].idle_epochs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Current idle-epoch count (`-1` means inactive/never activated).
    pub fn idle_epochs(&self, queue_id: u16) -> i64 {
        self.slots[usize::from(queue_id)].idle_epochs.load(Ordering::Acquire)
    }

    /// The producer core currently bound to a queue, if any.
    pub fn producer_core(&self, queue_id: u16) -> Option<u16> {
        match self.slots[usize::from(queue_id)].producer_core.load(Ordering::Acquire) {
            NO_CORE => None,
            core => Some(core),
        }
    }

    /// The consumer core currently bound to a queue, if any.
    pub fn consumer_core(&self, queue_id: u16) -> Option<u16> {
        match self.slots[usize::from(queue_id)].consumer_core.load(Ordering::Acquire) {
            NO_CORE => None,
            core => Some(core),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use packet::build_test_packet;
    use flow::L4Protocol;

    #[test]
    fn claim_bind_enqueue_dequeue_release_lifecycle() {
        let pool = SwQueuePool::new(4, 64);
        let id = pool.claim(1).expect("a free queue");
        assert_eq!(pool.phase(id), Phase::Claimed);

        pool.bind_consumer(id, 9);
        assert_eq!(pool.phase(id), Phase::Active);

        let packets = vec![build_test_packet([1, 1, 1, 1], [2, 2, 2, 2], L4Protocol::Udp, 1, 2, 0)];
        let enq = pool.enqueue_burst(id, packets);
        assert_eq!(enq, 1);
        assert_eq!(pool.assigned_packets(id), 1);

        let batch = pool.dequeue_burst(id, 8);
        assert_eq!(batch.len(), 1);

        pool.begin_drain(id);
        assert!(pool.finish_drain_if_empty(id));
        assert_eq!(pool.phase(id), Phase::Free);
    }

    #[test]
    fn claim_exhausts_pool() {
        let pool = SwQueuePool::new(1, 16);
        assert!(pool.claim(1).is_some());
        assert!(pool.claim(2).is_none());
    }

    #[test]
    fn overflow_is_reported_by_count() {
        let pool = SwQueuePool::new(1, 2);
        let id = pool.claim(1).unwrap();
        let packets: Vec<_> = (0..5)
            .map(|i| build_test_packet([1, 1, 1, 1], [2, 2, 2, 2], L4Protocol::Udp, i, 2, 0))
            .collect();
        let enqueued = pool.enqueue_burst(id, packets);
        assert_eq!(enqueued, 2);
    }
}
