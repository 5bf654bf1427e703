//! Bounded store-and-forward buffer between the poller and the publisher.
//!
//! Samples are kept in `sequence_id` order. Each slot is either `Pending`
//! (eligible for the next batch) or `InFlight` (handed to the publisher and
//! awaiting an ack). A requeued sample keeps its original sequence id, so it
//! naturally sorts ahead of anything captured after it.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::sample::Sample;

/// Result of [`SampleBuffer::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// Stored without displacing anything.
    Accepted,
    /// Stored after evicting the oldest pending sample (its sequence id).
    AcceptedWithEviction(u64),
    /// Not stored: the buffer is full of in-flight samples, or the id is a duplicate.
    Rejected,
}

impl EnqueueResult {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, EnqueueResult::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Pending,
    InFlight,
}

#[derive(Debug)]
struct Slot {
    sample: Sample,
    state: SlotState,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    acknowledged: u64,
    evicted: u64,
    rejected: u64,
    abandoned: u64,
    requeued: u64,
}

#[derive(Debug, Default)]
struct Inner {
    slots: BTreeMap<u64, Slot>,
    in_flight: usize,
    counters: Counters,
}

impl Inner {
    fn oldest_pending(&self) -> Option<u64> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.state == SlotState::Pending)
            .map(|(seq, _)| *seq)
    }

    fn pending_len(&self) -> usize {
        self.slots.len() - self.in_flight
    }
}

/// Buffer statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub len: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub enqueued: u64,
    pub acknowledged: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub requeued: u64,
}

/// Bounded FIFO of samples awaiting delivery.
///
/// All operations take one short internal lock and never block on I/O.
#[derive(Debug)]
pub struct SampleBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
    pending_notify: Notify,
}

impl SampleBuffer {
    /// Create an empty buffer. `capacity` must be at least 1.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
            pending_notify: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of samples held, pending and in flight.
    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of samples eligible for the next batch.
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Add a new sample.
    ///
    /// When full, the oldest pending sample is evicted to make room. If every
    /// held sample is in flight the new one is rejected instead.
    pub fn enqueue(&self, sample: Sample) -> EnqueueResult {
        let seq = sample.sequence_id();
        let result = {
            let mut inner = self.inner.lock();

            if inner.slots.contains_key(&seq) {
                inner.counters.rejected += 1;
                EnqueueResult::Rejected
            } else if inner.slots.len() < self.capacity {
                inner.slots.insert(
                    seq,
                    Slot {
                        sample,
                        state: SlotState::Pending,
                    },
                );
                inner.counters.enqueued += 1;
                EnqueueResult::Accepted
            } else {
                match inner.oldest_pending() {
                    Some(victim) => {
                        inner.slots.remove(&victim);
                        inner.slots.insert(
                            seq,
                            Slot {
                                sample,
                                state: SlotState::Pending,
                            },
                        );
                        inner.counters.evicted += 1;
                        inner.counters.enqueued += 1;
                        EnqueueResult::AcceptedWithEviction(victim)
                    }
                    None => {
                        inner.counters.rejected += 1;
                        EnqueueResult::Rejected
                    }
                }
            }
        };

        match result {
            EnqueueResult::Accepted => {
                debug!(sequence_id = seq, "Sample buffered");
                self.pending_notify.notify_waiters();
            }
            EnqueueResult::AcceptedWithEviction(victim) => {
                warn!(
                    sequence_id = seq,
                    evicted = victim,
                    capacity = self.capacity,
                    "Buffer full; evicted oldest pending sample"
                );
                self.pending_notify.notify_waiters();
            }
            EnqueueResult::Rejected => {
                warn!(
                    sequence_id = seq,
                    capacity = self.capacity,
                    "Buffer full of in-flight samples; rejected new sample"
                );
            }
        }

        result
    }

    /// Hand out up to `max` pending samples in sequence order, marking them in flight.
    pub fn peek_batch(&self, max: usize) -> Vec<Sample> {
        let mut inner = self.inner.lock();
        let mut batch = Vec::with_capacity(max.min(inner.slots.len()));

        for slot in inner.slots.values_mut() {
            if batch.len() >= max {
                break;
            }
            if slot.state == SlotState::Pending {
                slot.state = SlotState::InFlight;
                batch.push(slot.sample.clone());
            }
        }

        inner.in_flight += batch.len();
        batch
    }

    /// Remove a sample after a successful send.
    ///
    /// The slot is removed whether it is pending or in flight. Returns `false`
    /// if the sample is unknown or already acked.
    pub fn ack(&self, sequence_id: u64) -> bool {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slots.remove(&sequence_id) else {
            return false;
        };

        if slot.state == SlotState::InFlight {
            inner.in_flight -= 1;
        }
        inner.counters.acknowledged += 1;
        true
    }

    /// Return an in-flight sample to pending after a failed send attempt.
    ///
    /// Bumps the attempt count and returns the new value. The sample keeps its
    /// sequence id and therefore goes out ahead of newer samples.
    pub fn requeue(&self, sequence_id: u64) -> Option<u32> {
        let attempts = {
            let mut inner = self.inner.lock();
            let slot = inner
                .slots
                .get_mut(&sequence_id)
                .filter(|slot| slot.state == SlotState::InFlight)?;

            slot.state = SlotState::Pending;
            let attempts = slot.sample.record_failed_attempt();
            inner.in_flight -= 1;
            inner.counters.requeued += 1;
            attempts
        };

        self.pending_notify.notify_waiters();
        Some(attempts)
    }

    /// Return an in-flight sample to pending without counting an attempt.
    ///
    /// Used for samples that were peeked but never sent.
    pub fn release(&self, sequence_id: u64) -> bool {
        let released = {
            let mut inner = self.inner.lock();
            match inner.slots.get_mut(&sequence_id) {
                Some(slot) if slot.state == SlotState::InFlight => {
                    slot.state = SlotState::Pending;
                    inner.in_flight -= 1;
                    true
                }
                _ => false,
            }
        };

        if released {
            self.pending_notify.notify_waiters();
        }
        released
    }

    /// Drop a sample for good (max delivery attempts reached).
    pub fn abandon(&self, sequence_id: u64) -> Option<Sample> {
        let mut inner = self.inner.lock();
        let slot = inner.slots.remove(&sequence_id)?;

        if slot.state == SlotState::InFlight {
            inner.in_flight -= 1;
        }
        inner.counters.abandoned += 1;
        Some(slot.sample)
    }

    /// Return everything still in flight to pending, without counting attempts.
    pub fn release_in_flight(&self) -> usize {
        let count = {
            let mut inner = self.inner.lock();
            let mut count = 0;
            for slot in inner.slots.values_mut() {
                if slot.state == SlotState::InFlight {
                    slot.state = SlotState::Pending;
                    count += 1;
                }
            }
            inner.in_flight = 0;
            count
        };

        if count > 0 {
            self.pending_notify.notify_waiters();
        }
        count
    }

    /// Current statistics.
    pub fn stats(&self) -> BufferStats {
        let inner = self.inner.lock();
        BufferStats {
            capacity: self.capacity,
            len: inner.slots.len(),
            pending: inner.pending_len(),
            in_flight: inner.in_flight,
            enqueued: inner.counters.enqueued,
            acknowledged: inner.counters.acknowledged,
            evicted: inner.counters.evicted,
            rejected: inner.counters.rejected,
            abandoned: inner.counters.abandoned,
            requeued: inner.counters.requeued,
        }
    }

    /// Copy of every held sample in sequence order.
    pub fn snapshot(&self) -> Vec<Sample> {
        self.inner
            .lock()
            .slots
            .values()
            .map(|slot| slot.sample.clone())
            .collect()
    }

    /// Load previously persisted samples as pending.
    ///
    /// Keeps the newest `capacity` samples; returns how many were restored.
    pub fn restore(&self, mut samples: Vec<Sample>) -> usize {
        samples.sort_by_key(Sample::sequence_id);
        samples.dedup_by_key(|s| s.sequence_id());

        let restored = {
            let mut inner = self.inner.lock();
            samples.retain(|s| !inner.slots.contains_key(&s.sequence_id()));

            let room = self.capacity.saturating_sub(inner.slots.len());
            let skip = samples.len().saturating_sub(room);
            inner.counters.evicted += skip as u64;

            let mut restored = 0;
            for sample in samples.into_iter().skip(skip) {
                inner.slots.insert(
                    sample.sequence_id(),
                    Slot {
                        sample,
                        state: SlotState::Pending,
                    },
                );
                restored += 1;
            }
            restored
        };

        if restored > 0 {
            self.pending_notify.notify_waiters();
        }
        restored
    }

    /// Highest sequence id currently held.
    pub fn max_sequence_id(&self) -> Option<u64> {
        self.inner.lock().slots.keys().next_back().copied()
    }

    /// Wait until at least one sample is pending.
    pub async fn wait_for_pending(&self) {
        loop {
            let notified = self.pending_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending_len() > 0 {
                return;
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envlink_common::Reading;
    use std::time::Duration;

    fn sample(seq: u64) -> Sample {
        Sample::new(
            seq,
            1_700_000_000_000 + seq as i64,
            Reading::new().with_metric("cpu/temperature", 40.0 + seq as f64),
        )
    }

    fn seqs(batch: &[Sample]) -> Vec<u64> {
        batch.iter().map(Sample::sequence_id).collect()
    }

    #[test]
    fn test_batch_in_sequence_order() {
        let buffer = SampleBuffer::new(10);
        for seq in [3, 1, 2] {
            assert_eq!(buffer.enqueue(sample(seq)), EnqueueResult::Accepted);
        }

        let batch = buffer.peek_batch(10);
        assert_eq!(seqs(&batch), vec![1, 2, 3]);
        assert_eq!(buffer.pending_len(), 0);
        assert_eq!(buffer.in_flight_len(), 3);
    }

    #[test]
    fn test_peek_skips_in_flight() {
        let buffer = SampleBuffer::new(10);
        for seq in 1..=4 {
            buffer.enqueue(sample(seq));
        }

        assert_eq!(seqs(&buffer.peek_batch(2)), vec![1, 2]);
        assert_eq!(seqs(&buffer.peek_batch(2)), vec![3, 4]);
        assert!(buffer.peek_batch(2).is_empty());
    }

    #[test]
    fn test_ack_is_idempotent() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));
        buffer.peek_batch(1);

        assert!(buffer.ack(1));
        assert!(!buffer.ack(1));
        assert!(!buffer.ack(99));
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().acknowledged, 1);
    }

    #[test]
    fn test_ack_removes_pending_slot() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));
        buffer.enqueue(sample(2));
        buffer.peek_batch(1);

        assert!(buffer.ack(2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.in_flight_len(), 1);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn test_requeue_goes_to_front_with_attempt() {
        let buffer = SampleBuffer::new(10);
        buffer.enqueue(sample(5));
        buffer.peek_batch(1);
        buffer.enqueue(sample(6));
        buffer.enqueue(sample(7));

        assert_eq!(buffer.requeue(5), Some(1));
        assert_eq!(buffer.requeue(5), None);

        let batch = buffer.peek_batch(10);
        assert_eq!(seqs(&batch), vec![5, 6, 7]);
        assert_eq!(batch[0].attempt_count(), 1);
        assert!(batch[0].is_redelivery());
        assert_eq!(batch[1].attempt_count(), 0);
    }

    #[test]
    fn test_release_keeps_attempt_count() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));
        buffer.peek_batch(1);

        assert!(buffer.release(1));
        assert!(!buffer.release(1));
        assert_eq!(buffer.peek_batch(1)[0].attempt_count(), 0);
    }

    #[test]
    fn test_full_buffer_evicts_oldest_pending() {
        let capacity = 5;
        let buffer = SampleBuffer::new(capacity);
        for seq in 1..=capacity as u64 {
            assert_eq!(buffer.enqueue(sample(seq)), EnqueueResult::Accepted);
        }

        assert_eq!(
            buffer.enqueue(sample(6)),
            EnqueueResult::AcceptedWithEviction(1)
        );
        assert_eq!(buffer.len(), capacity);
        assert_eq!(buffer.stats().evicted, 1);
        assert_eq!(seqs(&buffer.snapshot()), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_eviction_spares_in_flight() {
        let buffer = SampleBuffer::new(3);
        for seq in 1..=3 {
            buffer.enqueue(sample(seq));
        }
        buffer.peek_batch(2);

        assert_eq!(
            buffer.enqueue(sample(4)),
            EnqueueResult::AcceptedWithEviction(3)
        );
        assert_eq!(seqs(&buffer.snapshot()), vec![1, 2, 4]);
    }

    #[test]
    fn test_rejects_when_all_in_flight() {
        let buffer = SampleBuffer::new(2);
        buffer.enqueue(sample(1));
        buffer.enqueue(sample(2));
        buffer.peek_batch(2);

        assert_eq!(buffer.enqueue(sample(3)), EnqueueResult::Rejected);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.stats().rejected, 1);
    }

    #[test]
    fn test_rejects_duplicate_sequence() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));

        assert_eq!(buffer.enqueue(sample(1)), EnqueueResult::Rejected);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_capacity_one() {
        let buffer = SampleBuffer::new(1);
        buffer.enqueue(sample(1));

        assert_eq!(
            buffer.enqueue(sample(2)),
            EnqueueResult::AcceptedWithEviction(1)
        );
        buffer.peek_batch(1);
        assert_eq!(buffer.enqueue(sample(3)), EnqueueResult::Rejected);
    }

    #[test]
    fn test_abandon() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));
        buffer.enqueue(sample(2));
        buffer.peek_batch(1);

        assert_eq!(buffer.abandon(1).map(|s| s.sequence_id()), Some(1));
        assert!(buffer.abandon(1).is_none());
        assert_eq!(buffer.in_flight_len(), 0);
        assert_eq!(buffer.stats().abandoned, 1);
    }

    #[test]
    fn test_release_in_flight_keeps_attempts() {
        let buffer = SampleBuffer::new(4);
        for seq in 1..=3 {
            buffer.enqueue(sample(seq));
        }
        buffer.peek_batch(2);

        assert_eq!(buffer.release_in_flight(), 2);
        assert_eq!(buffer.in_flight_len(), 0);
        let batch = buffer.peek_batch(3);
        assert_eq!(seqs(&batch), vec![1, 2, 3]);
        assert!(batch.iter().all(|s| s.attempt_count() == 0));
        assert_eq!(buffer.stats().requeued, 0);
    }

    #[test]
    fn test_restore_keeps_newest() {
        let buffer = SampleBuffer::new(2);
        let restored = buffer.restore(vec![sample(1), sample(2), sample(3)]);

        assert_eq!(restored, 2);
        assert_eq!(seqs(&buffer.snapshot()), vec![2, 3]);
        assert_eq!(buffer.max_sequence_id(), Some(3));
    }

    #[test]
    fn test_stats() {
        let buffer = SampleBuffer::new(8);
        for seq in 1..=4 {
            buffer.enqueue(sample(seq));
        }
        buffer.peek_batch(3);
        buffer.ack(1);
        buffer.requeue(2);

        let stats = buffer.stats();
        assert_eq!(stats.capacity, 8);
        assert_eq!(stats.len, 3);
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.enqueued, 4);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.requeued, 1);
    }

    #[test]
    fn test_wait_for_pending_wakes_on_enqueue() {
        let buffer = SampleBuffer::new(4);
        let mut waiter = tokio_test::task::spawn(buffer.wait_for_pending());

        tokio_test::assert_pending!(waiter.poll());
        buffer.enqueue(sample(1));

        assert!(waiter.is_woken());
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test]
    async fn test_wait_for_pending_returns_immediately() {
        let buffer = SampleBuffer::new(4);
        buffer.enqueue(sample(1));

        tokio::time::timeout(Duration::from_millis(100), buffer.wait_for_pending())
            .await
            .expect("already pending");
    }
}
