//! Buffered samples and sequence id allocation.

use std::sync::atomic::{AtomicU64, Ordering};

use envlink_common::Reading;
use serde::{Deserialize, Serialize};

/// One reading waiting for delivery.
///
/// Immutable once created except for `attempt_count`, which only the buffer
/// bumps when a send attempt is judged failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    sequence_id: u64,
    captured_at: i64,
    payload: Reading,
    attempt_count: u32,
}

impl Sample {
    /// Create a fresh sample with `attempt_count = 0`.
    pub fn new(sequence_id: u64, captured_at: i64, payload: Reading) -> Self {
        Self {
            sequence_id,
            captured_at,
            payload,
            attempt_count: 0,
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    /// Unix epoch milliseconds when the reading was taken.
    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn payload(&self) -> &Reading {
        &self.payload
    }

    /// Number of failed delivery attempts so far.
    pub fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// True if this sample may already have reached the broker once.
    pub fn is_redelivery(&self) -> bool {
        self.attempt_count > 0
    }

    pub(crate) fn record_failed_attempt(&mut self) -> u32 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.attempt_count
    }
}

/// Hands out strictly increasing sequence ids, starting at 1.
#[derive(Debug)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    /// Continue numbering after a restored buffer.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first.max(1)),
        }
    }

    /// Allocate the next id.
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The id the next call to [`next`](Self::next) will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}
