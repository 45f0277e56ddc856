//! Producer barriers for the fixed-capacity ring.
//!
//! # Overview
//! A producer barrier hands out sequence numbers, which represent positions in the ring
//! buffer. It serves three functions:
//!
//! 1. **Sequence Generation**: unique, monotonically increasing sequences for producers.
//! 2. **Capacity Management**: a producer never laps the slowest gating consumer, i.e.
//!    `cursor - capacity <= min(gating sequences)` holds at every instant.
//! 3. **Publication**: marks reserved slots as readable and wakes parked consumers when a
//!    [`SequenceBlocker`] is attached.
//!
//! # Single Producer Design
//! [`SingleProducerSequencer`] has one writer, so it claims without CAS. It remembers the
//! last gating minimum it saw and only rescans the consumers when a reservation would cross
//! that cached value.
//!
//! # Multi-Producer Support
//! [`MultiProducerSequencer`] lets producers race on the cursor with CAS. The cursor is the
//! highest *reserved* sequence; whether a slot was actually filled is tracked by a parallel
//! array in which each slot stores the sequence last published into it. Consumers resolve
//! the contiguous readable range with
//! [`highest_published_sequence`](ProducerBarrier::highest_published_sequence).
//!
//! # Usage Example
//! ```rust
//! use sequencer_rs::{ProducerBarrier, SingleProducerSequencer};
//!
//! let sequencer = SingleProducerSequencer::new(1024);
//! let high = sequencer.next_n(4).unwrap();
//! sequencer.publish_range(high - 3, high);
//! assert!(sequencer.is_published(3));
//! ```

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use crate::barrier::claim_once;
use crate::blocker::SequenceBlocker;
use crate::error::{Result, SequencerError};
use crate::invalid_argument;
use crate::sequence::{AtomicSequence, Sequence, INITIAL_SEQUENCE};
use crate::traits::{ProducerBarrier, SequenceBarrier};
use crate::utils::{DependentSequences, ProducerBackoff, Utils};

/// Spin budget a producer burns before parking when the ring is full.
pub const DEFAULT_PRODUCER_SPIN_ITERATIONS: u32 = 10;

fn check_reservation(n: i64, buffer_size: i64) -> Result<()> {
    if n < 1 || n > buffer_size {
        return Err(invalid_argument!(
            "n must be between 1 and {buffer_size}, got {n}"
        ));
    }
    Ok(())
}

fn check_buffer_size(buffer_size: usize) {
    assert!(
        Utils::is_power_of_two(buffer_size),
        "Buffer size must be a power of 2"
    );
}

/// A producer barrier optimized for a single producer thread.
pub struct SingleProducerSequencer {
    buffer_size: i64,
    cursor: Arc<AtomicSequence>,
    // Last reserved sequence. Only the producer thread writes it.
    next_value: AtomicSequence,
    // Gating minimum observed by the last rescan.
    cached_value: AtomicSequence,
    gating_sequences: DependentSequences,
    blocker: Option<SequenceBlocker>,
    producer_spin_iterations: u32,
    claimed: AtomicBool,
}

impl SingleProducerSequencer {
    /// # Panics
    /// If `buffer_size` is not a power of 2.
    pub fn new(buffer_size: usize) -> Self {
        check_buffer_size(buffer_size);
        Self {
            buffer_size: buffer_size as i64,
            cursor: Arc::new(AtomicSequence::default()),
            next_value: AtomicSequence::default(),
            cached_value: AtomicSequence::default(),
            gating_sequences: DependentSequences::new(Vec::new()),
            blocker: None,
            producer_spin_iterations: DEFAULT_PRODUCER_SPIN_ITERATIONS,
            claimed: AtomicBool::new(false),
        }
    }

    /// Attach a blocker so that [`BlockingWaitStrategy`](crate::BlockingWaitStrategy)
    /// consumers can park on this producer.
    pub fn with_blocker(mut self) -> Self {
        self.blocker = Some(SequenceBlocker::new());
        self
    }

    pub fn with_producer_spin_iterations(mut self, spin_iterations: u32) -> Self {
        self.producer_spin_iterations = spin_iterations;
        self
    }

    fn has_capacity(&self, required_capacity: i64, do_store: bool) -> bool {
        let next_value = self.next_value.get_plain();
        let wrap_point = next_value + required_capacity - self.buffer_size;
        let cached_gating_sequence = self.cached_value.get_plain();

        if wrap_point > cached_gating_sequence || cached_gating_sequence > next_value {
            if do_store {
                self.cursor.set_volatile(self.cursor.get_plain());
            }
            let min_sequence = self.gating_sequences.minimum_or(next_value);
            self.cached_value.set_plain(min_sequence);
            if wrap_point > min_sequence {
                return false;
            }
        }
        true
    }
}

impl SequenceBarrier for SingleProducerSequencer {
    fn sequence(&self) -> &Arc<AtomicSequence> {
        &self.cursor
    }

    fn dependents(&self) -> &DependentSequences {
        &self.gating_sequences
    }

    fn claim(&self, sequence: Sequence) {
        claim_once(&self.claimed, "SingleProducerSequencer");
        self.next_value.set_plain(sequence);
        self.cached_value.set_plain(sequence);
        self.cursor.set(sequence);
    }
}

impl ProducerBarrier for SingleProducerSequencer {
    fn capacity(&self) -> i64 {
        self.buffer_size
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.next_value.get_plain();
        let consumed = self.gating_sequences.minimum_or(produced);
        self.buffer_size - (produced - consumed)
    }

    fn has_available_capacity(&self, required_capacity: i64) -> bool {
        self.has_capacity(required_capacity, false)
    }

    fn producer_spin_iterations(&self) -> u32 {
        self.producer_spin_iterations
    }

    fn next_n(&self, n: i64) -> Result<Sequence> {
        check_reservation(n, self.buffer_size)?;

        let next_value = self.next_value.get_plain();
        let next_sequence = next_value + n;
        let wrap_point = next_sequence - self.buffer_size;
        let cached_gating_sequence = self.cached_value.get_plain();

        if wrap_point > cached_gating_sequence || cached_gating_sequence > next_value {
            self.cursor.set_volatile(self.cursor.get_plain());

            let mut backoff = ProducerBackoff::new(self.producer_spin_iterations);
            let mut min_sequence = self.gating_sequences.minimum_or(next_value);
            while wrap_point > min_sequence {
                backoff.snooze();
                min_sequence = self.gating_sequences.minimum_or(next_value);
            }
            self.cached_value.set_plain(min_sequence);
        }

        self.next_value.set_plain(next_sequence);
        Ok(next_sequence)
    }

    fn try_next_n(&self, n: i64) -> Result<Sequence> {
        check_reservation(n, self.buffer_size)?;
        if !self.has_capacity(n, true) {
            return Err(SequencerError::InsufficientCapacity);
        }
        let next_sequence = self.next_value.get_plain() + n;
        self.next_value.set_plain(next_sequence);
        Ok(next_sequence)
    }

    fn publish(&self, sequence: Sequence) {
        self.cursor.set(sequence);
        self.signal_all_when_blocking();
    }

    fn publish_range(&self, _low: Sequence, high: Sequence) {
        self.publish(high);
    }

    fn is_published(&self, sequence: Sequence) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published_sequence(&self, _low: Sequence, high: Sequence) -> Sequence {
        high
    }

    fn blocker(&self) -> Option<&SequenceBlocker> {
        self.blocker.as_ref()
    }
}

impl std::fmt::Debug for SingleProducerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleProducerSequencer")
            .field("buffer_size", &self.buffer_size)
            .field("cursor", &self.cursor.get())
            .field("next_value", &self.next_value.get_plain())
            .field("gating_sequences", &self.gating_sequences)
            .finish()
    }
}

/// A producer barrier for any number of concurrent producer threads.
pub struct MultiProducerSequencer {
    buffer_size: i64,
    mask: i64,
    // Highest reserved sequence.
    cursor: Arc<AtomicSequence>,
    gating_sequence_cache: AtomicSequence,
    // Per slot, the sequence most recently published into it.
    available_buffer: Box<[AtomicI64]>,
    gating_sequences: DependentSequences,
    blocker: Option<SequenceBlocker>,
    producer_spin_iterations: u32,
    claimed: AtomicBool,
}

impl MultiProducerSequencer {
    /// # Panics
    /// If `buffer_size` is not a power of 2.
    pub fn new(buffer_size: usize) -> Self {
        check_buffer_size(buffer_size);
        Self {
            buffer_size: buffer_size as i64,
            mask: buffer_size as i64 - 1,
            cursor: Arc::new(AtomicSequence::default()),
            gating_sequence_cache: AtomicSequence::default(),
            available_buffer: (0..buffer_size)
                .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
                .collect(),
            gating_sequences: DependentSequences::new(Vec::new()),
            blocker: None,
            producer_spin_iterations: DEFAULT_PRODUCER_SPIN_ITERATIONS,
            claimed: AtomicBool::new(false),
        }
    }

    pub fn with_blocker(mut self) -> Self {
        self.blocker = Some(SequenceBlocker::new());
        self
    }

    pub fn with_producer_spin_iterations(mut self, spin_iterations: u32) -> Self {
        self.producer_spin_iterations = spin_iterations;
        self
    }

    #[inline]
    fn available_slot(&self, sequence: Sequence) -> &AtomicI64 {
        &self.available_buffer[(sequence & self.mask) as usize]
    }

    #[inline]
    fn set_available(&self, sequence: Sequence) {
        self.available_slot(sequence)
            .store(sequence, Ordering::Release);
    }

    fn has_capacity_at(&self, cursor_value: Sequence, required_capacity: i64) -> bool {
        let wrap_point = cursor_value + required_capacity - self.buffer_size;
        let cached_gating_sequence = self.gating_sequence_cache.get();

        if wrap_point > cached_gating_sequence || cached_gating_sequence > cursor_value {
            let min_sequence = self.gating_sequences.minimum_or(cursor_value);
            self.gating_sequence_cache.set(min_sequence);
            if wrap_point > min_sequence {
                return false;
            }
        }
        true
    }
}

impl SequenceBarrier for MultiProducerSequencer {
    fn sequence(&self) -> &Arc<AtomicSequence> {
        &self.cursor
    }

    fn dependents(&self) -> &DependentSequences {
        &self.gating_sequences
    }

    fn claim(&self, sequence: Sequence) {
        claim_once(&self.claimed, "MultiProducerSequencer");
        self.gating_sequence_cache.set(sequence);
        self.cursor.set(sequence);
    }
}

impl ProducerBarrier for MultiProducerSequencer {
    fn capacity(&self) -> i64 {
        self.buffer_size
    }

    fn remaining_capacity(&self) -> i64 {
        let produced = self.cursor.get();
        let consumed = self.gating_sequences.minimum_or(produced);
        self.buffer_size - (produced - consumed)
    }

    fn has_available_capacity(&self, required_capacity: i64) -> bool {
        self.has_capacity_at(self.cursor.get(), required_capacity)
    }

    fn producer_spin_iterations(&self) -> u32 {
        self.producer_spin_iterations
    }

    fn next_n(&self, n: i64) -> Result<Sequence> {
        check_reservation(n, self.buffer_size)?;

        let mut backoff = ProducerBackoff::new(self.producer_spin_iterations);
        loop {
            let current = self.cursor.get();
            let next = current + n;
            let wrap_point = next - self.buffer_size;
            let cached_gating_sequence = self.gating_sequence_cache.get();

            if wrap_point > cached_gating_sequence || cached_gating_sequence > current {
                let gating_sequence = self.gating_sequences.minimum_or(current);
                if wrap_point > gating_sequence {
                    backoff.snooze();
                    continue;
                }
                self.gating_sequence_cache
                    .compare_and_set(cached_gating_sequence, gating_sequence);
            } else if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn try_next_n(&self, n: i64) -> Result<Sequence> {
        check_reservation(n, self.buffer_size)?;

        loop {
            let current = self.cursor.get();
            let next = current + n;
            if !self.has_capacity_at(current, n) {
                return Err(SequencerError::InsufficientCapacity);
            }
            if self.cursor.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn publish(&self, sequence: Sequence) {
        self.set_available(sequence);
        self.signal_all_when_blocking();
    }

    fn publish_range(&self, low: Sequence, high: Sequence) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.signal_all_when_blocking();
    }

    fn is_published(&self, sequence: Sequence) -> bool {
        self.available_slot(sequence).load(Ordering::Acquire) == sequence
    }

    fn highest_published_sequence(&self, low: Sequence, high: Sequence) -> Sequence {
        (low..=high)
            .find(|&sequence| !self.is_published(sequence))
            .map_or(high, |unpublished| unpublished - 1)
    }

    fn blocker(&self) -> Option<&SequenceBlocker> {
        self.blocker.as_ref()
    }
}

impl std::fmt::Debug for MultiProducerSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiProducerSequencer")
            .field("buffer_size", &self.buffer_size)
            .field("cursor", &self.cursor.get())
            .field("gating_sequences", &self.gating_sequences)
            .finish()
    }
}
