//! Producer barrier over an [`MpUnboundedBuffer`].
//!
//! Producers race on the cursor exactly like [`MultiProducerSequencer`](crate::MultiProducerSequencer)
//! but never wait for capacity: the buffer grows instead of wrapping. Whenever a reservation
//! crosses a chunk boundary the reserving thread releases the chunks every gating consumer
//! has finished with.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::barrier::claim_once;
use crate::blocker::SequenceBlocker;
use crate::error::Result;
use crate::invalid_argument;
use crate::sequence::{AtomicSequence, Sequence};
use crate::sequencer::DEFAULT_PRODUCER_SPIN_ITERATIONS;
use crate::traits::{ProducerBarrier, SequenceBarrier};
use crate::unbounded::MpUnboundedBuffer;
use crate::utils::DependentSequences;

pub struct MpUnboundedBufferSequencer<T> {
    buffer: Arc<MpUnboundedBuffer<T>>,
    chunk_length: i64,
    cursor: Arc<AtomicSequence>,
    gating_sequences: DependentSequences,
    blocker: Option<SequenceBlocker>,
    producer_spin_iterations: u32,
    claimed: AtomicBool,
}

impl<T: Send + Sync> MpUnboundedBufferSequencer<T> {
    pub fn new(buffer: Arc<MpUnboundedBuffer<T>>) -> Self {
        Self {
            chunk_length: buffer.chunk_length() as i64,
            buffer,
            cursor: Arc::new(AtomicSequence::default()),
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

    pub fn buffer(&self) -> &Arc<MpUnboundedBuffer<T>> {
        &self.buffer
    }

    fn check_reservation(&self, n: i64) -> Result<()> {
        if n < 1 || n > self.chunk_length {
            return Err(invalid_argument!(
                "n must be between 1 and {}, got {n}",
                self.chunk_length
            ));
        }
        Ok(())
    }

    fn reserve(&self, n: i64) -> Result<Sequence> {
        self.check_reservation(n)?;
        loop {
            let current = self.cursor.get();
            let next = current + n;
            if self.cursor.compare_and_set(current, next) {
                if current.div_euclid(self.chunk_length) != next.div_euclid(self.chunk_length) {
                    self.buffer.recycle(self.dependent_sequence());
                }
                return Ok(next);
            }
        }
    }
}

impl<T: Send + Sync> SequenceBarrier for MpUnboundedBufferSequencer<T> {
    fn sequence(&self) -> &Arc<AtomicSequence> {
        &self.cursor
    }

    fn dependents(&self) -> &DependentSequences {
        &self.gating_sequences
    }

    fn claim(&self, sequence: Sequence) {
        claim_once(&self.claimed, "MpUnboundedBufferSequencer");
        self.cursor.set(sequence);
    }
}

impl<T: Send + Sync> ProducerBarrier for MpUnboundedBufferSequencer<T> {
    fn capacity(&self) -> i64 {
        -1
    }

    fn remaining_capacity(&self) -> i64 {
        i64::MAX
    }

    fn has_available_capacity(&self, _required_capacity: i64) -> bool {
        true
    }

    fn producer_spin_iterations(&self) -> u32 {
        self.producer_spin_iterations
    }

    fn next_n(&self, n: i64) -> Result<Sequence> {
        self.reserve(n)
    }

    fn try_next_n(&self, n: i64) -> Result<Sequence> {
        self.reserve(n)
    }

    fn publish(&self, sequence: Sequence) {
        self.buffer.publish(sequence);
        self.signal_all_when_blocking();
    }

    fn publish_range(&self, low: Sequence, high: Sequence) {
        for sequence in low..=high {
            self.buffer.publish(sequence);
        }
        self.signal_all_when_blocking();
    }

    fn is_published(&self, sequence: Sequence) -> bool {
        self.buffer.is_published(sequence)
    }

    fn highest_published_sequence(&self, low: Sequence, high: Sequence) -> Sequence {
        (low..=high)
            .find(|&sequence| !self.buffer.is_published(sequence))
            .map_or(high, |unpublished| unpublished - 1)
    }

    fn blocker(&self) -> Option<&SequenceBlocker> {
        self.blocker.as_ref()
    }
}

impl<T> std::fmt::Debug for MpUnboundedBufferSequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpUnboundedBufferSequencer")
            .field("cursor", &self.cursor.get())
            .field("buffer", &self.buffer)
            .field("gating_sequences", &self.gating_sequences)
            .finish()
    }
}
