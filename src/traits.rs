//! Core traits defining the sequencing engine's contracts.
//!
//! # Core Traits Overview
//!
//! ## Barriers
//! - [`SequenceBarrier`]: a party's own progress plus the parties it must not outrun
//! - [`ProducerBarrier`]: reservation, publication and capacity queries
//! - [`ConsumerBarrier`]: waiting for data, and cooperative cancellation through alerts
//!
//! ## Waiting
//! - [`WaitStrategy`]: how a consumer passes time until its dependencies advance
//!
//! ## Data Access
//! - [`DataProvider`]: sequence-indexed access to the backing store
//!
//! ## Composition
//! - [`Sequencer`]: a producer barrier plus a default wait strategy, with factories for
//!   consumer barriers and forwarding conveniences
//! - [`EventSequencer`]: a sequencer that also owns its storage
//!
//! # Examples
//!
//! ```rust
//! use sequencer_rs::{ConsumerBarrier, EventSequencer, RingBufferEventSequencer, Sequencer};
//!
//! let sequencer = RingBufferEventSequencer::builder(|| 0i64)
//!     .buffer_length(64)
//!     .build()
//!     .unwrap();
//! let consumer = sequencer.new_single_consumer_barrier(&[]);
//! sequencer.add_gating_barriers(&[&consumer]);
//!
//! let hi = sequencer.write(2, |slot, seq| *slot = seq * 10).unwrap();
//! assert_eq!(consumer.wait_for(0).unwrap(), hi);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::barrier::{MultiConsumerBarrier, SingleConsumerBarrier};
use crate::blocker::SequenceBlocker;
use crate::error::{Result, SequencerError};
use crate::sequence::{AtomicSequence, Sequence};
use crate::utils::{DependentSequences, ProducerBackoff};

/// Progress of one party and the set of parties it depends on.
///
/// Barriers refer to each other only through the [`AtomicSequence`] each one exposes, so a
/// barrier graph never forms a reference cycle.
pub trait SequenceBarrier: Send + Sync {
    /// The barrier's own progress.
    fn sequence(&self) -> &Arc<AtomicSequence>;

    /// Sequences of the barriers this one tracks.
    fn dependents(&self) -> &DependentSequences;

    /// One-time initialisation of the barrier's progress.
    ///
    /// # Panics
    /// If the barrier was already claimed.
    fn claim(&self, sequence: Sequence);

    /// Minimum progress over the tracked barriers, `i64::MAX` if none are tracked.
    fn dependent_sequence(&self) -> Sequence {
        self.dependents().minimum()
    }

    fn minimum_sequence(&self) -> Sequence {
        self.sequence().get().min(self.dependent_sequence())
    }

    fn add_dependent_barriers(&self, barriers: &[&dyn SequenceBarrier]) {
        let sequences: Vec<_> = barriers.iter().map(|b| b.sequence().clone()).collect();
        self.dependents().add(&sequences);
    }

    fn add_dependent_barrier(&self, barrier: &dyn SequenceBarrier) {
        self.add_dependent_barriers(&[barrier]);
    }

    fn remove_dependent_barrier(&self, barrier: &dyn SequenceBarrier) -> bool {
        self.dependents().remove(barrier.sequence())
    }
}

/// The producer side of a sequencer.
///
/// The barrier's own [`sequence`](SequenceBarrier::sequence) is the producer cursor and its
/// dependents are the gating consumer barriers it must not overwrite.
pub trait ProducerBarrier: SequenceBarrier {
    /// Number of slots in the backing store, `-1` if unbounded.
    fn capacity(&self) -> i64;

    fn remaining_capacity(&self) -> i64;

    fn has_available_capacity(&self, required_capacity: i64) -> bool;

    /// Spin budget used before parking while waiting for capacity.
    fn producer_spin_iterations(&self) -> u32;

    fn next(&self) -> Result<Sequence> {
        self.next_n(1)
    }

    /// Reserve `n` slots, waiting for capacity. Returns the highest reserved sequence.
    fn next_n(&self, n: i64) -> Result<Sequence>;

    fn try_next(&self) -> Result<Sequence> {
        self.try_next_n(1)
    }

    /// Reserve `n` slots or fail with [`SequencerError::InsufficientCapacity`].
    fn try_next_n(&self, n: i64) -> Result<Sequence>;

    /// Reserve `n` slots, giving up with [`SequencerError::Timeout`] after `timeout`.
    fn try_next_timeout(&self, n: i64, timeout: Duration) -> Result<Sequence> {
        // No representable deadline means wait without one.
        let deadline = Instant::now().checked_add(timeout);
        let mut backoff = ProducerBackoff::new(self.producer_spin_iterations());
        loop {
            match self.try_next_n(n) {
                Err(SequencerError::InsufficientCapacity) => {}
                other => return other,
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(SequencerError::Timeout);
            }
            backoff.snooze();
        }
    }

    /// Reserve `n` slots, giving up with [`SequencerError::Interrupted`] as soon as
    /// `is_interrupted` returns true while waiting.
    fn next_interruptibly(&self, n: i64, is_interrupted: &dyn Fn() -> bool) -> Result<Sequence> {
        let mut backoff = ProducerBackoff::new(self.producer_spin_iterations());
        loop {
            match self.try_next_n(n) {
                Err(SequencerError::InsufficientCapacity) => {}
                other => return other,
            }
            if is_interrupted() {
                return Err(SequencerError::Interrupted);
            }
            backoff.snooze();
        }
    }

    fn publish(&self, sequence: Sequence);

    fn publish_range(&self, low: Sequence, high: Sequence);

    fn is_published(&self, sequence: Sequence) -> bool;

    /// Highest sequence in `[low, high]` such that every sequence from `low` up to it is
    /// published. Returns `low - 1` if `low` itself is not published.
    fn highest_published_sequence(&self, low: Sequence, high: Sequence) -> Sequence;

    fn blocker(&self) -> Option<&SequenceBlocker>;

    fn signal_all_when_blocking(&self) {
        if let Some(blocker) = self.blocker() {
            blocker.signal_all();
        }
    }
}

/// The consumer side: waiting for data and cooperative cancellation.
pub trait ConsumerBarrier: SequenceBarrier {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier>;

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy>;

    /// Wait until `sequence` is available and return the highest contiguously published
    /// sequence, which may be larger than `sequence`.
    ///
    /// # Errors
    /// [`SequencerError::Alert`] if the barrier is alerted, or whatever signal the wait
    /// strategy raises (e.g. [`SequencerError::Timeout`]).
    fn wait_for(&self, sequence: Sequence) -> Result<Sequence>;

    fn is_alerted(&self) -> bool;

    /// Raise the sticky alert flag and wake any thread parked on the producer's blocker.
    fn alert(&self);

    fn clear_alert(&self);

    fn check_alert(&self) -> Result<()> {
        if self.is_alerted() {
            Err(SequencerError::Alert)
        } else {
            Ok(())
        }
    }
}

/// Defines how consumers wait for available sequences.
///
/// Implementations loop on `consumer.dependent_sequence()` and must call
/// `consumer.check_alert()` on every iteration.
pub trait WaitStrategy: Send + Sync + std::fmt::Debug {
    /// Wait until `consumer.dependent_sequence() >= sequence` and return that value.
    fn wait_for(
        &self,
        sequence: Sequence,
        producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence>;

    /// Whether the strategy parks on the producer's [`SequenceBlocker`].
    fn requires_blocker(&self) -> bool {
        false
    }
}

/// Provides sequence-indexed access to the backing store.
///
/// # Safety
///
/// Every accessor is `unsafe`: the store hands out references through shared `&self`, and
/// only the sequencing protocol makes that sound. A producer may touch a slot between
/// reserving and publishing it; a consumer may read a slot after `wait_for` returned a
/// sequence at or past it and before its own sequence moves past it.
///
/// This lint allow is necessary because `get_mut` returns a mutable reference from an
/// immutable one; the stores use `UnsafeCell` and the sequencer provides the exclusion.
#[allow(clippy::mut_from_ref)]
pub trait DataProvider<T>: Send + Sync {
    /// # Safety
    /// The caller must own `sequence` under the protocol described above.
    unsafe fn get(&self, sequence: Sequence) -> &T;

    /// # Safety
    /// The caller must own `sequence` and no other reference to the slot may exist.
    unsafe fn get_mut(&self, sequence: Sequence) -> &mut T;

    /// # Safety
    /// See [`get_mut`](Self::get_mut).
    unsafe fn set(&self, sequence: Sequence, value: T) {
        *self.get_mut(sequence) = value;
    }

    /// Lookup optimised for a producer that has just reserved `sequence`.
    ///
    /// # Safety
    /// See [`get`](Self::get).
    unsafe fn producer_get(&self, sequence: Sequence) -> &T {
        self.get(sequence)
    }

    /// # Safety
    /// See [`get_mut`](Self::get_mut).
    unsafe fn producer_get_mut(&self, sequence: Sequence) -> &mut T {
        self.get_mut(sequence)
    }

    /// # Safety
    /// See [`get_mut`](Self::get_mut).
    unsafe fn producer_set(&self, sequence: Sequence, value: T) {
        *self.producer_get_mut(sequence) = value;
    }

    /// Lookup optimised for a consumer that has waited for `sequence`.
    ///
    /// # Safety
    /// See [`get`](Self::get).
    unsafe fn consumer_get(&self, sequence: Sequence) -> &T {
        self.get(sequence)
    }

    /// # Safety
    /// See [`get_mut`](Self::get_mut).
    unsafe fn consumer_get_mut(&self, sequence: Sequence) -> &mut T {
        self.get_mut(sequence)
    }

    /// # Safety
    /// See [`get_mut`](Self::get_mut).
    unsafe fn consumer_set(&self, sequence: Sequence, value: T) {
        *self.consumer_get_mut(sequence) = value;
    }
}

/// A producer barrier plus the wait strategy handed to the consumer barriers it creates.
///
/// Everything except the two accessors is a convenience forwarding to the producer barrier.
pub trait Sequencer: Send + Sync {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier>;

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy>;

    /// Current producer cursor.
    fn cursor(&self) -> Sequence {
        self.producer_barrier().sequence().get()
    }

    /// Number of slots, `-1` if unbounded.
    fn capacity(&self) -> i64 {
        self.producer_barrier().capacity()
    }

    fn remaining_capacity(&self) -> i64 {
        self.producer_barrier().remaining_capacity()
    }

    fn has_available_capacity(&self, required_capacity: i64) -> bool {
        self.producer_barrier()
            .has_available_capacity(required_capacity)
    }

    fn next(&self) -> Result<Sequence> {
        self.producer_barrier().next()
    }

    fn next_n(&self, n: i64) -> Result<Sequence> {
        self.producer_barrier().next_n(n)
    }

    fn next_interruptibly(&self, n: i64, is_interrupted: &dyn Fn() -> bool) -> Result<Sequence> {
        self.producer_barrier().next_interruptibly(n, is_interrupted)
    }

    fn try_next(&self) -> Result<Sequence> {
        self.producer_barrier().try_next()
    }

    fn try_next_n(&self, n: i64) -> Result<Sequence> {
        self.producer_barrier().try_next_n(n)
    }

    fn try_next_timeout(&self, n: i64, timeout: Duration) -> Result<Sequence> {
        self.producer_barrier().try_next_timeout(n, timeout)
    }

    fn publish(&self, sequence: Sequence) {
        self.producer_barrier().publish(sequence)
    }

    fn publish_range(&self, low: Sequence, high: Sequence) {
        self.producer_barrier().publish_range(low, high)
    }

    /// Register tail consumers the producer must not overwrite.
    fn add_gating_barriers(&self, barriers: &[&dyn SequenceBarrier]) {
        tracing::debug!(count = barriers.len(), "adding gating barriers");
        self.producer_barrier().add_dependent_barriers(barriers)
    }

    fn remove_gating_barrier(&self, barrier: &dyn SequenceBarrier) -> bool {
        let removed = self.producer_barrier().remove_dependent_barrier(barrier);
        tracing::debug!(removed, "removing gating barrier");
        removed
    }

    /// Barrier for a single consumer thread. An empty `barriers_to_track` tracks the producer.
    fn new_single_consumer_barrier(&self, barriers_to_track: &[&dyn SequenceBarrier]) -> SingleConsumerBarrier {
        self.new_single_consumer_barrier_with(self.wait_strategy().clone(), barriers_to_track)
    }

    fn new_single_consumer_barrier_with(
        &self,
        wait_strategy: Arc<dyn WaitStrategy>,
        barriers_to_track: &[&dyn SequenceBarrier],
    ) -> SingleConsumerBarrier {
        SingleConsumerBarrier::new(
            self.producer_barrier().clone(),
            wait_strategy,
            tracked_sequences(self.producer_barrier().as_ref(), barriers_to_track),
        )
    }

    /// Barrier shared by `worker_count` consumer threads. An empty `barriers_to_track` tracks
    /// the producer.
    fn new_multi_consumer_barrier(
        &self,
        worker_count: usize,
        barriers_to_track: &[&dyn SequenceBarrier],
    ) -> MultiConsumerBarrier {
        self.new_multi_consumer_barrier_with(
            worker_count,
            self.wait_strategy().clone(),
            barriers_to_track,
        )
    }

    fn new_multi_consumer_barrier_with(
        &self,
        worker_count: usize,
        wait_strategy: Arc<dyn WaitStrategy>,
        barriers_to_track: &[&dyn SequenceBarrier],
    ) -> MultiConsumerBarrier {
        MultiConsumerBarrier::new(
            self.producer_barrier().clone(),
            wait_strategy,
            tracked_sequences(self.producer_barrier().as_ref(), barriers_to_track),
            worker_count,
        )
    }
}

fn tracked_sequences(
    producer: &dyn ProducerBarrier,
    barriers_to_track: &[&dyn SequenceBarrier],
) -> Vec<Arc<AtomicSequence>> {
    if barriers_to_track.is_empty() {
        vec![producer.sequence().clone()]
    } else {
        barriers_to_track
            .iter()
            .map(|b| b.sequence().clone())
            .collect()
    }
}

/// A [`Sequencer`] that owns the storage its sequences index into.
pub trait EventSequencer<T>: DataProvider<T> + Sequencer {
    /// Reserve `n` slots, fill each one in place with `f`, and publish them as one batch.
    /// Returns the highest published sequence.
    fn write<F>(&self, n: i64, mut f: F) -> Result<Sequence>
    where
        F: FnMut(&mut T, Sequence),
        Self: Sized,
    {
        let high = Sequencer::next_n(self, n)?;
        let low = high - (n - 1);
        for sequence in low..=high {
            // SAFETY: the slots in [low, high] were just reserved by this call and are not
            // yet visible to consumers.
            let slot = unsafe { self.producer_get_mut(sequence) };
            f(slot, sequence);
        }
        Sequencer::publish_range(self, low, high);
        Ok(high)
    }

    fn write_one<F>(&self, f: F) -> Result<Sequence>
    where
        F: FnOnce(&mut T, Sequence),
        Self: Sized,
    {
        let sequence = Sequencer::next(self)?;
        // SAFETY: see `write`.
        let slot = unsafe { self.producer_get_mut(sequence) };
        f(slot, sequence);
        Sequencer::publish(self, sequence);
        Ok(sequence)
    }
}
