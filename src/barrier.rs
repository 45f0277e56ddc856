//! Consumer barriers.
//!
//! A consumer barrier is what a consumer thread waits on. It tracks a set of upstream
//! sequences (the producer cursor and/or other consumer barriers), delegates the actual
//! waiting to a [`WaitStrategy`], and then asks the producer for the highest *contiguously*
//! published sequence, because a multi-producer sequencer may have reserved slots that are
//! not filled yet.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crossbeam_utils::CachePadded;

use crate::{
    error::Result,
    sequence::{AtomicSequence, Sequence, INITIAL_SEQUENCE},
    traits::{ConsumerBarrier, ProducerBarrier, SequenceBarrier, WaitStrategy},
    utils::DependentSequences,
};

/// Shared `wait_for` algorithm of both consumer barriers.
fn wait_for_published(barrier: &dyn ConsumerBarrier, sequence: Sequence) -> Result<Sequence> {
    barrier.check_alert()?;

    let producer = barrier.producer_barrier();
    let available = barrier
        .wait_strategy()
        .wait_for(sequence, producer.as_ref(), barrier)?;

    // Nothing tracked means the strategy saw i64::MAX; never report past what was reserved.
    let available = available.min(producer.sequence().get());
    if available < sequence {
        return Ok(available);
    }
    Ok(producer.highest_published_sequence(sequence, available))
}

pub(crate) fn claim_once(claimed: &AtomicBool, what: &str) {
    if claimed
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        panic!("{what} has already been claimed");
    }
}

/// Barrier for exactly one consumer thread.
///
/// The consumer owns the barrier's sequence: after handling every event up to `n` it calls
/// `barrier.sequence().set(n)`, which releases those slots to the producer and to any
/// downstream barrier tracking this one.
pub struct SingleConsumerBarrier {
    sequence: Arc<AtomicSequence>,
    dependents: DependentSequences,
    producer: Arc<dyn ProducerBarrier>,
    wait_strategy: Arc<dyn WaitStrategy>,
    alerted: CachePadded<AtomicBool>,
    claimed: AtomicBool,
}

impl SingleConsumerBarrier {
    pub fn new(
        producer: Arc<dyn ProducerBarrier>,
        wait_strategy: Arc<dyn WaitStrategy>,
        tracked: Vec<Arc<AtomicSequence>>,
    ) -> Self {
        Self {
            sequence: Arc::new(AtomicSequence::default()),
            dependents: DependentSequences::new(tracked),
            producer,
            wait_strategy,
            alerted: CachePadded::new(AtomicBool::new(false)),
            claimed: AtomicBool::new(false),
        }
    }
}

impl SequenceBarrier for SingleConsumerBarrier {
    fn sequence(&self) -> &Arc<AtomicSequence> {
        &self.sequence
    }

    fn dependents(&self) -> &DependentSequences {
        &self.dependents
    }

    fn claim(&self, sequence: Sequence) {
        claim_once(&self.claimed, "SingleConsumerBarrier");
        self.sequence.set(sequence);
    }
}

impl ConsumerBarrier for SingleConsumerBarrier {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier> {
        &self.producer
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }

    fn wait_for(&self, sequence: Sequence) -> Result<Sequence> {
        wait_for_published(self, sequence)
    }

    fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    fn alert(&self) {
        if !self.alerted.swap(true, Ordering::AcqRel) {
            tracing::debug!(sequence = self.sequence.get(), "consumer barrier alerted");
        }
        self.producer.signal_all_when_blocking();
    }

    fn clear_alert(&self) {
        if self.alerted.swap(false, Ordering::AcqRel) {
            tracing::debug!(sequence = self.sequence.get(), "consumer barrier alert cleared");
        }
    }
}

/// Barrier shared by a pool of worker threads.
///
/// Each worker has its own sequence and the barrier's group sequence, the one the producer
/// and downstream barriers see, is the minimum over all workers. Workers either report
/// progress directly with [`set_worker_sequence`](Self::set_worker_sequence), or split the
/// stream among themselves with [`claim_work`](Self::claim_work) so that every sequence is
/// handled by exactly one worker.
pub struct MultiConsumerBarrier {
    sequence: Arc<AtomicSequence>,
    workers: Box<[AtomicSequence]>,
    work_sequence: AtomicSequence,
    dependents: DependentSequences,
    producer: Arc<dyn ProducerBarrier>,
    wait_strategy: Arc<dyn WaitStrategy>,
    alerted: CachePadded<AtomicBool>,
    claimed: AtomicBool,
}

impl MultiConsumerBarrier {
    /// # Panics
    /// If `worker_count` is zero.
    pub fn new(
        producer: Arc<dyn ProducerBarrier>,
        wait_strategy: Arc<dyn WaitStrategy>,
        tracked: Vec<Arc<AtomicSequence>>,
        worker_count: usize,
    ) -> Self {
        assert!(worker_count > 0, "worker_count must be at least 1");
        Self {
            sequence: Arc::new(AtomicSequence::default()),
            workers: (0..worker_count).map(|_| AtomicSequence::default()).collect(),
            work_sequence: AtomicSequence::default(),
            dependents: DependentSequences::new(tracked),
            producer,
            wait_strategy,
            alerted: CachePadded::new(AtomicBool::new(false)),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn worker_sequence(&self, worker: usize) -> &AtomicSequence {
        &self.workers[worker]
    }

    /// Record that `worker` has handled everything it is responsible for up to `sequence`.
    pub fn set_worker_sequence(&self, worker: usize, sequence: Sequence) {
        self.workers[worker].set(sequence);
        self.update_group_sequence();
    }

    /// Claim the next sequence for `worker` from the shared work sequence.
    ///
    /// Before the claim is taken the worker's own sequence is moved to one below it, meaning
    /// "everything before my next claim is done as far as I am concerned". The worker then
    /// waits for the returned sequence with [`wait_for`](ConsumerBarrier::wait_for).
    pub fn claim_work(&self, worker: usize) -> Sequence {
        loop {
            let current = self.work_sequence.get();
            self.workers[worker].set(current);
            if self.work_sequence.compare_and_set(current, current + 1) {
                self.update_group_sequence();
                return current + 1;
            }
        }
    }

    /// Recompute the group sequence from the workers. The group sequence only moves forward.
    pub fn update_group_sequence(&self) -> Sequence {
        let minimum = self
            .workers
            .iter()
            .map(AtomicSequence::get)
            .min()
            .unwrap_or(INITIAL_SEQUENCE);
        self.sequence.set_max(minimum)
    }
}

impl SequenceBarrier for MultiConsumerBarrier {
    fn sequence(&self) -> &Arc<AtomicSequence> {
        &self.sequence
    }

    fn dependents(&self) -> &DependentSequences {
        &self.dependents
    }

    fn claim(&self, sequence: Sequence) {
        claim_once(&self.claimed, "MultiConsumerBarrier");
        for worker in self.workers.iter() {
            worker.set(sequence);
        }
        self.work_sequence.set(sequence);
        self.sequence.set(sequence);
    }
}

impl ConsumerBarrier for MultiConsumerBarrier {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier> {
        &self.producer
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }

    fn wait_for(&self, sequence: Sequence) -> Result<Sequence> {
        wait_for_published(self, sequence)
    }

    fn is_alerted(&self) -> bool {
        self.alerted.load(Ordering::Acquire)
    }

    fn alert(&self) {
        if !self.alerted.swap(true, Ordering::AcqRel) {
            tracing::debug!(
                sequence = self.sequence.get(),
                workers = self.workers.len(),
                "multi-consumer barrier alerted"
            );
        }
        self.producer.signal_all_when_blocking();
    }

    fn clear_alert(&self) {
        if self.alerted.swap(false, Ordering::AcqRel) {
            tracing::debug!(
                sequence = self.sequence.get(),
                workers = self.workers.len(),
                "multi-consumer barrier alert cleared"
            );
        }
    }
}

impl std::fmt::Debug for SingleConsumerBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleConsumerBarrier")
            .field("sequence", &self.sequence.get())
            .field("dependents", &self.dependents)
            .field("alerted", &self.is_alerted())
            .finish()
    }
}

impl std::fmt::Debug for MultiConsumerBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiConsumerBarrier")
            .field("sequence", &self.sequence.get())
            .field("workers", &self.workers.len())
            .field("dependents", &self.dependents)
            .field("alerted", &self.is_alerted())
            .finish()
    }
}
