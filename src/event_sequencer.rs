//! Sequencers that own their storage.
//!
//! An event sequencer is a [`DataProvider`] and a [`Sequencer`] in one value: producers
//! reserve, fill and publish through it, and consumers read slots from it after waiting on
//! a barrier it created.

use std::sync::Arc;

use crate::builder::{
    MpUnboundedEventSequencerBuilder, ProducerType, RingBufferEventSequencerBuilder,
};
use crate::ringbuffer::RingBuffer;
use crate::sequence::Sequence;
use crate::traits::{
    DataProvider, EventSequencer, ProducerBarrier, SequenceBarrier, Sequencer, WaitStrategy,
};
use crate::unbounded::MpUnboundedBuffer;

/// A fixed-capacity [`RingBuffer`] driven by a single- or multi-producer sequencer.
pub struct RingBufferEventSequencer<T> {
    ring_buffer: RingBuffer<T>,
    producer_barrier: Arc<dyn ProducerBarrier>,
    wait_strategy: Arc<dyn WaitStrategy>,
    producer_type: ProducerType,
}

impl<T: Send + Sync + 'static> RingBufferEventSequencer<T> {
    pub fn builder<F>(factory: F) -> RingBufferEventSequencerBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        RingBufferEventSequencerBuilder::new(factory)
    }

    pub(crate) fn new(
        ring_buffer: RingBuffer<T>,
        producer_barrier: Arc<dyn ProducerBarrier>,
        wait_strategy: Arc<dyn WaitStrategy>,
        producer_type: ProducerType,
    ) -> Self {
        Self {
            ring_buffer,
            producer_barrier,
            wait_strategy,
            producer_type,
        }
    }

    pub fn producer_type(&self) -> ProducerType {
        self.producer_type
    }

    pub fn ring_buffer(&self) -> &RingBuffer<T> {
        &self.ring_buffer
    }
}

impl<T: Send + Sync> DataProvider<T> for RingBufferEventSequencer<T> {
    #[inline]
    unsafe fn get(&self, sequence: Sequence) -> &T {
        self.ring_buffer.get(sequence)
    }

    #[inline]
    unsafe fn get_mut(&self, sequence: Sequence) -> &mut T {
        self.ring_buffer.get_mut(sequence)
    }
}

impl<T: Send + Sync> Sequencer for RingBufferEventSequencer<T> {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier> {
        &self.producer_barrier
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }
}

impl<T: Send + Sync> EventSequencer<T> for RingBufferEventSequencer<T> {}

impl<T> std::fmt::Debug for RingBufferEventSequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBufferEventSequencer")
            .field("capacity", &self.ring_buffer.get_capacity())
            .field("producer_type", &self.producer_type)
            .field("cursor", &self.producer_barrier.sequence().get())
            .field("wait_strategy", &self.wait_strategy)
            .finish()
    }
}

/// A logically unbounded [`MpUnboundedBuffer`] driven by its own multi-producer sequencer.
pub struct MpUnboundedEventSequencer<T> {
    buffer: Arc<MpUnboundedBuffer<T>>,
    producer_barrier: Arc<dyn ProducerBarrier>,
    wait_strategy: Arc<dyn WaitStrategy>,
}

impl<T: Send + Sync + 'static> MpUnboundedEventSequencer<T> {
    pub fn builder<F>(factory: F) -> MpUnboundedEventSequencerBuilder<T>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        MpUnboundedEventSequencerBuilder::new(factory)
    }

    pub(crate) fn new(
        buffer: Arc<MpUnboundedBuffer<T>>,
        producer_barrier: Arc<dyn ProducerBarrier>,
        wait_strategy: Arc<dyn WaitStrategy>,
    ) -> Self {
        Self {
            buffer,
            producer_barrier,
            wait_strategy,
        }
    }

    pub fn buffer(&self) -> &MpUnboundedBuffer<T> {
        &self.buffer
    }
}

impl<T: Send + Sync> DataProvider<T> for MpUnboundedEventSequencer<T> {
    unsafe fn get(&self, sequence: Sequence) -> &T {
        self.buffer.get(sequence)
    }

    unsafe fn get_mut(&self, sequence: Sequence) -> &mut T {
        self.buffer.get_mut(sequence)
    }

    unsafe fn producer_get(&self, sequence: Sequence) -> &T {
        self.buffer.producer_get(sequence)
    }

    unsafe fn producer_get_mut(&self, sequence: Sequence) -> &mut T {
        self.buffer.producer_get_mut(sequence)
    }

    unsafe fn consumer_get(&self, sequence: Sequence) -> &T {
        self.buffer.consumer_get(sequence)
    }

    unsafe fn consumer_get_mut(&self, sequence: Sequence) -> &mut T {
        self.buffer.consumer_get_mut(sequence)
    }
}

impl<T: Send + Sync> Sequencer for MpUnboundedEventSequencer<T> {
    fn producer_barrier(&self) -> &Arc<dyn ProducerBarrier> {
        &self.producer_barrier
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait_strategy
    }
}

impl<T: Send + Sync> EventSequencer<T> for MpUnboundedEventSequencer<T> {}

impl<T> std::fmt::Debug for MpUnboundedEventSequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpUnboundedEventSequencer")
            .field("buffer", &self.buffer)
            .field("cursor", &self.producer_barrier.sequence().get())
            .field("wait_strategy", &self.wait_strategy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SequencerError;
    use crate::traits::ConsumerBarrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_write_then_read() {
        let sequencer = RingBufferEventSequencer::builder(String::new)
            .buffer_length(8)
            .build()
            .unwrap();
        let consumer = sequencer.new_single_consumer_barrier(&[]);
        sequencer.add_gating_barriers(&[&consumer]);

        let high = sequencer
            .write(3, |slot, sequence| *slot = format!("event-{sequence}"))
            .unwrap();
        assert_eq!(high, 2);
        assert_eq!(consumer.wait_for(0), Ok(2));
        for sequence in 0..=2 {
            assert_eq!(
                unsafe { sequencer.consumer_get(sequence) },
                &format!("event-{sequence}")
            );
        }
        consumer.sequence().set(2);
        assert_eq!(sequencer.remaining_capacity(), 8);
    }

    #[test]
    fn test_forwards_producer_operations() {
        let sequencer = RingBufferEventSequencer::builder(|| 0u32)
            .multi_producer()
            .buffer_length(4)
            .build()
            .unwrap();
        assert_eq!(sequencer.producer_type(), ProducerType::Multi);
        assert_eq!(sequencer.capacity(), 4);
        assert_eq!(sequencer.cursor(), -1);

        let consumer = sequencer.new_single_consumer_barrier(&[]);
        sequencer.add_gating_barriers(&[&consumer]);

        assert_eq!(sequencer.try_next_n(4), Ok(3));
        assert!(!sequencer.has_available_capacity(1));
        assert_eq!(sequencer.try_next(), Err(SequencerError::InsufficientCapacity));
        assert_eq!(
            sequencer.try_next_timeout(1, Duration::from_millis(5)),
            Err(SequencerError::Timeout)
        );
        assert_eq!(
            sequencer.next_interruptibly(1, &|| true),
            Err(SequencerError::Interrupted)
        );
        sequencer.publish_range(0, 3);
        assert_eq!(consumer.wait_for(0), Ok(3));
    }

    #[test]
    fn test_removing_last_gating_barrier_unblocks_producer() {
        let sequencer = Arc::new(
            RingBufferEventSequencer::builder(|| 0u64)
                .buffer_length(4)
                .build()
                .unwrap(),
        );
        let consumer = sequencer.new_single_consumer_barrier(&[]);
        sequencer.add_gating_barriers(&[&consumer]);
        sequencer.write(4, |slot, sequence| *slot = sequence as u64).unwrap();

        let producer = {
            let sequencer = sequencer.clone();
            thread::spawn(move || sequencer.write_one(|slot, _| *slot = 99))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!producer.is_finished());

        assert!(sequencer.remove_gating_barrier(&consumer));
        assert_eq!(producer.join().unwrap(), Ok(4));
        assert!(!sequencer.remove_gating_barrier(&consumer));
    }

    #[test]
    fn test_consumer_chain() {
        let sequencer = RingBufferEventSequencer::builder(|| 0i64)
            .buffer_length(16)
            .with_busy_spin_wait_strategy()
            .build()
            .unwrap();
        let first = sequencer.new_single_consumer_barrier(&[]);
        let second = sequencer.new_single_consumer_barrier(&[&first]);
        sequencer.add_gating_barriers(&[&second]);

        sequencer.write(5, |slot, sequence| *slot = sequence).unwrap();
        assert_eq!(first.wait_for(0), Ok(4));
        first.sequence().set(2);
        assert_eq!(second.dependent_sequence(), 2);
        assert_eq!(second.wait_for(1), Ok(2));
    }

    #[test]
    fn test_worker_pool_handles_each_event_once() {
        const EVENTS: i64 = 2_000;
        const WORKERS: usize = 3;

        let sequencer = Arc::new(
            RingBufferEventSequencer::builder(|| 0i64)
                .buffer_length(64)
                .build()
                .unwrap(),
        );
        let pool = Arc::new(sequencer.new_multi_consumer_barrier(WORKERS, &[]));
        sequencer.add_gating_barriers(&[&*pool]);

        let workers: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let sequencer = sequencer.clone();
                let pool = pool.clone();
                thread::spawn(move || {
                    let mut handled = Vec::new();
                    loop {
                        let sequence = pool.claim_work(worker);
                        match pool.wait_for(sequence) {
                            Ok(_) => {
                                let value = unsafe { *sequencer.consumer_get(sequence) };
                                if value < 0 {
                                    pool.set_worker_sequence(worker, sequence);
                                    return handled;
                                }
                                handled.push(value);
                            }
                            Err(SequencerError::Alert) => return handled,
                            Err(other) => panic!("unexpected {other:?}"),
                        }
                    }
                })
            })
            .collect();

        for value in 0..EVENTS {
            sequencer.write_one(|slot, _| *slot = value).unwrap();
        }
        for _ in 0..WORKERS {
            sequencer.write_one(|slot, _| *slot = -1).unwrap();
        }

        let mut all: Vec<i64> = workers
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..EVENTS).collect::<Vec<_>>());
    }

    /// Several producers write tagged values in batches while one consumer checks that every
    /// value shows up once, in each producer's own order.
    fn check_producers_visible_to_consumer<S>(sequencer: Arc<S>)
    where
        S: EventSequencer<i64> + 'static,
    {
        const PRODUCERS: i64 = 3;
        const PER_PRODUCER: i64 = 3_000;
        const BATCH: i64 = 7;

        let consumer = Arc::new(sequencer.new_single_consumer_barrier(&[]));
        sequencer.add_gating_barriers(&[&*consumer]);

        let reader = {
            let sequencer = sequencer.clone();
            let consumer = consumer.clone();
            thread::spawn(move || {
                let mut last_seen = vec![-1i64; PRODUCERS as usize];
                let mut next = 0;
                while next < PRODUCERS * PER_PRODUCER {
                    let available = consumer.wait_for(next).unwrap();
                    for sequence in next..=available {
                        let value = unsafe { *sequencer.consumer_get(sequence) };
                        let producer = (value / PER_PRODUCER) as usize;
                        let count = value % PER_PRODUCER;
                        assert_eq!(count, last_seen[producer] + 1, "{value} at {sequence}");
                        last_seen[producer] = count;
                    }
                    consumer.sequence().set(available);
                    next = available + 1;
                }
                last_seen
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let sequencer = sequencer.clone();
                thread::spawn(move || {
                    let mut count = 0;
                    while count < PER_PRODUCER {
                        let n = BATCH.min(PER_PRODUCER - count);
                        sequencer
                            .write(n, |slot, _| {
                                *slot = producer * PER_PRODUCER + count;
                                count += 1;
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(
            reader.join().unwrap(),
            vec![PER_PRODUCER - 1; PRODUCERS as usize]
        );
    }

    #[test]
    fn test_multi_producer_ring_publishes_to_consumer() {
        check_producers_visible_to_consumer(Arc::new(
            RingBufferEventSequencer::builder(|| -1i64)
                .multi_producer()
                .buffer_length(64)
                .with_yielding_wait_strategy()
                .build()
                .unwrap(),
        ));
    }

    #[test]
    fn test_unbounded_publishes_to_consumer() {
        check_producers_visible_to_consumer(Arc::new(
            MpUnboundedEventSequencer::builder(|| -1i64)
                .chunk_length(16)
                .max_pooled_chunks(2)
                .with_yielding_wait_strategy()
                .build()
                .unwrap(),
        ));
    }

    #[test]
    fn test_unbounded_write_then_read() {
        let sequencer = MpUnboundedEventSequencer::builder(|| 0i64)
            .chunk_length(4)
            .max_pooled_chunks(1)
            .build()
            .unwrap();
        assert_eq!(sequencer.capacity(), -1);
        let consumer = sequencer.new_single_consumer_barrier(&[]);
        sequencer.add_gating_barriers(&[&consumer]);

        let mut next = 0;
        for _ in 0..10 {
            let high = sequencer.write(3, |slot, sequence| *slot = sequence * 2).unwrap();
            let available = consumer.wait_for(next).unwrap();
            assert_eq!(available, high);
            for sequence in next..=available {
                assert_eq!(unsafe { *sequencer.consumer_get(sequence) }, sequence * 2);
            }
            consumer.sequence().set(available);
            next = available + 1;
        }
        assert!(sequencer.buffer().head_chunk_index() > 0);
        assert!(sequencer.buffer().pooled_chunk_count() <= 1);
    }
}
