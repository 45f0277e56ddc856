//! Lock-free sequencing engine in the style of the LMAX Disruptor.
//!
//! Producers reserve sequence numbers, fill the slots those sequences index into, and
//! publish them; consumers wait on barriers until the sequences they need are published by
//! the producer and processed by every upstream consumer. Storage is either a fixed-capacity
//! [`RingBuffer`] or the chunked, logically unbounded [`MpUnboundedBuffer`].
//!
//! ```rust
//! use sequencer_rs::{
//!     ConsumerBarrier, DataProvider, EventSequencer, RingBufferEventSequencer, SequenceBarrier,
//!     Sequencer,
//! };
//!
//! let sequencer = RingBufferEventSequencer::builder(|| 0u64)
//!     .buffer_length(8)
//!     .with_busy_spin_wait_strategy()
//!     .build()
//!     .unwrap();
//! let consumer = sequencer.new_single_consumer_barrier(&[]);
//! sequencer.add_gating_barriers(&[&consumer]);
//!
//! sequencer.write_one(|slot, _| *slot = 42).unwrap();
//! let available = consumer.wait_for(0).unwrap();
//! assert_eq!(unsafe { *sequencer.consumer_get(available) }, 42);
//! consumer.sequence().set(available);
//! ```

pub mod barrier;
pub mod blocker;
pub mod builder;
pub mod error;
pub mod event_sequencer;
pub mod ringbuffer;
pub mod sequence;
pub mod sequencer;
pub mod traits;
pub mod unbounded;
pub mod unbounded_sequencer;
pub mod utils;
pub mod waiting;

pub use barrier::{MultiConsumerBarrier, SingleConsumerBarrier};
pub use blocker::SequenceBlocker;
pub use builder::{
    MpUnboundedEventSequencerBuilder, ProducerType, RingBufferEventSequencerBuilder,
};
pub use error::{Result, SequencerError};
pub use event_sequencer::{MpUnboundedEventSequencer, RingBufferEventSequencer};
pub use ringbuffer::RingBuffer;
pub use sequence::{AtomicSequence, Sequence, INITIAL_SEQUENCE};
pub use sequencer::{MultiProducerSequencer, SingleProducerSequencer};
pub use traits::{
    ConsumerBarrier, DataProvider, EventSequencer, ProducerBarrier, SequenceBarrier, Sequencer,
    WaitStrategy,
};
pub use unbounded::MpUnboundedBuffer;
pub use unbounded_sequencer::MpUnboundedBufferSequencer;
pub use waiting::{
    BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy,
    TimeoutSleepingWaitStrategy, YieldingWaitStrategy,
};
