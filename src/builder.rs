use std::sync::Arc;

use tracing::debug;

use crate::{
    error::Result,
    event_sequencer::{MpUnboundedEventSequencer, RingBufferEventSequencer},
    invalid_argument,
    ringbuffer::RingBuffer,
    sequencer::{MultiProducerSequencer, SingleProducerSequencer, DEFAULT_PRODUCER_SPIN_ITERATIONS},
    traits::{ProducerBarrier, WaitStrategy},
    unbounded::MpUnboundedBuffer,
    unbounded_sequencer::MpUnboundedBufferSequencer,
    utils::Utils,
    waiting::{
        BlockingWaitStrategy, BusySpinWaitStrategy, SleepingWaitStrategy, YieldingWaitStrategy,
    },
};

pub const DEFAULT_BUFFER_LENGTH: usize = 1024;
pub const DEFAULT_CHUNK_LENGTH: usize = 1024;
pub const DEFAULT_MAX_POOLED_CHUNKS: usize = 8;

/// # Sequencer Builder Guide
///
/// Both builders are plain values: every option has a default, setters can be called in
/// any order, and everything is validated once in `build()`.
///
/// ## Example Usage
/// ```rust
/// use sequencer_rs::{ProducerType, RingBufferEventSequencer, Sequencer};
///
/// let sequencer = RingBufferEventSequencer::builder(|| 0u64)
///     .producer_type(ProducerType::Multi)
///     .buffer_length(4096)
///     .with_yielding_wait_strategy()
///     .producer_spin_iterations(64)
///     .build()
///     .unwrap();
/// assert_eq!(sequencer.capacity(), 4096);
/// ```
///
/// ## Blocking consumers
/// [`BlockingWaitStrategy`] parks consumers on the producer's blocker, so the blocker has to
/// be enabled; [`with_blocking_wait_strategy`](RingBufferEventSequencerBuilder::with_blocking_wait_strategy)
/// does both. Passing a blocking strategy through `wait_strategy` without
/// `enable_blocker(true)` is rejected at build time.
///
/// ```rust
/// use sequencer_rs::{BlockingWaitStrategy, MpUnboundedEventSequencer, SequencerError};
/// use std::sync::Arc;
///
/// let result = MpUnboundedEventSequencer::builder(String::new)
///     .wait_strategy(Arc::new(BlockingWaitStrategy::new()))
///     .build();
/// assert!(matches!(result, Err(SequencerError::InvalidArgument { .. })));
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProducerType {
    #[default]
    Single,
    Multi,
}

/// Options shared by both builders.
struct SequencerOptions {
    wait_strategy: Option<Arc<dyn WaitStrategy>>,
    producer_spin_iterations: u32,
    enable_blocker: bool,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            wait_strategy: None,
            producer_spin_iterations: DEFAULT_PRODUCER_SPIN_ITERATIONS,
            enable_blocker: false,
        }
    }
}

impl SequencerOptions {
    fn wait_strategy(&self) -> Result<Arc<dyn WaitStrategy>> {
        let wait_strategy = self
            .wait_strategy
            .clone()
            .unwrap_or_else(|| Arc::new(SleepingWaitStrategy::default()));
        if wait_strategy.requires_blocker() && !self.enable_blocker {
            return Err(invalid_argument!(
                "{wait_strategy:?} requires the blocker to be enabled"
            ));
        }
        Ok(wait_strategy)
    }
}

macro_rules! wait_strategy_setters {
    () => {
        pub fn wait_strategy(mut self, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
            self.options.wait_strategy = Some(wait_strategy);
            self
        }

        pub fn with_busy_spin_wait_strategy(self) -> Self {
            self.wait_strategy(Arc::new(BusySpinWaitStrategy::new()))
        }

        pub fn with_yielding_wait_strategy(self) -> Self {
            self.wait_strategy(Arc::new(YieldingWaitStrategy::default()))
        }

        pub fn with_sleeping_wait_strategy(self) -> Self {
            self.wait_strategy(Arc::new(SleepingWaitStrategy::default()))
        }

        /// Use [`BlockingWaitStrategy`] and enable the blocker it parks on.
        pub fn with_blocking_wait_strategy(self) -> Self {
            self.wait_strategy(Arc::new(BlockingWaitStrategy::new()))
                .enable_blocker(true)
        }

        pub fn producer_spin_iterations(mut self, spin_iterations: u32) -> Self {
            self.options.producer_spin_iterations = spin_iterations;
            self
        }

        pub fn enable_blocker(mut self, enable: bool) -> Self {
            self.options.enable_blocker = enable;
            self
        }
    };
}

/// Builder for [`RingBufferEventSequencer`].
pub struct RingBufferEventSequencerBuilder<T> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    producer_type: ProducerType,
    buffer_length: usize,
    options: SequencerOptions,
}

impl<T: Send + Sync + 'static> RingBufferEventSequencerBuilder<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            producer_type: ProducerType::default(),
            buffer_length: DEFAULT_BUFFER_LENGTH,
            options: SequencerOptions::default(),
        }
    }

    pub fn producer_type(mut self, producer_type: ProducerType) -> Self {
        self.producer_type = producer_type;
        self
    }

    pub fn single_producer(self) -> Self {
        self.producer_type(ProducerType::Single)
    }

    pub fn multi_producer(self) -> Self {
        self.producer_type(ProducerType::Multi)
    }

    /// Number of slots. Must be a power of 2.
    pub fn buffer_length(mut self, buffer_length: usize) -> Self {
        self.buffer_length = buffer_length;
        self
    }

    wait_strategy_setters!();

    pub fn build(self) -> Result<RingBufferEventSequencer<T>> {
        if !Utils::is_power_of_two(self.buffer_length) {
            return Err(invalid_argument!(
                "buffer_length must be a power of 2, got {}",
                self.buffer_length
            ));
        }
        let wait_strategy = self.options.wait_strategy()?;
        let spin_iterations = self.options.producer_spin_iterations;

        let producer_barrier: Arc<dyn ProducerBarrier> = match self.producer_type {
            ProducerType::Single => {
                let mut sequencer = SingleProducerSequencer::new(self.buffer_length)
                    .with_producer_spin_iterations(spin_iterations);
                if self.options.enable_blocker {
                    sequencer = sequencer.with_blocker();
                }
                Arc::new(sequencer)
            }
            ProducerType::Multi => {
                let mut sequencer = MultiProducerSequencer::new(self.buffer_length)
                    .with_producer_spin_iterations(spin_iterations);
                if self.options.enable_blocker {
                    sequencer = sequencer.with_blocker();
                }
                Arc::new(sequencer)
            }
        };

        debug!(
            capacity = self.buffer_length,
            producer_type = ?self.producer_type,
            wait_strategy = ?wait_strategy,
            blocker = self.options.enable_blocker,
            "built ring buffer event sequencer"
        );

        Ok(RingBufferEventSequencer::new(
            RingBuffer::new(self.buffer_length, self.factory),
            producer_barrier,
            wait_strategy,
            self.producer_type,
        ))
    }
}

/// Builder for [`MpUnboundedEventSequencer`].
pub struct MpUnboundedEventSequencerBuilder<T> {
    factory: Box<dyn Fn() -> T + Send + Sync>,
    chunk_length: usize,
    max_pooled_chunks: usize,
    options: SequencerOptions,
}

impl<T: Send + Sync + 'static> MpUnboundedEventSequencerBuilder<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            chunk_length: DEFAULT_CHUNK_LENGTH,
            max_pooled_chunks: DEFAULT_MAX_POOLED_CHUNKS,
            options: SequencerOptions::default(),
        }
    }

    /// Slots per chunk. Also the largest batch a single reservation may ask for.
    pub fn chunk_length(mut self, chunk_length: usize) -> Self {
        self.chunk_length = chunk_length;
        self
    }

    /// Spare chunks kept linked ahead of the producer instead of being freed.
    pub fn max_pooled_chunks(mut self, max_pooled_chunks: usize) -> Self {
        self.max_pooled_chunks = max_pooled_chunks;
        self
    }

    wait_strategy_setters!();

    pub fn build(self) -> Result<MpUnboundedEventSequencer<T>> {
        if self.chunk_length == 0 {
            return Err(invalid_argument!("chunk_length must be positive"));
        }
        let wait_strategy = self.options.wait_strategy()?;

        let buffer = Arc::new(MpUnboundedBuffer::new(
            self.chunk_length,
            self.max_pooled_chunks,
            self.factory,
        ));
        let mut sequencer = MpUnboundedBufferSequencer::new(buffer.clone())
            .with_producer_spin_iterations(self.options.producer_spin_iterations);
        if self.options.enable_blocker {
            sequencer = sequencer.with_blocker();
        }

        debug!(
            chunk_length = self.chunk_length,
            max_pooled_chunks = self.max_pooled_chunks,
            wait_strategy = ?wait_strategy,
            blocker = self.options.enable_blocker,
            "built unbounded event sequencer"
        );

        Ok(MpUnboundedEventSequencer::new(
            buffer,
            Arc::new(sequencer),
            wait_strategy,
        ))
    }
}
