//! Waiting strategies for consumers in the sequencing engine.
//!
//! # Purpose of Waiting Strategies
//!
//! A consumer that asks for a sequence its dependencies have not reached yet has to pass
//! the time somehow. The choice of waiting strategy represents a trade-off between:
//! - Latency (how quickly threads respond to new data)
//! - CPU usage (how efficiently threads wait)
//! - Thread context switching
//!
//! Every strategy re-checks the consumer's alert flag on every loop iteration, so an
//! [`alert`](crate::ConsumerBarrier::alert) is noticed within one iteration of the strategy
//! itself.
//!
//! # Available Strategies
//!
//! | Strategy | Latency | CPU | Notes |
//! |---|---|---|---|
//! | [`BusySpinWaitStrategy`] | lowest | 100% of a core | pin one core per waiting thread |
//! | [`YieldingWaitStrategy`] | low | high | spins, then yields |
//! | [`SleepingWaitStrategy`] | medium | low | spins, yields, then sleeps 1ms per round |
//! | [`TimeoutSleepingWaitStrategy`] | medium | low | as sleeping, but gives up at a deadline |
//! | [`BlockingWaitStrategy`] | highest | lowest | parks on the producer's blocker |
//!
//! ## Choosing a Strategy
//!
//! Selection criteria should consider:
//! 1. Latency requirements
//! 2. Available CPU resources
//! 3. Whether the consumer thread has other periodic duties (timers, housekeeping); if so
//!    [`TimeoutSleepingWaitStrategy`] lets it break out regularly even with no new data

use std::thread;
use std::time::{Duration, Instant};

use crate::{
    error::{Result, SequencerError},
    sequence::Sequence,
    traits::{ConsumerBarrier, ProducerBarrier, WaitStrategy},
};

const DEFAULT_SPIN_TRIES: u32 = 100;
const DEFAULT_YIELD_TRIES: u32 = 100;
const DEFAULT_SLEEP: Duration = Duration::from_millis(1);

/// Highest performance waiting strategy that continuously polls for updates.
///
/// Only appropriate when each waiting thread has a core of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    pub fn new() -> Self {
        BusySpinWaitStrategy
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        _producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence> {
        loop {
            let available = consumer.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            consumer.check_alert()?;
            std::hint::spin_loop();
        }
    }
}

/// Spins for a while, then yields the thread on every further iteration.
#[derive(Debug, Clone, Copy)]
pub struct YieldingWaitStrategy {
    spin_tries: u32,
}

impl YieldingWaitStrategy {
    pub fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWaitStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_TRIES)
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        _producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence> {
        let mut counter = self.spin_tries;
        loop {
            let available = consumer.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            consumer.check_alert()?;

            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }
    }
}

/// Three-stage strategy: spin, then yield, then sleep a fixed interval per iteration.
#[derive(Debug, Clone, Copy)]
pub struct SleepingWaitStrategy {
    spin_tries: u32,
    yield_tries: u32,
    sleep: Duration,
}

impl SleepingWaitStrategy {
    pub fn new(spin_tries: u32, yield_tries: u32, sleep: Duration) -> Self {
        Self {
            spin_tries,
            yield_tries,
            sleep,
        }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new(DEFAULT_SPIN_TRIES, DEFAULT_YIELD_TRIES, DEFAULT_SLEEP)
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        _producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence> {
        let mut stage = StagedBackoff::new(self.spin_tries, self.yield_tries, self.sleep);
        loop {
            let available = consumer.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            consumer.check_alert()?;
            stage.snooze();
        }
    }
}

/// [`SleepingWaitStrategy`] with a deadline.
///
/// Raises [`SequencerError::Timeout`] once `timeout` has elapsed since the wait began. A
/// consumer thread uses this to break out periodically and run other duties.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSleepingWaitStrategy {
    timeout: Duration,
    spin_tries: u32,
    yield_tries: u32,
    sleep: Duration,
}

impl TimeoutSleepingWaitStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            spin_tries: DEFAULT_SPIN_TRIES,
            yield_tries: DEFAULT_YIELD_TRIES,
            sleep: DEFAULT_SLEEP,
        }
    }

    pub fn with_tries(timeout: Duration, spin_tries: u32, yield_tries: u32, sleep: Duration) -> Self {
        Self {
            timeout,
            spin_tries,
            yield_tries,
            sleep,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl WaitStrategy for TimeoutSleepingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        _producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence> {
        let deadline = Instant::now().checked_add(self.timeout);
        let mut stage = StagedBackoff::new(self.spin_tries, self.yield_tries, self.sleep);
        loop {
            let available = consumer.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            consumer.check_alert()?;

            // The clock is only read once spinning is over.
            if !stage.is_spinning() && deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(SequencerError::Timeout);
            }
            stage.snooze();
        }
    }
}

/// Parks on the producer's [`SequenceBlocker`](crate::SequenceBlocker) until the producer
/// cursor reaches the requested sequence.
///
/// Upstream consumers are not condition-waited: once the producer is far enough ahead, the
/// remaining gap to the tracked barriers is polled with a short spin followed by 1ms sleeps.
/// Requires the sequencer to be built with a blocker.
#[derive(Debug, Clone, Copy)]
pub struct BlockingWaitStrategy {
    spin_tries: u32,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self {
            spin_tries: DEFAULT_SPIN_TRIES,
        }
    }
}

impl Default for BlockingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(
        &self,
        sequence: Sequence,
        producer: &dyn ProducerBarrier,
        consumer: &dyn ConsumerBarrier,
    ) -> Result<Sequence> {
        if producer.sequence().get() < sequence {
            let blocker = producer.blocker().ok_or_else(|| {
                SequencerError::invalid_argument(
                    "BlockingWaitStrategy requires a sequencer built with a blocker",
                )
            })?;
            let mut guard = blocker.lock();
            while producer.sequence().get() < sequence {
                consumer.check_alert()?;
                blocker.wait(&mut guard);
            }
        }

        let mut counter = self.spin_tries;
        loop {
            let available = consumer.dependent_sequence();
            if available >= sequence {
                return Ok(available);
            }
            consumer.check_alert()?;

            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                thread::sleep(DEFAULT_SLEEP);
            }
        }
    }

    fn requires_blocker(&self) -> bool {
        true
    }
}

/// Spin, then yield, then sleep.
struct StagedBackoff {
    counter: u32,
    yield_tries: u32,
    sleep: Duration,
}

impl StagedBackoff {
    fn new(spin_tries: u32, yield_tries: u32, sleep: Duration) -> Self {
        Self {
            counter: spin_tries.saturating_add(yield_tries),
            yield_tries,
            sleep,
        }
    }

    #[inline]
    fn is_spinning(&self) -> bool {
        self.counter > self.yield_tries
    }

    #[inline]
    fn snooze(&mut self) {
        if self.counter > self.yield_tries {
            self.counter -= 1;
            std::hint::spin_loop();
        } else if self.counter > 0 {
            self.counter -= 1;
            thread::yield_now();
        } else {
            thread::sleep(self.sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barrier::SingleConsumerBarrier;
    use crate::sequencer::SingleProducerSequencer;
    use crate::traits::SequenceBarrier;
    use std::sync::Arc;

    fn setup(
        strategy: Arc<dyn WaitStrategy>,
        blocker: bool,
    ) -> (Arc<SingleProducerSequencer>, Arc<SingleConsumerBarrier>) {
        let mut producer = SingleProducerSequencer::new(16);
        if blocker {
            producer = producer.with_blocker();
        }
        let producer = Arc::new(producer);
        let consumer = Arc::new(SingleConsumerBarrier::new(
            producer.clone(),
            strategy,
            vec![producer.sequence().clone()],
        ));
        (producer, consumer)
    }

    fn check_strategy(strategy: Arc<dyn WaitStrategy>, blocker: bool) {
        let (producer, consumer) = setup(strategy.clone(), blocker);

        // Returns the alert signal when alerted
        consumer.alert();
        assert_eq!(
            strategy.wait_for(1, producer.as_ref(), consumer.as_ref()),
            Err(SequencerError::Alert)
        );
        consumer.clear_alert();

        // Returns sequence when available
        producer.publish(5);
        assert_eq!(
            strategy.wait_for(5, producer.as_ref(), consumer.as_ref()),
            Ok(5)
        );

        // Waits for sequence
        let publisher = {
            let producer = producer.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                producer.publish(10);
            })
        };
        assert_eq!(
            strategy.wait_for(10, producer.as_ref(), consumer.as_ref()),
            Ok(10)
        );
        publisher.join().unwrap();
    }

    #[test]
    fn test_busy_spin_wait_strategy() {
        check_strategy(Arc::new(BusySpinWaitStrategy::new()), false);
    }

    #[test]
    fn test_yielding_wait_strategy() {
        check_strategy(Arc::new(YieldingWaitStrategy::default()), false);
    }

    #[test]
    fn test_sleeping_wait_strategy() {
        check_strategy(Arc::new(SleepingWaitStrategy::default()), false);
    }

    #[test]
    fn test_timeout_sleeping_wait_strategy_returns_before_deadline() {
        check_strategy(
            Arc::new(TimeoutSleepingWaitStrategy::new(Duration::from_secs(5))),
            false,
        );
    }

    #[test]
    fn test_timeout_sleeping_wait_strategy_without_deadline() {
        check_strategy(
            Arc::new(TimeoutSleepingWaitStrategy::new(Duration::MAX)),
            false,
        );
    }

    #[test]
    fn test_blocking_wait_strategy() {
        check_strategy(Arc::new(BlockingWaitStrategy::new()), true);
    }

    #[test]
    fn test_blocking_wait_strategy_without_blocker() {
        let strategy: Arc<dyn WaitStrategy> = Arc::new(BlockingWaitStrategy::new());
        let (producer, consumer) = setup(strategy.clone(), false);
        let result = strategy.wait_for(3, producer.as_ref(), consumer.as_ref());
        assert!(matches!(result, Err(SequencerError::InvalidArgument { .. })));
    }

    #[test]
    fn test_timeout_sleeping_wait_strategy_times_out() {
        let strategy: Arc<dyn WaitStrategy> =
            Arc::new(TimeoutSleepingWaitStrategy::new(Duration::from_millis(20)));
        let (producer, consumer) = setup(strategy.clone(), false);

        let start = Instant::now();
        let result = strategy.wait_for(0, producer.as_ref(), consumer.as_ref());
        assert_eq!(result, Err(SequencerError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_multiple_dependencies() {
        let strategy: Arc<dyn WaitStrategy> = Arc::new(BusySpinWaitStrategy::new());
        let (producer, consumer) = setup(strategy.clone(), false);
        let upstream = Arc::new(crate::AtomicSequence::new(3));
        consumer.dependents().add(&[upstream.clone()]);

        producer.publish(5);

        // Should wait for minimum sequence (3)
        assert_eq!(
            strategy.wait_for(3, producer.as_ref(), consumer.as_ref()),
            Ok(3)
        );
    }

    #[test]
    fn test_requires_blocker() {
        assert!(BlockingWaitStrategy::new().requires_blocker());
        assert!(!SleepingWaitStrategy::default().requires_blocker());
        assert!(!BusySpinWaitStrategy.requires_blocker());
    }

    #[test]
    fn test_staged_backoff_progression() {
        let mut stage = StagedBackoff::new(2, 1, Duration::from_nanos(1));
        assert!(stage.is_spinning());
        stage.snooze();
        stage.snooze();
        assert!(!stage.is_spinning());
        stage.snooze();
        stage.snooze();
        assert_eq!(stage.counter, 0);
    }
}
