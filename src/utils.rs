use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::sequence::{AtomicSequence, Sequence};

pub struct Utils;

impl Utils {
    /// Minimum over `sequences`, or `default` when the slice is empty.
    pub fn get_minimum_sequence(sequences: &[Arc<AtomicSequence>], default: Sequence) -> Sequence {
        sequences
            .iter()
            .map(|s| s.get())
            .fold(default, Sequence::min)
    }

    pub const fn is_power_of_two(x: usize) -> bool {
        x != 0 && (x & (x - 1)) == 0
    }
}

/// The set of sequences a barrier must not outrun.
///
/// Reads happen on every wait-loop iteration, writes only when the barrier graph is
/// reconfigured, so the set is an immutable `Vec` behind an [`ArcSwap`]. Writers build a new
/// vector from the one they loaded and compare-and-swap it in, retrying if another writer got
/// there first. Readers never block and writers never block each other.
pub struct DependentSequences {
    sequences: ArcSwap<Vec<Arc<AtomicSequence>>>,
}

impl DependentSequences {
    pub fn new(initial: Vec<Arc<AtomicSequence>>) -> Self {
        Self {
            sequences: ArcSwap::from_pointee(initial),
        }
    }

    /// Minimum of the tracked sequences, `i64::MAX` when nothing is tracked.
    #[inline]
    pub fn minimum(&self) -> Sequence {
        Utils::get_minimum_sequence(&self.sequences.load(), Sequence::MAX)
    }

    /// Minimum of the tracked sequences, capped at `cap`.
    #[inline]
    pub fn minimum_or(&self, cap: Sequence) -> Sequence {
        Utils::get_minimum_sequence(&self.sequences.load(), cap)
    }

    pub fn len(&self) -> usize {
        self.sequences.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, sequence: &Arc<AtomicSequence>) -> bool {
        self.sequences
            .load()
            .iter()
            .any(|s| Arc::ptr_eq(s, sequence))
    }

    /// Append `added` to the set.
    pub fn add(&self, added: &[Arc<AtomicSequence>]) {
        if added.is_empty() {
            return;
        }
        loop {
            let current = self.sequences.load_full();
            let mut updated = Vec::with_capacity(current.len() + added.len());
            updated.extend(current.iter().cloned());
            updated.extend(added.iter().cloned());

            let previous = self.sequences.compare_and_swap(&current, Arc::new(updated));
            if Arc::ptr_eq(&*previous, &current) {
                return;
            }
        }
    }

    /// Remove every occurrence of `sequence`. Returns false if it was not tracked.
    pub fn remove(&self, sequence: &Arc<AtomicSequence>) -> bool {
        loop {
            let current = self.sequences.load_full();
            if !current.iter().any(|s| Arc::ptr_eq(s, sequence)) {
                return false;
            }
            let updated: Vec<_> = current
                .iter()
                .filter(|s| !Arc::ptr_eq(s, sequence))
                .cloned()
                .collect();

            let previous = self.sequences.compare_and_swap(&current, Arc::new(updated));
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
        }
    }
}

impl std::fmt::Debug for DependentSequences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values: Vec<Sequence> = self.sequences.load().iter().map(|s| s.get()).collect();
        f.debug_struct("DependentSequences")
            .field("sequences", &values)
            .finish()
    }
}

/// Back-off used by producers waiting for consumers to free capacity: spin a configured number
/// of times, then park for the shortest interval the OS allows.
pub(crate) struct ProducerBackoff {
    spin_iterations: u32,
    counter: u32,
}

impl ProducerBackoff {
    pub(crate) fn new(spin_iterations: u32) -> Self {
        Self {
            spin_iterations,
            counter: 0,
        }
    }

    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.counter < self.spin_iterations {
            self.counter += 1;
            std::hint::spin_loop();
        } else {
            std::thread::sleep(Duration::from_nanos(1));
        }
    }
}
