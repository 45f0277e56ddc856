//! Atomic sequence counters with cache line padding to prevent false sharing.
//!
//! # Cache Line Padding and False Sharing
//!
//! ## The Problem
//! Modern CPU architectures manage memory in cache lines (typically 64 bytes). When multiple
//! threads operate on variables that live in the same cache line but on different cores:
//!
//! 1. Any modification to a variable invalidates the entire cache line
//! 2. All cores must refresh their cache line copy, even if they only use unmodified variables
//! 3. This "false sharing" creates unnecessary cache coherence traffic and severely impacts performance
//!
//! ## The Solution
//! The `AtomicSequence` is laid out so that its value never shares a cache line with anything:
//! 1. A full cache line of padding sits in front of the value
//! 2. The value plus trailing padding fill a second cache line
//! 3. `#[repr(C, align(64))]` keeps the field order and the line alignment
//!
//! Padding on both sides matters because a sequence is frequently embedded next to other
//! hot fields (cursors, cached gating values) and the allocator makes no promise about what
//! sits immediately before it.
//!
//! # Memory Orderings
//! Three strengths are offered, mirroring how the sequencers use them:
//! - plain (`Relaxed`): owner-only bookkeeping
//! - `get`/`set` (`Acquire`/`Release`): the producer/consumer handoff
//! - volatile (`SeqCst` plus a full fence): when a store must be visible before a following
//!   load of *another* location, e.g. a producer publishing its cursor before re-scanning
//!   gating sequences

use std::sync::atomic::{fence, AtomicI64, Ordering};

pub type Sequence = i64;

/// Value of a sequence that has made no progress yet.
pub const INITIAL_SEQUENCE: Sequence = -1;

/// Size of a cache line on most modern CPUs (in bytes)
const CACHE_LINE_SIZE: usize = 64;
/// Padding bytes needed to fill a cache line after the atomic value
const CACHE_LINE_PADDING: usize = CACHE_LINE_SIZE - std::mem::size_of::<AtomicI64>();

/// An atomic sequence counter isolated on its own cache line.
///
/// # Memory Layout
/// ```text
/// |------------------------------|------------------------------------------|
/// |  Padding (64 bytes)          |  AtomicI64 (8 bytes) | Padding (56 bytes)|
/// |------------------------------|------------------------------------------|
/// ^                              ^                                          ^
/// Cache line start          Cache line start                         Cache line end
/// ```
///
/// # Usage
/// Sequences track every kind of progress in the engine:
/// - the producer cursor of a sequencer
/// - the group sequence of a consumer barrier
/// - each worker's progress inside a multi-consumer barrier
/// - cached gating values kept by producers
#[repr(C, align(64))]
#[derive(Debug)]
pub struct AtomicSequence {
    _lhs_padding: [u8; CACHE_LINE_SIZE],
    /// The actual sequence value, atomically accessed
    value: AtomicI64,
    _rhs_padding: [u8; CACHE_LINE_PADDING],
}

impl AtomicSequence {
    /// Create a new Sequence with an initial value.
    pub const fn new(initial_value: Sequence) -> Self {
        AtomicSequence {
            _lhs_padding: [0u8; CACHE_LINE_SIZE],
            value: AtomicI64::new(initial_value),
            _rhs_padding: [0u8; CACHE_LINE_PADDING],
        }
    }

    /// Relaxed load. Only meaningful to the sequence's owner.
    #[inline]
    pub fn get_plain(&self) -> Sequence {
        self.value.load(Ordering::Relaxed)
    }

    /// Relaxed store. Only meaningful to the sequence's owner.
    #[inline]
    pub fn set_plain(&self, new_value: Sequence) {
        self.value.store(new_value, Ordering::Relaxed);
    }

    /// Get the current value of the sequence.
    #[inline]
    pub fn get(&self) -> Sequence {
        self.value.load(Ordering::Acquire)
    }

    /// Set a new value for the sequence.
    #[inline]
    pub fn set(&self, new_value: Sequence) {
        self.value.store(new_value, Ordering::Release);
    }

    #[inline]
    pub fn get_volatile(&self) -> Sequence {
        self.value.load(Ordering::SeqCst)
    }

    /// Store followed by a full fence, so later loads of other locations cannot be
    /// reordered before it.
    #[inline]
    pub fn set_volatile(&self, new_value: Sequence) {
        self.value.store(new_value, Ordering::SeqCst);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn compare_and_set(&self, expected: Sequence, new_value: Sequence) -> bool {
        self.value
            .compare_exchange(expected, new_value, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Add `delta` and return the previous value.
    #[inline]
    pub fn get_and_add(&self, delta: Sequence) -> Sequence {
        self.value.fetch_add(delta, Ordering::AcqRel)
    }

    /// Add `delta` and return the new value.
    #[inline]
    pub fn add_and_get(&self, delta: Sequence) -> Sequence {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }

    // Increment the sequence by 1 and return the old value.
    #[inline]
    pub fn get_and_increment(&self) -> Sequence {
        self.get_and_add(1)
    }

    // Increment the sequence by 1 and return the new value.
    #[inline]
    pub fn increment_and_get(&self) -> Sequence {
        self.add_and_get(1)
    }

    /// Raise the value to `candidate` if it is larger, returning the value now stored.
    ///
    /// Used for sequences written cooperatively by several threads where the value must
    /// never move backwards.
    pub fn set_max(&self, candidate: Sequence) -> Sequence {
        self.value
            .fetch_max(candidate, Ordering::AcqRel)
            .max(candidate)
    }
}

impl Default for AtomicSequence {
    fn default() -> Self {
        Self::new(INITIAL_SEQUENCE)
    }
}

impl From<i64> for AtomicSequence {
    fn from(value: i64) -> Self {
        Self::new(value)
    }
}

impl PartialEq for AtomicSequence {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(std::mem::align_of::<AtomicSequence>(), CACHE_LINE_SIZE);
        assert_eq!(std::mem::size_of::<AtomicSequence>(), 2 * CACHE_LINE_SIZE);
    }

    #[test]
    fn test_default_is_initial() {
        assert_eq!(AtomicSequence::default().get(), INITIAL_SEQUENCE);
    }

    #[test]
    fn test_sequence() {
        let sequence = AtomicSequence::new(0);
        assert_eq!(sequence.get(), 0);
        assert_eq!(sequence.get_and_increment(), 0);
        assert_eq!(sequence.get(), 1);
        assert_eq!(sequence.increment_and_get(), 2);
        assert_eq!(sequence.get(), 2);
        sequence.set(42);
        assert_eq!(sequence.get(), 42);
        sequence.set_plain(7);
        assert_eq!(sequence.get_plain(), 7);
        sequence.set_volatile(9);
        assert_eq!(sequence.get_volatile(), 9);
    }

    #[test]
    fn test_add() {
        let sequence = AtomicSequence::default();
        assert_eq!(sequence.get_and_add(10), -1);
        assert_eq!(sequence.add_and_get(10), 19);
    }

    #[test]
    fn test_compare_and_set() {
        let sequence = AtomicSequence::new(3);
        assert!(!sequence.compare_and_set(2, 5));
        assert_eq!(sequence.get(), 3);
        assert!(sequence.compare_and_set(3, 5));
        assert_eq!(sequence.get(), 5);
    }

    #[test]
    fn test_set_max_never_moves_backwards() {
        let sequence = AtomicSequence::new(10);
        assert_eq!(sequence.set_max(4), 10);
        assert_eq!(sequence.get(), 10);
        assert_eq!(sequence.set_max(12), 12);
        assert_eq!(sequence.get(), 12);
    }

    #[test]
    fn test_sequence_concurrent() {
        let sequence = AtomicSequence::new(0);
        let mut handles = vec![];
        let sequence_arc = Arc::new(sequence);
        for _ in 0..10 {
            let sequence = sequence_arc.clone();
            let handle = std::thread::spawn(move || {
                for _ in 0..1000 {
                    sequence.get_and_increment();
                }
            });
            handles.push(handle);
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sequence_arc.get(), 10000);
    }

    #[test]
    fn test_sequence_concurrent_compare_and_set() {
        let sequence_arc = Arc::new(AtomicSequence::new(0));
        let mut handles = vec![];
        for _ in 0..4 {
            let sequence = sequence_arc.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    loop {
                        let current = sequence.get();
                        if sequence.compare_and_set(current, current + 1) {
                            break;
                        }
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(sequence_arc.get(), 4000);
    }
}
