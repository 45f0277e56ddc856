use std::cell::UnsafeCell;

use crate::{sequence::Sequence, traits::DataProvider, utils::Utils};

/// Bytes of padding kept in front of and behind the live slots.
const BUFFER_PADDING_BYTES: usize = 128;

/// A ring buffer with a fixed capacity.
/// The capacity must be a power of 2. Every slot is created once, up front, by a factory and
/// then mutated in place for the lifetime of the buffer.
/// It is assumed that anything reading from or writing to this buffer will hold its own
/// index into the buffer, so the buffer itself does not keep track of the current index.
///
/// # Layout
/// A few spare elements are allocated on each side of the live slots so that the first and
/// last slots never share a cache line with whatever the allocator put next to the array.
/// ```text
/// | pad ... pad | slot 0 | slot 1 | ... | slot N-1 | pad ... pad |
/// ```
///
/// # Types
/// - `T`: The type of elements in the buffer. `T: Send + Sync` lets slots be filled on one
///   thread and read by several others.
///
/// # Safety
/// We require interior mutability to allow for multiple readers and writers to access the
/// buffer concurrently. Exclusion comes from the sequencer, not from the buffer.
pub struct RingBuffer<T> {
    capacity: usize,
    mask: usize,
    padding: usize,
    buffer: Box<[UnsafeCell<T>]>,
}

// SAFETY: slots are only reached through `DataProvider`, whose contract hands each slot to
// one writer at a time and publishes it with release/acquire ordering.
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    /// # Panics
    /// If `capacity` is not a power of 2.
    pub fn new<F: Fn() -> T>(capacity: usize, factory: F) -> Self {
        assert!(
            Utils::is_power_of_two(capacity),
            "Capacity must be a power of 2"
        );
        let padding = Self::padding();
        let buffer = (0..capacity + 2 * padding)
            .map(|_| UnsafeCell::new(factory()))
            .collect();
        Self {
            capacity,
            mask: capacity - 1,
            padding,
            buffer,
        }
    }

    fn padding() -> usize {
        let size = std::mem::size_of::<T>();
        if size == 0 {
            0
        } else {
            BUFFER_PADDING_BYTES.div_ceil(size)
        }
    }

    pub fn get_capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn slot(&self, sequence: Sequence) -> *mut T {
        let index = (sequence as usize & self.mask) + self.padding;
        self.buffer[index].get()
    }
}

impl<T: Default> RingBuffer<T> {
    pub fn with_default(capacity: usize) -> Self {
        Self::new(capacity, T::default)
    }
}

impl<T: Send + Sync> DataProvider<T> for RingBuffer<T> {
    #[inline]
    unsafe fn get(&self, sequence: Sequence) -> &T {
        &*self.slot(sequence)
    }

    #[inline]
    unsafe fn get_mut(&self, sequence: Sequence) -> &mut T {
        &mut *self.slot(sequence)
    }
}
