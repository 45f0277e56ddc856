//! A logically unbounded, multi-producer buffer made of linked fixed-size chunks.
//!
//! # Layout
//! ```text
//!  head                 producer              tail
//!   |                      |                   |
//! [c3] <-> [c4] <-> ... <-> [c7] <-> [c8] <-> [c9]
//!                                    \_____pooled____/
//! ```
//! Sequence `s` lives in the chunk with index `s / chunk_length`. Chunks are appended at the
//! tail when a producer runs off the end. Once every consumer has moved past a chunk and the
//! producer has left it behind, the head chunk is unlinked and either moved to the tail for
//! reuse (up to `max_pooled_chunks` spare chunks ahead of the producer) or dropped.
//!
//! # Structural locking
//! The `head`, `tail` and `producer` pointers double as locks: a thread about to change the
//! structure behind one of them CASes the pointer to the same chunk tagged with [`ROTATION`].
//! Anybody else that loads a tagged pointer spins until the owner stores a plain pointer back.
//! Lock order is `producer` then `tail`, or `head` then `tail`. Nobody waits on `producer`
//! while holding `tail`.
//!
//! Chunk memory is reclaimed through `crossbeam-epoch`, so a thread that loaded a pointer
//! under a guard can keep dereferencing it even if the chunk is unlinked meanwhile.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::{Backoff, CachePadded};
use tracing::trace;

use crate::sequence::{Sequence, INITIAL_SEQUENCE};
use crate::traits::DataProvider;

/// Pointer tag marking a structural update in progress.
const ROTATION: usize = 1;

struct Chunk<T> {
    index: AtomicI64,
    slots: Box<[UnsafeCell<T>]>,
    // Per slot, the index this chunk had when the slot was last published.
    published: Box<[AtomicI64]>,
    next: Atomic<Chunk<T>>,
    prev: Atomic<Chunk<T>>,
}

// SAFETY: slot access is coordinated by the sequencing protocol; every other field is atomic.
unsafe impl<T: Send> Send for Chunk<T> {}
unsafe impl<T: Send + Sync> Sync for Chunk<T> {}

impl<T> Chunk<T> {
    fn new(index: i64, chunk_length: usize, factory: &dyn Fn() -> T) -> Self {
        Self {
            index: AtomicI64::new(index),
            slots: (0..chunk_length)
                .map(|_| UnsafeCell::new(factory()))
                .collect(),
            published: (0..chunk_length)
                .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
                .collect(),
            next: Atomic::null(),
            prev: Atomic::null(),
        }
    }

    #[inline]
    fn index(&self) -> i64 {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    fn max_sequence(&self) -> Sequence {
        (self.index() + 1) * self.slots.len() as i64 - 1
    }

    /// Whether every slot was published under the chunk's current index.
    fn is_fully_published(&self) -> bool {
        let index = self.index();
        self.published
            .iter()
            .all(|marker| marker.load(Ordering::Acquire) == index)
    }
}

/// An unbounded multi-producer buffer.
///
/// Slots are created by the factory when their chunk is allocated and reused in place when
/// the chunk is pooled. Producers and consumers get to a slot through different lookups:
/// producers start from the producer chunk and extend the buffer as needed, consumers walk
/// forward from the head.
pub struct MpUnboundedBuffer<T> {
    chunk_length: usize,
    max_pooled_chunks: usize,
    head: CachePadded<Atomic<Chunk<T>>>,
    producer: CachePadded<Atomic<Chunk<T>>>,
    tail: CachePadded<Atomic<Chunk<T>>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
}

impl<T> MpUnboundedBuffer<T> {
    /// # Panics
    /// If `chunk_length` is zero.
    pub fn new<F>(chunk_length: usize, max_pooled_chunks: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        assert!(chunk_length > 0, "Chunk length must be positive");
        let first = Owned::new(Chunk::new(0, chunk_length, &factory));
        // SAFETY: the buffer is not shared yet.
        let first = first.into_shared(unsafe { epoch::unprotected() });
        Self {
            chunk_length,
            max_pooled_chunks,
            head: CachePadded::new(Atomic::from(first)),
            producer: CachePadded::new(Atomic::from(first)),
            tail: CachePadded::new(Atomic::from(first)),
            factory: Box::new(factory),
        }
    }

    pub fn chunk_length(&self) -> usize {
        self.chunk_length
    }

    pub fn max_pooled_chunks(&self) -> usize {
        self.max_pooled_chunks
    }

    #[inline]
    fn chunk_index(&self, sequence: Sequence) -> i64 {
        sequence.div_euclid(self.chunk_length as i64)
    }

    #[inline]
    fn offset(&self, sequence: Sequence) -> usize {
        sequence.rem_euclid(self.chunk_length as i64) as usize
    }

    fn load_settled<'g>(pointer: &Atomic<Chunk<T>>, guard: &'g Guard) -> Shared<'g, Chunk<T>> {
        let backoff = Backoff::new();
        loop {
            let current = pointer.load(Ordering::Acquire, guard);
            if current.tag() != ROTATION {
                return current;
            }
            backoff.snooze();
        }
    }

    fn try_rotate(pointer: &Atomic<Chunk<T>>, current: Shared<'_, Chunk<T>>, guard: &Guard) -> bool {
        pointer
            .compare_exchange(
                current,
                current.with_tag(ROTATION),
                Ordering::AcqRel,
                Ordering::Acquire,
                guard,
            )
            .is_ok()
    }

    fn lock<'g>(pointer: &Atomic<Chunk<T>>, guard: &'g Guard) -> Shared<'g, Chunk<T>> {
        loop {
            let current = Self::load_settled(pointer, guard);
            if Self::try_rotate(pointer, current, guard) {
                return current;
            }
        }
    }

    /// Chunk holding `sequence` for a producer that has reserved it, appending chunks if the
    /// buffer does not reach that far yet.
    fn producer_chunk<'g>(&self, sequence: Sequence, guard: &'g Guard) -> &'g Chunk<T> {
        let target = self.chunk_index(sequence);
        loop {
            let current = Self::load_settled(&self.producer, guard);
            // SAFETY: linked chunks are only destroyed through the guard.
            let chunk = unsafe { current.deref() };
            let index = chunk.index();

            if index == target {
                return chunk;
            }

            if index > target {
                return self.walk_back(chunk, sequence, target, guard);
            }

            if !Self::try_rotate(&self.producer, current, guard) {
                continue;
            }

            let mut chunk = current;
            // SAFETY: as above.
            while unsafe { chunk.deref() }.index() < target {
                let next = unsafe { chunk.deref() }.next.load(Ordering::Acquire, guard);
                chunk = if next.is_null() {
                    self.append_after(chunk, guard)
                } else {
                    next
                };
            }
            self.producer.store(chunk, Ordering::Release);
            // SAFETY: as above.
            return unsafe { chunk.deref() };
        }
    }

    fn walk_back<'g>(
        &self,
        mut chunk: &'g Chunk<T>,
        sequence: Sequence,
        target: i64,
        guard: &'g Guard,
    ) -> &'g Chunk<T> {
        while chunk.index() > target {
            let prev = chunk.prev.load(Ordering::Acquire, guard);
            if prev.is_null() {
                panic!("sequence {sequence} has already been recycled");
            }
            // SAFETY: chunks from the target up to the producer are not recyclable yet.
            chunk = unsafe { prev.deref() };
        }
        chunk
    }

    /// Link a fresh chunk after `last`, which must be the tail unless someone else already
    /// extended the list.
    fn append_after<'g>(
        &self,
        last: Shared<'g, Chunk<T>>,
        guard: &'g Guard,
    ) -> Shared<'g, Chunk<T>> {
        // SAFETY: `last` is linked and protected by the guard.
        let last_ref = unsafe { last.deref() };
        let tail = Self::lock(&self.tail, guard);

        let next = last_ref.next.load(Ordering::Acquire, guard);
        if !next.is_null() {
            // A recycled chunk was linked while waiting for the lock.
            self.tail.store(tail, Ordering::Release);
            return next;
        }
        assert!(
            tail == last,
            "inconsistent chunk list: unlinked chunk is not the tail"
        );

        let index = last_ref.index() + 1;
        let chunk = Owned::new(Chunk::new(index, self.chunk_length, &*self.factory));
        chunk.prev.store(last, Ordering::Relaxed);
        let chunk = chunk.into_shared(guard);
        last_ref.next.store(chunk, Ordering::Release);
        self.tail.store(chunk, Ordering::Release);
        trace!(index, "appended chunk");
        chunk
    }

    /// Chunk holding `sequence` for a consumer, or `None` if it is not linked. Walks from the
    /// head and starts over whenever recycling moves a chunk under its feet.
    fn consumer_chunk<'g>(&self, sequence: Sequence, guard: &'g Guard) -> Option<&'g Chunk<T>> {
        let target = self.chunk_index(sequence);
        let backoff = Backoff::new();
        'retry: loop {
            let head = Self::load_settled(&self.head, guard);
            let mut current = head;
            loop {
                // SAFETY: chunks are only destroyed through the guard.
                let chunk = unsafe { current.deref() };
                let index = chunk.index();
                if index == target {
                    return Some(chunk);
                }
                if index > target {
                    if current == head && self.head.load(Ordering::Acquire, guard) == head {
                        return None;
                    }
                    backoff.snooze();
                    continue 'retry;
                }

                let next = chunk.next.load(Ordering::Acquire, guard);
                if next.is_null() {
                    // Tail before index: a chunk pooled at the tail is renamed before the tail
                    // is released, so a matching tail guarantees its new index is visible.
                    if self.tail.load(Ordering::Acquire, guard) == current && chunk.index() == index {
                        return None;
                    }
                    backoff.snooze();
                    continue 'retry;
                }
                current = next;
            }
        }
    }

    fn consumer_slot(&self, sequence: Sequence) -> *mut T {
        let guard = &epoch::pin();
        match self.consumer_chunk(sequence, guard) {
            Some(chunk) => chunk.slots[self.offset(sequence)].get(),
            None => panic!("sequence {sequence} is not linked in the buffer"),
        }
    }

    fn producer_slot(&self, sequence: Sequence) -> *mut T {
        let guard = &epoch::pin();
        let chunk = self.producer_chunk(sequence, guard);
        chunk.slots[self.offset(sequence)].get()
    }

    /// Mark `sequence` as filled. Only the producer that reserved it may call this.
    pub fn publish(&self, sequence: Sequence) {
        let guard = &epoch::pin();
        let chunk = self.producer_chunk(sequence, guard);
        chunk.published[self.offset(sequence)].store(chunk.index(), Ordering::Release);
    }

    /// Whether `sequence` has been published. Sequences behind the head were consumed and
    /// count as published.
    pub fn is_published(&self, sequence: Sequence) -> bool {
        let guard = &epoch::pin();
        match self.consumer_chunk(sequence, guard) {
            Some(chunk) => {
                let index = chunk.index();
                index == self.chunk_index(sequence)
                    && chunk.published[self.offset(sequence)].load(Ordering::Acquire) == index
            }
            None => self.chunk_index(sequence) < self.head_chunk_index(),
        }
    }

    /// Unlink the head chunk if every sequence in it is at or below `gating_sequence`, every
    /// slot in it is published and the producer has moved past it. Returns whether the head
    /// moved.
    ///
    /// The publication check keeps a chunk linked while a slower producer still holds an
    /// unwritten reservation in it, even when nothing gates the buffer.
    pub fn try_move_head_to_next(&self, gating_sequence: Sequence) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        if head.tag() == ROTATION {
            return false;
        }
        // SAFETY: protected by the guard.
        let head_ref = unsafe { head.deref() };
        if head_ref.max_sequence() > gating_sequence || !head_ref.is_fully_published() {
            return false;
        }
        let producer_index = unsafe { Self::load_settled(&self.producer, guard).deref() }.index();
        if head_ref.index() >= producer_index {
            return false;
        }
        if !Self::try_rotate(&self.head, head, guard) {
            return false;
        }

        let next = head_ref.next.load(Ordering::Acquire, guard);
        assert!(
            !next.is_null(),
            "inconsistent chunk list: head behind the producer has no successor"
        );
        // SAFETY: `next` is linked.
        unsafe { next.deref() }
            .prev
            .store(Shared::null(), Ordering::Release);
        self.head.store(next, Ordering::Release);
        trace!(index = head_ref.index(), "moved head past chunk");

        self.recycle_chunk(head, producer_index, guard);
        true
    }

    /// Move the head forward as far as `gating_sequence` allows. Returns the number of
    /// chunks released.
    pub fn recycle(&self, gating_sequence: Sequence) -> usize {
        let mut released = 0;
        while self.try_move_head_to_next(gating_sequence) {
            released += 1;
        }
        released
    }

    fn recycle_chunk(&self, chunk: Shared<'_, Chunk<T>>, producer_index: i64, guard: &Guard) {
        // SAFETY: unlinked from the head but not destroyed; only this thread owns it now.
        let chunk_ref = unsafe { chunk.deref() };
        let old_index = chunk_ref.index();
        let tail = Self::lock(&self.tail, guard);
        // SAFETY: protected by the guard.
        let tail_ref = unsafe { tail.deref() };
        let tail_index = tail_ref.index();

        if tail_index - producer_index >= self.max_pooled_chunks as i64 {
            self.tail.store(tail, Ordering::Release);
            chunk_ref.next.store(Shared::null(), Ordering::Relaxed);
            // SAFETY: the chunk is unreachable from the list; readers that still hold it are
            // pinned and delay the destruction.
            unsafe { guard.defer_destroy(chunk) };
            trace!(index = old_index, "discarded chunk");
            return;
        }

        let index = tail_index + 1;
        chunk_ref.next.store(Shared::null(), Ordering::Release);
        chunk_ref.prev.store(tail, Ordering::Release);
        chunk_ref.index.store(index, Ordering::Release);
        tail_ref.next.store(chunk, Ordering::Release);
        self.tail.store(chunk, Ordering::Release);
        trace!(old_index, index, "pooled chunk at tail");
    }

    fn settled_index(pointer: &Atomic<Chunk<T>>) -> i64 {
        let guard = &epoch::pin();
        // SAFETY: protected by the guard.
        unsafe { Self::load_settled(pointer, guard).deref() }.index()
    }

    pub fn head_chunk_index(&self) -> i64 {
        Self::settled_index(&self.head)
    }

    pub fn producer_chunk_index(&self) -> i64 {
        Self::settled_index(&self.producer)
    }

    pub fn tail_chunk_index(&self) -> i64 {
        Self::settled_index(&self.tail)
    }

    /// Spare chunks linked ahead of the producer chunk.
    pub fn pooled_chunk_count(&self) -> usize {
        (self.tail_chunk_index() - self.producer_chunk_index()).max(0) as usize
    }

    /// Chunks currently reachable from the head. Only exact when the buffer is quiescent.
    pub fn linked_chunk_count(&self) -> usize {
        let guard = &epoch::pin();
        let mut count = 0;
        let mut current = Self::load_settled(&self.head, guard);
        while !current.is_null() {
            count += 1;
            // SAFETY: protected by the guard.
            current = unsafe { current.deref() }
                .next
                .load(Ordering::Acquire, guard);
        }
        count
    }
}

impl<T> Drop for MpUnboundedBuffer<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no other thread can reach the list.
        unsafe {
            let guard = epoch::unprotected();
            let mut current = self.head.load(Ordering::Relaxed, guard).with_tag(0);
            while !current.is_null() {
                let next = current.deref().next.load(Ordering::Relaxed, guard);
                drop(current.into_owned());
                current = next;
            }
        }
    }
}

impl<T> std::fmt::Debug for MpUnboundedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpUnboundedBuffer")
            .field("chunk_length", &self.chunk_length)
            .field("max_pooled_chunks", &self.max_pooled_chunks)
            .field("head", &self.head_chunk_index())
            .field("producer", &self.producer_chunk_index())
            .field("tail", &self.tail_chunk_index())
            .finish()
    }
}

#[allow(clippy::mut_from_ref)]
impl<T: Send + Sync> DataProvider<T> for MpUnboundedBuffer<T> {
    unsafe fn get(&self, sequence: Sequence) -> &T {
        &*self.consumer_slot(sequence)
    }

    unsafe fn get_mut(&self, sequence: Sequence) -> &mut T {
        &mut *self.producer_slot(sequence)
    }

    unsafe fn producer_get(&self, sequence: Sequence) -> &T {
        &*self.producer_slot(sequence)
    }

    unsafe fn producer_get_mut(&self, sequence: Sequence) -> &mut T {
        &mut *self.producer_slot(sequence)
    }

    unsafe fn consumer_get(&self, sequence: Sequence) -> &T {
        &*self.consumer_slot(sequence)
    }

    unsafe fn consumer_get_mut(&self, sequence: Sequence) -> &mut T {
        &mut *self.consumer_slot(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    fn buffer(chunk_length: usize, max_pooled_chunks: usize) -> MpUnboundedBuffer<i64> {
        MpUnboundedBuffer::new(chunk_length, max_pooled_chunks, || -1)
    }

    #[test]
    fn test_starts_with_one_chunk() {
        let buffer = buffer(4, 2);
        assert_eq!(buffer.chunk_length(), 4);
        assert_eq!(buffer.max_pooled_chunks(), 2);
        assert_eq!(buffer.linked_chunk_count(), 1);
        assert_eq!(buffer.head_chunk_index(), 0);
        assert_eq!(buffer.producer_chunk_index(), 0);
        assert_eq!(buffer.pooled_chunk_count(), 0);
    }

    #[test]
    #[should_panic(expected = "Chunk length must be positive")]
    fn test_zero_chunk_length() {
        let _buffer = buffer(0, 2);
    }

    #[test]
    fn test_producer_lookup_grows_the_buffer() {
        let buffer = buffer(4, 2);
        unsafe {
            for sequence in 0..20 {
                buffer.producer_set(sequence, sequence * 10);
            }
            assert_eq!(buffer.linked_chunk_count(), 5);
            assert_eq!(buffer.producer_chunk_index(), 4);
            for sequence in 0..20 {
                assert_eq!(*buffer.consumer_get(sequence), sequence * 10);
                assert_eq!(*buffer.producer_get(sequence), sequence * 10);
            }
        }
    }

    #[test]
    fn test_publish_markers() {
        let buffer = buffer(4, 2);
        assert!(!buffer.is_published(0));
        buffer.publish(1);
        assert!(!buffer.is_published(0));
        assert!(buffer.is_published(1));
        // Not linked yet.
        assert!(!buffer.is_published(9));
        buffer.publish(9);
        assert!(buffer.is_published(9));
        assert!(!buffer.is_published(8));
    }

    #[test]
    fn test_head_waits_for_consumers_and_producer() {
        let buffer = buffer(4, 2);
        unsafe { buffer.producer_set(9, 9) };
        for sequence in 0..8 {
            buffer.publish(sequence);
        }

        // Chunk 0 is not fully consumed.
        assert!(!buffer.try_move_head_to_next(2));
        assert!(buffer.try_move_head_to_next(3));
        assert_eq!(buffer.head_chunk_index(), 1);

        // Chunk 2 is the producer chunk.
        assert_eq!(buffer.recycle(i64::MAX), 1);
        assert_eq!(buffer.head_chunk_index(), 2);
        assert!(!buffer.try_move_head_to_next(i64::MAX));
    }

    #[test]
    fn test_recycled_chunks_are_pooled_at_the_tail() {
        let buffer = buffer(4, 2);
        unsafe {
            buffer.producer_set(0, 42);
            buffer.producer_set(8, 8);
        }
        for sequence in 0..8 {
            buffer.publish(sequence);
        }
        assert_eq!(buffer.recycle(7), 2);

        assert_eq!(buffer.head_chunk_index(), 2);
        assert_eq!(buffer.tail_chunk_index(), 4);
        assert_eq!(buffer.pooled_chunk_count(), 2);
        assert_eq!(buffer.linked_chunk_count(), 3);

        // Pooled chunks keep their storage but not their publication state.
        assert!(!buffer.is_published(12));
        unsafe {
            assert_eq!(*buffer.consumer_get(12), 42);
            buffer.producer_set(17, 17);
        }
        assert_eq!(buffer.producer_chunk_index(), 4);
        assert_eq!(buffer.linked_chunk_count(), 3);
    }

    #[test]
    fn test_chunks_beyond_the_pool_cap_are_dropped() {
        let drops = Arc::new(AtomicUsize::new(0));
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        {
            let factory_drops = drops.clone();
            let buffer = MpUnboundedBuffer::new(2, 0, move || Tracked(factory_drops.clone()));
            unsafe { buffer.producer_get_mut(10) };
            for sequence in 0..10 {
                buffer.publish(sequence);
            }
            assert_eq!(buffer.recycle(9), 5);
            assert_eq!(buffer.pooled_chunk_count(), 0);
            assert_eq!(buffer.linked_chunk_count(), 1);
        }
        // Discarded chunks are freed once the epoch advances; the rest when the buffer drops.
        for _ in 0..128 {
            epoch::pin().flush();
        }
        assert!(drops.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    #[should_panic(expected = "not linked")]
    fn test_reading_a_recycled_sequence_panics() {
        let buffer = buffer(4, 2);
        unsafe { buffer.producer_set(4, 4) };
        for sequence in 0..4 {
            buffer.publish(sequence);
        }
        assert!(buffer.try_move_head_to_next(3));
        unsafe { buffer.consumer_get(0) };
    }

    #[test]
    fn test_recycled_sequences_count_as_published() {
        let buffer = buffer(4, 2);
        for sequence in 0..5 {
            buffer.publish(sequence);
        }
        assert!(buffer.try_move_head_to_next(3));
        assert!(buffer.is_published(0));
    }

    #[test]
    fn test_head_waits_for_unpublished_slots() {
        let buffer = buffer(4, 2);
        for sequence in [1, 2, 3, 5] {
            buffer.publish(sequence);
        }
        assert_eq!(buffer.producer_chunk_index(), 1);

        // Sequence 0 is reserved but not written yet.
        assert!(!buffer.try_move_head_to_next(i64::MAX));
        assert_eq!(buffer.head_chunk_index(), 0);
        unsafe { buffer.producer_set(0, 7) };

        buffer.publish(0);
        assert!(buffer.try_move_head_to_next(i64::MAX));
        assert_eq!(buffer.head_chunk_index(), 1);
    }

    #[test]
    fn test_pooled_chunk_must_be_republished_before_recycling() {
        let buffer = buffer(2, 4);
        for sequence in 0..3 {
            buffer.publish(sequence);
        }
        assert!(buffer.try_move_head_to_next(1));
        // Chunk 0 now sits at the tail as chunk 2 with stale markers.
        assert_eq!(buffer.tail_chunk_index(), 2);
        buffer.publish(3);
        buffer.publish(4);
        assert!(buffer.try_move_head_to_next(i64::MAX));
        assert_eq!(buffer.head_chunk_index(), 2);
        assert!(!buffer.try_move_head_to_next(i64::MAX));
    }

    #[test]
    fn test_concurrent_producers_and_recycling() {
        const PRODUCERS: i64 = 4;
        const PER_PRODUCER: i64 = 2_000;

        let buffer = Arc::new(buffer(8, 2));
        let next = Arc::new(AtomicI64::new(0));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let buffer = buffer.clone();
                let next = next.clone();
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let sequence = next.fetch_add(1, Ordering::AcqRel);
                        unsafe { buffer.producer_set(sequence, sequence) };
                        buffer.publish(sequence);
                    }
                })
            })
            .collect();

        // Single consumer trailing the producers and recycling behind itself.
        let total = PRODUCERS * PER_PRODUCER;
        let mut sequence = 0;
        while sequence < total {
            if buffer.is_published(sequence) {
                assert_eq!(unsafe { *buffer.consumer_get(sequence) }, sequence);
                buffer.recycle(sequence);
                sequence += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(buffer.pooled_chunk_count() <= 2);
    }

    #[test]
    fn test_consumers_read_while_another_consumer_recycles() {
        const PRODUCERS: i64 = 4;
        const PER_PRODUCER: i64 = 5_000;
        const CONSUMERS: usize = 2;

        let buffer = Arc::new(buffer(2, 4));
        let next = Arc::new(AtomicI64::new(0));
        let positions: Arc<Vec<AtomicI64>> = Arc::new(
            (0..CONSUMERS)
                .map(|_| AtomicI64::new(INITIAL_SEQUENCE))
                .collect(),
        );

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let buffer = buffer.clone();
                let next = next.clone();
                thread::spawn(move || {
                    for _ in 0..PER_PRODUCER {
                        let sequence = next.fetch_add(1, Ordering::AcqRel);
                        unsafe { buffer.producer_set(sequence, sequence) };
                        buffer.publish(sequence);
                    }
                })
            })
            .collect();

        // Each consumer recycles behind the slowest one, so the others walk from a head that
        // moves and from chunks that get pooled at the tail.
        let total = PRODUCERS * PER_PRODUCER;
        let consumers: Vec<_> = (0..CONSUMERS)
            .map(|consumer| {
                let buffer = buffer.clone();
                let positions = positions.clone();
                thread::spawn(move || {
                    let mut sequence = 0;
                    while sequence < total {
                        if buffer.is_published(sequence) {
                            assert_eq!(unsafe { *buffer.consumer_get(sequence) }, sequence);
                            positions[consumer].store(sequence, Ordering::Release);
                            let gating = positions
                                .iter()
                                .map(|position| position.load(Ordering::Acquire))
                                .min()
                                .unwrap_or(INITIAL_SEQUENCE);
                            buffer.recycle(gating);
                            sequence += 1;
                        } else {
                            std::hint::spin_loop();
                        }
                    }
                })
            })
            .collect();

        for handle in producers.into_iter().chain(consumers) {
            handle.join().unwrap();
        }
        assert!(buffer.pooled_chunk_count() <= 4);
    }
}
