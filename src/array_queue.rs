//! Provides bounded lock-free queue for message passing between multiple producers and multiple consumers.
//!
//! Queue is a ring of slots and two counters.
//! `tail` counts successful offers and `head` counts successful polls.
//! Position `p` lives in slot `p % capacity` during lap `p / capacity`.
//!
//! A thread claims its position by locking the slot with a single CAS on the slot stamp.
//! The stamp must match the lap of the position, so a thread working with an outdated
//! position can never touch a slot that was already recycled for a later lap.
//! Counters are moved forward only after the slot transition is published,
//! and any thread that finds a position completed by a peer moves the counter on its behalf.

use alloc::{boxed::Box, vec::Vec};
use core::fmt;

use crate::{
    backoff::BackOff,
    invariant_violation,
    sequence::{Counter, Sequence},
    slot::{Lock, Slot, Stamp},
};

/// Error returned by [`ArrayQueue::try_offer`].
/// Gives the rejected value back.
#[derive(Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OfferError<T> {
    /// Every slot is occupied.
    #[error("queue is full")]
    Full(T),

    /// Queue was created with zero capacity and can never accept a value.
    #[error("queue has zero capacity")]
    ZeroCapacity(T),
}

impl<T> OfferError<T> {
    /// Returns the value that was not enqueued.
    #[must_use]
    pub fn into_inner(self) -> T {
        match self {
            OfferError::Full(value) | OfferError::ZeroCapacity(value) => value,
        }
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferError::Full(_) => f.write_str("Full(..)"),
            OfferError::ZeroCapacity(_) => f.write_str("ZeroCapacity(..)"),
        }
    }
}

/// Bounded lock-free multi-producer multi-consumer queue.
///
/// All operations take shared reference and never block.
/// Capacity is fixed at construction, slots are allocated once and reused in place.
///
/// Queue with zero capacity is valid, it rejects every offer and is always empty.
pub struct ArrayQueue<T> {
    head: Counter,
    tail: Counter,
    seq: Sequence,
    slots: Box<[Slot<T>]>,
}

unsafe impl<T> Send for ArrayQueue<T> where T: Send {}
unsafe impl<T> Sync for ArrayQueue<T> where T: Send {}

impl<T> ArrayQueue<T> {
    /// Creates new queue with given capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` exceeds `isize::MAX` or slots cannot be allocated.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Creates queue with both counters at `start`.
    /// Slot stamps are aligned so that every slot expects the first position at or after `start`.
    pub(crate) fn starting_at(capacity: usize, start: usize) -> Self {
        let seq = Sequence::new(capacity);
        debug_assert!(start <= seq.max());

        let slots = (0..capacity)
            .map(|index| {
                let offset = (index + capacity - start % capacity) % capacity;
                Slot::new(Stamp::Free(seq.lap(seq.forward(start, offset))))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        tracing::debug!(capacity, max = seq.max(), "array queue created");

        ArrayQueue {
            head: Counter::new(start),
            tail: Counter::new(start),
            seq,
            slots,
        }
    }

    /// Returns capacity of the queue.
    #[inline(always)]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Returns number of values in the queue.
    ///
    /// Note that result may be outdated by the time it is returned.
    #[must_use]
    pub fn size(&self) -> usize {
        let capacity = self.capacity();
        if capacity == 0 {
            return 0;
        }

        // Tail is read last, so it can only be fresher than head.
        let head = self.head.load();
        let tail = self.tail.load();
        if self.seq.precedes(tail, head) {
            invariant_violation("head is ahead of tail");
        }

        self.seq.distance(head, tail).min(capacity)
    }

    /// Same as [`ArrayQueue::size`].
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size()
    }

    /// Note that result may be outdated by the time it is returned.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Note that result may be outdated by the time it is returned.
    #[inline(always)]
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.size() == self.capacity()
    }

    /// Attempts to push value to the queue.
    ///
    /// Returns false if the queue is full or has zero capacity.
    /// Rejected value is dropped, use [`ArrayQueue::try_offer`] to get it back.
    #[inline]
    pub fn offer(&self, value: T) -> bool {
        self.try_offer(value).is_ok()
    }

    /// Attempts to push value to the queue.
    ///
    /// # Errors
    ///
    /// If at full capacity this will fail and return the value back.
    pub fn try_offer(&self, value: T) -> Result<(), OfferError<T>> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Err(OfferError::ZeroCapacity(value));
        }

        let seq = &self.seq;
        let mut backoff = BackOff::new();
        let mut tail = self.tail.load();

        loop {
            let head = self.head.load();
            let len = seq.distance(head, tail);

            if len > capacity {
                // Head passed our tail, it is long outdated.
                backoff.spin();
                tail = self.tail.load();
                continue;
            }

            if len == capacity {
                return Err(OfferError::Full(value));
            }

            let lap = seq.lap(tail);
            let slot = &self.slots[seq.index(tail)];

            match slot.try_lock(Stamp::Free(lap), Lock::Write) {
                Ok(()) => {
                    // Consumers that moved head past this position will never come back for it.
                    // Not reachable while stamps follow laps: head only passes published positions
                    // and a published position never shows `Free(lap)` again in this lap.
                    let head = self.head.load();
                    if seq.precedes(tail, head) {
                        tracing::trace!(tail, head, "offer behind head aborted");
                        slot.unlock(Stamp::Free(lap));
                        tail = self.tail.load();
                        continue;
                    }

                    // Safety: write lock is held.
                    unsafe { slot.write(value) };
                    slot.unlock(Stamp::Occupied(lap));
                    self.tail.advance(seq, tail, tail);
                    return Ok(());
                }
                Err(Stamp::Occupied(found)) if found == lap => {
                    // Peer filled this position and did not move tail yet.
                    self.tail.advance(seq, tail, tail);
                    tail = seq.next(tail);
                    backoff.reset();
                }
                Err(Stamp::Writing) => {
                    // Peer is in the middle of writing, retry same position.
                    backoff.snooze();
                }
                Err(_) => {
                    // Slot belongs to another lap.
                    backoff.snooze();
                    tail = self.tail.load();
                }
            }
        }
    }

    /// Attempts to pop value from the queue.
    ///
    /// Returns `None` if the queue is empty or has zero capacity.
    pub fn poll(&self) -> Option<T> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }

        let seq = &self.seq;
        let mut backoff = BackOff::new();
        let mut head = self.head.load();

        loop {
            let tail = self.tail.load();
            let len = seq.distance(head, tail);

            if len == 0 {
                return None;
            }

            if len > capacity {
                // Our head is outdated.
                backoff.spin();
                head = self.head.load();
                continue;
            }

            let lap = seq.lap(head);
            let next_lap = seq.next_lap(lap);
            let slot = &self.slots[seq.index(head)];

            match slot.try_lock(Stamp::Occupied(lap), Lock::Read) {
                Ok(()) => {
                    // Safety: read lock is held.
                    let value = unsafe { slot.take() };
                    slot.unlock(Stamp::Free(next_lap));
                    self.head.advance(seq, head, head);
                    return Some(value);
                }
                Err(Stamp::Free(found)) if found == next_lap => {
                    // Peer took this position and did not move head yet.
                    self.head.advance(seq, head, head);
                    head = seq.next(head);
                    backoff.reset();
                }
                Err(Stamp::Reading) => {
                    // Peer is in the middle of reading, retry same position.
                    backoff.snooze();
                }
                Err(_) => {
                    backoff.snooze();
                    head = self.head.load();
                }
            }
        }
    }
}

impl<T> fmt::Debug for ArrayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let index = |pos| if self.capacity() == 0 { 0 } else { self.seq.index(pos) };
        let head = self.head.load();
        let tail = self.tail.load();

        f.debug_struct("ArrayQueue")
            .field("head", &head)
            .field("head_index", &index(head))
            .field("tail", &tail)
            .field("tail_index", &index(tail))
            .field("capacity", &self.capacity())
            .field("max", &self.seq.max())
            .finish_non_exhaustive()
    }
}

#[cfg(all(test, feature = "std", not(loom)))]
fn run_concurrently(
    queue: &ArrayQueue<u64>,
    producers: u64,
    per_producer: u64,
    consumers: usize,
) -> Vec<u64> {
    use std::sync::atomic::{AtomicU64, Ordering};

    let total = producers * per_producer;
    let consumed = AtomicU64::new(0);
    let results = parking_lot::Mutex::new(Vec::new());

    std::thread::scope(|scope| {
        for producer in 0..producers {
            scope.spawn(move || {
                for i in 0..per_producer {
                    let mut value = producer * per_producer + i;
                    while let Err(err) = queue.try_offer(value) {
                        value = err.into_inner();
                        std::thread::yield_now();
                    }
                }
            });
        }

        for _ in 0..consumers {
            let (consumed, results) = (&consumed, &results);
            scope.spawn(move || {
                let mut received = Vec::new();
                while consumed.load(Ordering::Relaxed) < total {
                    assert!(queue.size() <= queue.capacity());
                    match queue.poll() {
                        Some(value) => {
                            received.push(value);
                            consumed.fetch_add(1, Ordering::Relaxed);
                        }
                        None => std::thread::yield_now(),
                    }
                }
                results.lock().extend(received);
            });
        }
    });

    let mut results = results.into_inner();
    results.sort_unstable();
    results
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_fill_and_drain() {
    let queue = ArrayQueue::new(2);

    assert!(queue.offer("A"));
    assert!(queue.offer("B"));
    assert!(!queue.offer("C"));

    assert_eq!(queue.poll(), Some("A"));
    assert_eq!(queue.poll(), Some("B"));
    assert_eq!(queue.poll(), None);
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_reuse_slot_after_poll() {
    let queue = ArrayQueue::new(2);

    assert!(queue.offer("A"));
    assert!(queue.offer("B"));
    assert_eq!(queue.poll(), Some("A"));
    assert!(queue.offer("C"));
    assert!(!queue.offer("D"));

    assert_eq!(queue.poll(), Some("B"));
    assert_eq!(queue.poll(), Some("C"));
    assert_eq!(queue.poll(), None);

    assert!(queue.offer("E"));
    assert_eq!(queue.size(), 1);
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_zero_capacity() {
    let queue = ArrayQueue::new(0);

    for _ in 0..3 {
        assert!(!queue.offer(1));
        assert_eq!(queue.poll(), None);
        assert_eq!(queue.size(), 0);
    }

    assert!(matches!(queue.try_offer(7), Err(OfferError::ZeroCapacity(7))));
    assert!(queue.is_empty());
    assert!(queue.is_full());
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_poll_empty() {
    let queue = ArrayQueue::<String>::new(2);
    for _ in 0..3 {
        assert_eq!(queue.poll(), None);
    }
    assert!(queue.is_empty());
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_try_offer_returns_value() {
    let queue = ArrayQueue::new(1);

    queue.try_offer(String::from("first")).unwrap();
    let err = queue.try_offer(String::from("second")).unwrap_err();

    assert!(matches!(err, OfferError::Full(_)));
    assert_eq!(err.to_string(), "queue is full");
    assert_eq!(err.into_inner(), "second");
    assert!(queue.is_full());
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_size_follows_counters() {
    let queue = ArrayQueue::new(3);
    assert_eq!(queue.capacity(), 3);

    for expected in 1..=3 {
        assert!(queue.offer(expected));
        assert_eq!(queue.size(), expected);
    }
    assert!(queue.is_full());

    for expected in (0..3).rev() {
        assert!(queue.poll().is_some());
        assert_eq!(queue.len(), expected);
    }
    assert!(queue.is_empty());
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_drop_releases_values() {
    use std::sync::Arc;

    let marker = Arc::new(());
    {
        let queue = ArrayQueue::new(3);
        for _ in 0..3 {
            assert!(queue.offer(Arc::clone(&marker)));
        }

        // Rejected value is dropped right away.
        assert!(!queue.offer(Arc::clone(&marker)));
        assert_eq!(Arc::strong_count(&marker), 4);

        drop(queue.poll());
        assert_eq!(Arc::strong_count(&marker), 3);
    }
    assert_eq!(Arc::strong_count(&marker), 1);
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_debug_shows_counters() {
    let queue = ArrayQueue::new(2);
    queue.offer(1);
    queue.offer(2);
    queue.poll();

    let repr = format!("{queue:?}");
    assert!(repr.contains("head: 1"), "{repr}");
    assert!(repr.contains("tail: 2"), "{repr}");
    assert!(repr.contains("head_index: 1"), "{repr}");
    assert!(repr.contains("tail_index: 0"), "{repr}");
    assert!(repr.contains("capacity: 2"), "{repr}");

    let empty = format!("{:?}", ArrayQueue::<u8>::new(0));
    assert!(empty.contains("head_index: 0"), "{empty}");
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
#[should_panic(expected = "head is ahead of tail")]
fn test_size_rejects_head_ahead_of_tail() {
    let queue = ArrayQueue::<u32>::starting_at(4, 10);

    // Move head without a matching offer.
    assert!(queue.head.advance(&queue.seq, 10, 10));
    let _ = queue.size();
}

/// Every polled position leaves its slot at `Free` of the next lap, never of its own.
/// This is what keeps the behind-head abort in `try_offer` unreachable, no test enters it.
#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_wraparound_stability() {
    for capacity in [1, 2, 3, 5, 8] {
        let seq = Sequence::new(capacity);
        let start = seq.max() - capacity;
        let queue = ArrayQueue::starting_at(capacity, start);

        let mut offered = 0;
        let mut polled = 0;
        let mut wrapped = false;

        for cycle in 0..10_000 {
            let batch = cycle % capacity + 1;

            for _ in 0..batch {
                let tail = queue.tail.load();
                assert_eq!(tail, seq.forward(start, offered));
                assert!(queue.offer(offered));
                assert_eq!(
                    queue.slots[seq.index(tail)].stamp(),
                    Stamp::Occupied(seq.lap(tail))
                );
                offered += 1;
            }

            if batch == capacity {
                assert!(!queue.offer(usize::MAX));
            }

            for _ in 0..batch {
                let head = queue.head.load();
                assert_eq!(queue.poll(), Some(polled));
                assert_eq!(
                    queue.slots[seq.index(head)].stamp(),
                    Stamp::Free(seq.next_lap(seq.lap(head)))
                );
                polled += 1;
            }

            assert_eq!(queue.poll(), None);
            wrapped |= queue.tail.load() < start;
        }

        assert!(wrapped);
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.head.load(), queue.tail.load());
    }
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_wraparound_keeps_partial_fill() {
    // Keep the queue half full while counters cross the wrap point.
    let capacity = 4;
    let seq = Sequence::new(capacity);
    let start = seq.max() - capacity;
    let queue = ArrayQueue::starting_at(capacity, start);

    assert!(queue.offer(0));
    assert!(queue.offer(1));

    for next in 2..10_000 {
        assert!(queue.offer(next));
        assert_eq!(queue.size(), 3);
        assert_eq!(queue.poll(), Some(next - 2));
    }

    assert_eq!(queue.poll(), Some(9_998));
    assert_eq!(queue.poll(), Some(9_999));
    assert_eq!(queue.poll(), None);
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_fifo_without_overlap() {
    let queue = ArrayQueue::new(8);

    std::thread::scope(|scope| {
        let queue = &queue;
        scope.spawn(move || {
            for i in 0..10_000u32 {
                while !queue.offer(i) {
                    std::thread::yield_now();
                }
            }
        });

        scope.spawn(move || {
            let mut expected = 0;
            while expected < 10_000u32 {
                if let Some(value) = queue.poll() {
                    assert_eq!(value, expected);
                    expected += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
    });

    assert!(queue.is_empty());
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_concurrent_configurations() {
    // (capacity, producers, values per producer, consumers)
    let configurations = [
        (1, 1, 100, 1),
        (1, 10, 2, 2),
        (20, 10, 2, 5),
        (100, 50, 100, 5),
        (5, 1, 100_000, 1),
        (10, 3, 100_000, 2),
        (300_000, 3, 100_000, 3),
    ];

    for (capacity, producers, per_producer, consumers) in configurations {
        let queue = ArrayQueue::new(capacity);
        let results = run_concurrently(&queue, producers, per_producer, consumers);

        assert_eq!(results, (0..producers * per_producer).collect::<Vec<_>>());
        assert!(queue.is_empty(), "{queue:?}");
    }
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_concurrent_single_slot() {
    let queue = ArrayQueue::new(1);
    let results = run_concurrently(&queue, 2, 1_000_000, 2);

    assert_eq!(results.len(), 2_000_000);
    assert!(results.iter().enumerate().all(|(i, &v)| v == i as u64));
    assert!(queue.is_empty(), "{queue:?}");
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_concurrent_across_wrap() {
    let capacity = 4;
    let seq = Sequence::new(capacity);
    let queue = ArrayQueue::starting_at(capacity, seq.max() - 1_000);

    let results = run_concurrently(&queue, 4, 10_000, 4);

    assert_eq!(results, (0..40_000u64).collect::<Vec<_>>());
    assert!(queue.tail.load() < 40_000);
    assert!(queue.is_empty(), "{queue:?}");
}

#[cfg(loom)]
#[test]
fn loom_spsc() {
    use loom::{sync::Arc, thread};

    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(3);
    builder.check(|| {
        let queue = Arc::new(ArrayQueue::new(1));

        let producer = thread::spawn({
            let queue = Arc::clone(&queue);
            move || {
                for i in 0..2 {
                    while !queue.offer(i) {
                        thread::yield_now();
                    }
                }
            }
        });

        let mut received = Vec::new();
        while received.len() < 2 {
            match queue.poll() {
                Some(value) => received.push(value),
                None => thread::yield_now(),
            }
        }

        producer.join().unwrap();
        assert_eq!(received, [0, 1]);
    });
}

// Loom threads get a bounded number of attempts, whatever is left is drained after join.
#[cfg(loom)]
fn loom_poll_attempts(queue: &ArrayQueue<usize>, attempts: usize) -> usize {
    let mut mask = 0;
    for _ in 0..attempts {
        match queue.poll() {
            Some(value) => {
                assert_eq!(mask & (1 << value), 0, "value {value} polled twice");
                mask |= 1 << value;
            }
            None => loom::thread::yield_now(),
        }
    }
    mask
}

#[cfg(loom)]
fn loom_drain(queue: &ArrayQueue<usize>, mut mask: usize) -> usize {
    while let Some(value) = queue.poll() {
        assert_eq!(mask & (1 << value), 0, "value {value} polled twice");
        mask |= 1 << value;
    }
    mask
}

#[cfg(loom)]
#[test]
fn loom_mpmc() {
    use loom::{sync::Arc, thread};

    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(2);
    builder.check(|| {
        let queue = Arc::new(ArrayQueue::new(2));

        let producers: Vec<_> = (0..2)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    // Two values never fill two slots.
                    assert!(queue.offer(i));
                })
            })
            .collect();

        let consumer = thread::spawn({
            let queue = Arc::clone(&queue);
            move || loom_poll_attempts(&queue, 1)
        });

        let mut mask = loom_poll_attempts(&queue, 1);

        for producer in producers {
            producer.join().unwrap();
        }
        let other = consumer.join().unwrap();
        assert_eq!(mask & other, 0, "value polled by both consumers");
        mask = loom_drain(&queue, mask | other);

        assert_eq!(mask, 0b11);
        assert!(queue.is_empty());
    });
}

#[cfg(loom)]
#[test]
fn loom_single_slot_across_wrap() {
    use loom::{sync::Arc, thread};

    let mut builder = loom::model::Builder::new();
    builder.preemption_bound = Some(2);
    builder.check(|| {
        let seq = Sequence::new(1);
        let queue = Arc::new(ArrayQueue::starting_at(1, seq.max()));

        let producers: Vec<_> = (0..2)
            .map(|i| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || if queue.offer(i) { 1 << i } else { 0 })
            })
            .collect();

        let mut mask = loom_poll_attempts(&queue, 1);

        let mut offered = 0;
        for producer in producers {
            offered |= producer.join().unwrap();
        }
        mask = loom_drain(&queue, mask);

        // One slot: at least one offer lands, a second one only after a poll freed it.
        assert_ne!(offered, 0);
        assert_eq!(mask, offered);
        assert!(queue.is_empty());
    });
}
