//! Sequence counters and their overflow guard.
//!
//! Queue positions are logical counts of successful enqueues (`tail`) and dequeues (`head`).
//! They are stored capped at the largest capacity-aligned value below `isize::MAX`
//! and wrap to zero past it.
//! Because the wrap point is a multiple of the capacity, crossing it looks exactly
//! like moving to the next lap: index of the next position is 0 and its lap is 0.
//!
//! Counters only ever move forward, through [`Counter::advance`].

use crate::{
    cache::CachePadded,
    capacity_overflow, invariant_violation,
    sync::{AtomicUsize, Ordering},
};

/// Position arithmetic for one queue capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sequence {
    capacity: usize,

    /// Largest position value. `max + 1` is a multiple of `capacity`.
    max: usize,
}

impl Sequence {
    /// Upper bound of the position domain.
    /// Laps then fit into a slot stamp together with a tag bit.
    pub const LIMIT: usize = isize::MAX as usize;

    /// # Panics
    ///
    /// Panics if `capacity` exceeds [`Sequence::LIMIT`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let max = match capacity {
            0 => 0,
            cap if cap <= Self::LIMIT => Self::LIMIT / cap * cap - 1,
            _ => capacity_overflow(),
        };

        Sequence { capacity, max }
    }

    #[inline(always)]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest value a counter takes before wrapping to zero.
    #[inline(always)]
    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }

    #[inline(always)]
    #[must_use]
    pub fn max_lap(&self) -> usize {
        debug_assert_ne!(self.capacity, 0);
        self.max / self.capacity
    }

    #[inline(always)]
    #[must_use]
    pub fn index(&self, pos: usize) -> usize {
        debug_assert_ne!(self.capacity, 0);
        pos % self.capacity
    }

    #[inline(always)]
    #[must_use]
    pub fn lap(&self, pos: usize) -> usize {
        debug_assert_ne!(self.capacity, 0);
        pos / self.capacity
    }

    /// Position right after `pos`.
    #[inline(always)]
    #[must_use]
    pub fn next(&self, pos: usize) -> usize {
        debug_assert!(pos <= self.max);
        if pos == self.max { 0 } else { pos + 1 }
    }

    /// Lap that follows `lap`.
    #[inline(always)]
    #[must_use]
    pub fn next_lap(&self, lap: usize) -> usize {
        if lap == self.max_lap() { 0 } else { lap + 1 }
    }

    /// Position `n` steps after `pos`, `n` must not exceed the position domain.
    #[inline(always)]
    #[must_use]
    pub fn forward(&self, pos: usize, n: usize) -> usize {
        debug_assert!(pos <= self.max && n <= self.max);
        let room = self.max - pos;
        if n <= room { pos + n } else { n - room - 1 }
    }

    /// Number of steps from `from` forward to `to`, counting across the wrap.
    #[inline(always)]
    #[must_use]
    pub fn distance(&self, from: usize, to: usize) -> usize {
        debug_assert!(from <= self.max && to <= self.max);
        if to >= from {
            to - from
        } else {
            to + (self.max - from) + 1
        }
    }

    /// Returns true if `a` is strictly behind `b`.
    ///
    /// Positions compare as serial numbers: whichever direction is shorter decides.
    /// Counters a thread compares are never half a domain apart.
    #[inline(always)]
    #[must_use]
    pub fn precedes(&self, a: usize, b: usize) -> bool {
        let d = self.distance(a, b);
        d != 0 && d <= self.max / 2
    }
}

/// Atomic position shared by all producers or all consumers.
pub struct Counter {
    value: CachePadded<AtomicUsize>,
}

impl Counter {
    #[must_use]
    pub fn new(start: usize) -> Self {
        Counter {
            value: CachePadded::new(AtomicUsize::new(start)),
        }
    }

    #[inline(always)]
    #[must_use]
    pub fn load(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    /// Moves the counter to the position after `filled`.
    ///
    /// `observed` is the counter value the caller last saw.
    /// If another thread already advanced the counter to the target or past it
    /// the advance is considered done.
    /// Returns true if this call moved the counter.
    pub fn advance(&self, seq: &Sequence, observed: usize, filled: usize) -> bool {
        let target = seq.next(filled);
        let mut current = observed;

        loop {
            match self.value.compare_exchange(current, target, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    if target == 0 {
                        tracing::debug!(max = seq.max(), "sequence counter wrapped");
                    }
                    return true;
                }
                Err(actual) => {
                    if actual == target || seq.precedes(target, actual) {
                        return false;
                    }
                    if seq.precedes(actual, current) {
                        invariant_violation("sequence counter moved backward");
                    }
                    current = actual;
                }
            }
        }
    }
}

#[test]
fn test_max_is_capacity_aligned() {
    for cap in [1, 2, 3, 5, 7, 64, 1000, 1 << 20] {
        let seq = Sequence::new(cap);
        assert_eq!((seq.max() + 1) % cap, 0);
        assert!(seq.max() < Sequence::LIMIT);
        assert!(Sequence::LIMIT - seq.max() <= cap);
    }

    assert_eq!(Sequence::new(1).max(), Sequence::LIMIT - 1);
    assert_eq!(Sequence::new(0).max(), 0);
}

#[test]
fn test_wrap_lands_on_lap_boundary() {
    let seq = Sequence::new(3);
    let last = seq.max();

    assert_eq!(seq.index(last), 2);
    assert_eq!(seq.lap(last), seq.max_lap());
    assert_eq!(seq.next(last), 0);
    assert_eq!(seq.next_lap(seq.max_lap()), 0);
    assert_eq!(seq.next_lap(4), 5);
}

#[test]
fn test_distance_across_wrap() {
    let seq = Sequence::new(4);
    let last = seq.max();

    assert_eq!(seq.distance(5, 5), 0);
    assert_eq!(seq.distance(5, 9), 4);
    assert_eq!(seq.distance(last, 0), 1);
    assert_eq!(seq.distance(last - 2, 1), 4);
    assert_eq!(seq.forward(last - 2, 4), 1);
    assert_eq!(seq.forward(7, 3), 10);

    assert!(seq.precedes(last, 0));
    assert!(!seq.precedes(0, last));
    assert!(!seq.precedes(3, 3));
    assert!(seq.precedes(3, 4));
}

#[test]
#[cfg(not(loom))]
fn test_advance_is_monotonic() {
    let seq = Sequence::new(2);
    let counter = Counter::new(4);

    assert!(counter.advance(&seq, 4, 4));
    assert_eq!(counter.load(), 5);

    // Stale helper arrives after the counter already moved.
    assert!(!counter.advance(&seq, 4, 4));
    assert_eq!(counter.load(), 5);

    // Stale observation, but target is still ahead.
    assert!(counter.advance(&seq, 4, 5));
    assert_eq!(counter.load(), 6);
}

#[test]
#[cfg(not(loom))]
fn test_advance_wraps_to_zero() {
    let seq = Sequence::new(5);
    let counter = Counter::new(seq.max());

    assert!(counter.advance(&seq, seq.max(), seq.max()));
    assert_eq!(counter.load(), 0);
    assert!(!counter.advance(&seq, seq.max(), seq.max()));
    assert_eq!(counter.load(), 0);
}
