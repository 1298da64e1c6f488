//! Slot store and per-slot generation lock.
//!
//! Every slot of the queue carries one atomic stamp.
//! The stamp says which lap the slot is ready for and whether it waits for a producer or a consumer.
//! While a thread moves a value in or out the stamp holds a lock sentinel instead.
//!
//! ```text
//! Free(L) --producer CAS--> Writing --store--> Occupied(L)
//! Occupied(L) --consumer CAS--> Reading --store--> Free(L + 1)
//! ```
//!
//! A value lives in the slot iff the stamp is `Occupied`, or `Reading` before the consumer took it.

use core::mem::{MaybeUninit, needs_drop};

use crate::sync::{AtomicUsize, Ordering, UnsafeCell, drop_cell, take_cell, write_cell};

const WRITING: usize = usize::MAX;
const READING: usize = usize::MAX - 1;
const OCCUPIED_BIT: usize = 1;

/// Decoded slot stamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stamp {
    /// Ready to receive the value of lap `L`.
    Free(usize),

    /// A producer is moving its value in.
    Writing,

    /// Holds the value of lap `L`.
    Occupied(usize),

    /// A consumer is moving the value out.
    Reading,
}

impl Stamp {
    #[inline(always)]
    fn encode(self) -> usize {
        match self {
            Stamp::Free(lap) => {
                debug_assert!(lap <= isize::MAX as usize);
                lap << 1
            }
            Stamp::Occupied(lap) => {
                debug_assert!(lap <= isize::MAX as usize);
                (lap << 1) | OCCUPIED_BIT
            }
            Stamp::Writing => WRITING,
            Stamp::Reading => READING,
        }
    }

    #[inline(always)]
    fn decode(raw: usize) -> Self {
        match raw {
            WRITING => Stamp::Writing,
            READING => Stamp::Reading,
            _ if raw & OCCUPIED_BIT == 0 => Stamp::Free(raw >> 1),
            _ => Stamp::Occupied(raw >> 1),
        }
    }
}

/// Kind of exclusive access taken on a slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lock {
    /// Taken by a producer on a `Free` slot.
    Write,

    /// Taken by a consumer on an `Occupied` slot.
    Read,
}

impl Lock {
    #[inline(always)]
    fn sentinel(self) -> Stamp {
        match self {
            Lock::Write => Stamp::Writing,
            Lock::Read => Stamp::Reading,
        }
    }
}

/// One cell of the ring.
pub struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    /// Creates an empty slot. `stamp` must be `Free`.
    #[must_use]
    pub fn new(stamp: Stamp) -> Self {
        debug_assert!(matches!(stamp, Stamp::Free(_)));
        Slot {
            stamp: AtomicUsize::new(stamp.encode()),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    #[must_use]
    #[inline(always)]
    pub fn stamp(&self) -> Stamp {
        Stamp::decode(self.stamp.load(Ordering::Acquire))
    }

    /// Attempts to lock slot that is expected to have `expected` stamp.
    ///
    /// On failure returns the stamp found in the slot.
    /// Losing this race is routine, caller decides what the found stamp means for it.
    ///
    /// # Errors
    ///
    /// Returns the current stamp if it differs from `expected`.
    #[inline(always)]
    pub fn try_lock(&self, expected: Stamp, lock: Lock) -> Result<(), Stamp> {
        debug_assert!(matches!(
            (expected, lock),
            (Stamp::Free(_), Lock::Write) | (Stamp::Occupied(_), Lock::Read)
        ));

        match self.stamp.compare_exchange(
            expected.encode(),
            lock.sentinel().encode(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(raw) => Err(Stamp::decode(raw)),
        }
    }

    /// Releases the lock publishing `next` stamp.
    ///
    /// Must only be called by the thread that holds the lock.
    #[inline(always)]
    pub fn unlock(&self, next: Stamp) {
        debug_assert!(matches!(next, Stamp::Free(_) | Stamp::Occupied(_)));
        debug_assert!(matches!(self.stamp(), Stamp::Writing | Stamp::Reading));
        self.stamp.store(next.encode(), Ordering::Release);
    }

    /// Moves value into the slot.
    ///
    /// # Safety
    ///
    /// Caller must hold the write lock.
    #[inline(always)]
    pub unsafe fn write(&self, value: T) {
        debug_assert_eq!(self.stamp(), Stamp::Writing);
        // Safety: write lock is exclusive and a `Free` slot holds no value.
        unsafe { write_cell(&self.value, value) }
    }

    /// Moves value out of the slot.
    ///
    /// # Safety
    ///
    /// Caller must hold the read lock.
    #[inline(always)]
    pub unsafe fn take(&self) -> T {
        debug_assert_eq!(self.stamp(), Stamp::Reading);
        // Safety: read lock is exclusive and it is only granted on `Occupied` slot.
        unsafe { take_cell(&self.value) }
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        if !needs_drop::<T>() {
            return;
        }

        // With exclusive access no thread can be in the middle of a transition.
        if let Stamp::Occupied(_) = self.stamp() {
            // Safety: `Occupied` slot always holds a value.
            unsafe { drop_cell(&mut self.value) }
        }
    }
}

#[test]
fn test_stamp_encoding_keeps_lap() {
    let max_lap = isize::MAX as usize - 1;
    for stamp in [
        Stamp::Free(0),
        Stamp::Free(7),
        Stamp::Free(max_lap),
        Stamp::Occupied(0),
        Stamp::Occupied(7),
        Stamp::Occupied(max_lap),
        Stamp::Writing,
        Stamp::Reading,
    ] {
        assert_eq!(Stamp::decode(stamp.encode()), stamp);
    }
}

#[test]
#[cfg(all(feature = "std", not(loom)))]
fn test_slot_lap_cycle() {
    let slot = Slot::new(Stamp::Free(0));

    assert_eq!(slot.try_lock(Stamp::Occupied(0), Lock::Read), Err(Stamp::Free(0)));
    assert_eq!(slot.try_lock(Stamp::Free(1), Lock::Write), Err(Stamp::Free(0)));

    slot.try_lock(Stamp::Free(0), Lock::Write).unwrap();
    assert_eq!(slot.try_lock(Stamp::Free(0), Lock::Write), Err(Stamp::Writing));
    unsafe { slot.write(String::from("a")) };
    slot.unlock(Stamp::Occupied(0));

    assert_eq!(slot.try_lock(Stamp::Free(0), Lock::Write), Err(Stamp::Occupied(0)));

    slot.try_lock(Stamp::Occupied(0), Lock::Read).unwrap();
    assert_eq!(slot.try_lock(Stamp::Occupied(0), Lock::Read), Err(Stamp::Reading));
    assert_eq!(unsafe { slot.take() }, "a");
    slot.unlock(Stamp::Free(1));

    assert_eq!(slot.stamp(), Stamp::Free(1));
}

#[test]
#[cfg(not(loom))]
fn test_dropping_occupied_slot_drops_value() {
    use core::cell::Cell;

    struct Tracked<'a>(&'a Cell<usize>);

    impl Drop for Tracked<'_> {
        fn drop(&mut self) {
            self.0.set(self.0.get() + 1);
        }
    }

    let drops = Cell::new(0);

    let empty = Slot::<Tracked<'_>>::new(Stamp::Free(3));
    drop(empty);
    assert_eq!(drops.get(), 0);

    let slot = Slot::new(Stamp::Free(3));
    slot.try_lock(Stamp::Free(3), Lock::Write).unwrap();
    unsafe { slot.write(Tracked(&drops)) };
    slot.unlock(Stamp::Occupied(3));
    drop(slot);
    assert_eq!(drops.get(), 1);
}
