//! # Lap Queue
//!
//! Bounded, array-backed, lock-free multi-producer multi-consumer queue.
//!
//! Any number of threads may call [`ArrayQueue::offer`] and [`ArrayQueue::poll`] concurrently.
//! Threads coordinate only through compare-and-swap on two shared counters and on one stamp per slot.
//! No mutex is taken and no call ever blocks, a full or empty queue is reported immediately.
//!
//! ## Available Algorithms
//!
//! ### 📦 Array Queue
//! Fixed-capacity ring of slots.
//! Every slot carries a generation stamp that tells which lap around the ring may write or read it.
//! This keeps a slow producer from overwriting a value a slow consumer has not read yet,
//! and a slow consumer from reading a slot that was already recycled.
//! **Feature:** `alloc`
//!
//! #### Examples
//!
//! ```rust
//! # #[cfg(feature = "std")]
//! # {
//! use lap_queue::ArrayQueue;
//!
//! let queue = ArrayQueue::new(2);
//!
//! assert!(queue.offer("A"));
//! assert!(queue.offer("B"));
//! // Queue is full.
//! assert!(!queue.offer("C"));
//!
//! assert_eq!(queue.poll(), Some("A"));
//! assert_eq!(queue.poll(), Some("B"));
//! assert_eq!(queue.poll(), None);
//! # }
//! ```
//!
//! Sharing the queue between threads only takes a shared reference:
//!
//! ```rust
//! # #[cfg(feature = "std")]
//! # {
//! use lap_queue::ArrayQueue;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let queue = ArrayQueue::new(16);
//! let received = AtomicUsize::new(0);
//!
//! std::thread::scope(|scope| {
//!     for producer in 0..4 {
//!         let queue = &queue;
//!         scope.spawn(move || {
//!             for i in 0..100 {
//!                 let mut value = producer * 100 + i;
//!                 // `try_offer` hands the value back when the queue is full.
//!                 while let Err(err) = queue.try_offer(value) {
//!                     value = err.into_inner();
//!                     std::thread::yield_now();
//!                 }
//!             }
//!         });
//!     }
//!
//!     for _ in 0..2 {
//!         let (queue, received) = (&queue, &received);
//!         scope.spawn(move || {
//!             while received.load(Ordering::Relaxed) < 400 {
//!                 match queue.poll() {
//!                     Some(_) => {
//!                         received.fetch_add(1, Ordering::Relaxed);
//!                     }
//!                     None => std::thread::yield_now(),
//!                 }
//!             }
//!         });
//!     }
//! });
//!
//! assert_eq!(received.into_inner(), 400);
//! assert!(queue.is_empty());
//! # }
//! ```
//!
//! Under contention the queue is not strictly FIFO, concurrent offers may land in either order.
//! Offers that do not overlap in time are polled in the order they completed.
//!
//! ### 🔄 Backoff
//! Spin and yield helper used by the retry loops.
//! `spin` backs off before re-reading a counter that moved under us,
//! `snooze` waits for a peer in the middle of a slot transition and eventually yields the thread.
//!
//! ### 🌀 Cache
//! `CachePadded` keeps producer and consumer counters on separate cache lines.
//!
//! ### 🔢 Sequence and Slot
//! Building blocks of the queue, public for reuse in similar ring algorithms.
//! `Sequence` does capacity-aligned position arithmetic with wrap to zero,
//! `Counter` is the forward-only atomic position,
//! `Slot` is a cell with the generation lock.
//!
//! ## `no-std` support
//!
//! Crate is `no_std` without the `std` feature.
//! The queue only needs `alloc`, for a single allocation of its slots at construction.
//! Without `std` the backoff never yields the thread and only spins.
//!
//! ## Testing with loom
//!
//! Model-checked tests run with `RUSTFLAGS="--cfg loom" cargo test --release`.

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(clippy::pedantic)]
#![allow(clippy::inline_always)]

#[cfg(feature = "alloc")]
extern crate alloc;

pub mod backoff;
pub mod cache;
pub mod sequence;
pub mod slot;

#[cfg(feature = "alloc")]
pub mod array_queue;

#[cfg(not(loom))]
mod sync;

#[cfg(loom)]
#[path = "sync_loom.rs"]
mod sync;

#[cfg(feature = "alloc")]
pub use self::array_queue::{ArrayQueue, OfferError};

#[cold]
#[inline(never)]
fn capacity_overflow() -> ! {
    panic!("capacity overflow");
}

// Reached only if the slot protocol is broken.
#[cold]
#[inline(never)]
#[track_caller]
fn invariant_violation(what: &'static str) -> ! {
    tracing::error!(what, "queue invariant violated");
    panic!("queue invariant violated: {what}");
}
