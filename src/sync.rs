use core::mem::MaybeUninit;

pub use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    sync::atomic::{AtomicUsize, Ordering},
};

#[cfg(feature = "std")]
pub use std::thread::yield_now;

/// Moves `value` into an uninitialized cell.
///
/// # Safety
///
/// Caller must have exclusive access to the cell and the cell must not hold a live value.
#[inline(always)]
pub unsafe fn write_cell<T>(cell: &UnsafeCell<MaybeUninit<T>>, value: T) {
    unsafe {
        (*cell.get()).write(value);
    }
}

/// Moves the value out of the cell, leaving it logically uninitialized.
///
/// # Safety
///
/// Caller must have exclusive access to the cell and the cell must hold a live value.
#[inline(always)]
pub unsafe fn take_cell<T>(cell: &UnsafeCell<MaybeUninit<T>>) -> T {
    unsafe { (*cell.get()).assume_init_read() }
}

/// # Safety
///
/// The cell must hold a live value.
#[inline(always)]
pub unsafe fn drop_cell<T>(cell: &mut UnsafeCell<MaybeUninit<T>>) {
    unsafe {
        cell.get_mut().assume_init_drop();
    }
}
