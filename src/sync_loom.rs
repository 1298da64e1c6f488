use core::mem::MaybeUninit;

pub use loom::{
    cell::UnsafeCell,
    hint::spin_loop,
    sync::atomic::{AtomicUsize, Ordering},
    thread::yield_now,
};

#[inline(always)]
pub unsafe fn write_cell<T>(cell: &UnsafeCell<MaybeUninit<T>>, value: T) {
    cell.with_mut(|ptr| unsafe {
        (*ptr).write(value);
    });
}

#[inline(always)]
pub unsafe fn take_cell<T>(cell: &UnsafeCell<MaybeUninit<T>>) -> T {
    cell.with_mut(|ptr| unsafe { (*ptr).assume_init_read() })
}

#[inline(always)]
pub unsafe fn drop_cell<T>(cell: &mut UnsafeCell<MaybeUninit<T>>) {
    cell.with_mut(|ptr| unsafe { (*ptr).assume_init_drop() });
}
