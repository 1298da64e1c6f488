use core::ops::{Deref, DerefMut};

/// Keeps a value on its own cache line.
///
/// Queue counters are written by different groups of threads,
/// producers bump `tail` and consumers bump `head`.
/// Sharing a line between them would make every successful offer invalidate
/// the line consumers are spinning on and vice versa.
///
/// Assumed line sizes:
/// - `x86_64`, aarch64 and powerpc64: 128 bytes, adjacent-line prefetch pulls pairs of 64-byte lines.
/// - arm, mips, sparc and hexagon: 32 bytes.
/// - m68k: 16 bytes.
/// - s390x: 256 bytes.
/// - anything else: 64 bytes.
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64"
    ),
    repr(align(128))
)]
#[cfg_attr(
    any(
        target_arch = "arm",
        target_arch = "mips",
        target_arch = "mips32r6",
        target_arch = "mips64",
        target_arch = "mips64r6",
        target_arch = "sparc",
        target_arch = "hexagon"
    ),
    repr(align(32))
)]
#[cfg_attr(target_arch = "m68k", repr(align(16)))]
#[cfg_attr(target_arch = "s390x", repr(align(256)))]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "arm",
        target_arch = "mips",
        target_arch = "mips32r6",
        target_arch = "mips64",
        target_arch = "mips64r6",
        target_arch = "sparc",
        target_arch = "hexagon",
        target_arch = "m68k",
        target_arch = "s390x",
    )),
    repr(align(64))
)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CachePadded<T>(pub T);

impl<T> CachePadded<T> {
    #[inline(always)]
    #[must_use]
    pub const fn new(value: T) -> Self {
        CachePadded(value)
    }

    #[inline(always)]
    #[must_use]
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline(always)]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline(always)]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

#[test]
fn test_padded_counters_do_not_share_line() {
    let pair = [CachePadded::new(0u64), CachePadded::new(0u64)];
    let first = core::ptr::from_ref(&pair[0]) as usize;
    let second = core::ptr::from_ref(&pair[1]) as usize;
    assert!(second - first >= core::mem::align_of::<CachePadded<u64>>());
    assert!(core::mem::align_of::<CachePadded<u64>>() >= 16);
}
