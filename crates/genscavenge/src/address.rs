//! Raw heap addresses.

use std::fmt;
use std::sync::atomic::AtomicUsize;

/// Size of a machine word in bytes.
pub const WORD: usize = std::mem::size_of::<usize>();

const _: () = assert!(WORD == 8, "the heap layout assumes 64-bit words");

/// Round `value` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// [`align_up`] returning `None` on overflow.
#[inline]
pub fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// An address in (or outside of) the managed heap. Zero is the null reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Address(usize);

impl Address {
    /// The null reference.
    pub const NULL: Address = Address(0);

    /// Wrap a raw address value.
    #[inline]
    pub const fn from_usize(value: usize) -> Self {
        Self(value)
    }

    /// Wrap a raw pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// The raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The address as a raw pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Whether this is the null reference.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// The address `bytes` past this one.
    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }

    /// The address `bytes` before this one.
    #[inline]
    pub const fn sub(self, bytes: usize) -> Self {
        Self(self.0 - bytes)
    }

    /// Distance in bytes from `base` up to this address.
    #[inline]
    pub const fn offset_from(self, base: Address) -> usize {
        self.0 - base.0
    }

    /// Whether the address is a multiple of `align`.
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        self.0 & (align - 1) == 0
    }

    /// Round down to a multiple of `align`.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        Self(align_down(self.0, align))
    }

    /// Read a word-sized value.
    ///
    /// # Safety
    /// The address must be valid for a word read and word aligned.
    #[inline]
    pub unsafe fn load_word(self) -> usize {
        // SAFETY: caller guarantees validity and alignment
        unsafe { std::ptr::read(self.as_ptr::<usize>()) }
    }

    /// Write a word-sized value.
    ///
    /// # Safety
    /// The address must be valid for a word write and word aligned.
    #[inline]
    pub unsafe fn store_word(self, value: usize) {
        // SAFETY: caller guarantees validity and alignment
        unsafe { std::ptr::write(self.as_ptr::<usize>(), value) }
    }

    /// Read a reference stored at this address.
    ///
    /// # Safety
    /// Same as [`Address::load_word`].
    #[inline]
    pub unsafe fn load_ref(self) -> Address {
        Address(unsafe { self.load_word() })
    }

    /// Store a reference at this address.
    ///
    /// # Safety
    /// Same as [`Address::store_word`].
    #[inline]
    pub unsafe fn store_ref(self, value: Address) {
        unsafe { self.store_word(value.0) }
    }

    /// View the word at this address as an atomic.
    ///
    /// # Safety
    /// The address must be valid and word aligned for the whole lifetime the
    /// caller uses the returned reference.
    #[inline]
    pub unsafe fn as_atomic_word<'a>(self) -> &'a AtomicUsize {
        // SAFETY: AtomicUsize has the same layout as usize
        unsafe { &*(self.as_ptr::<AtomicUsize>()) }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);

        let addr = Address::from_usize(0x1234);
        assert!(!addr.is_aligned_to(8));
        assert_eq!(addr.align_down(0x1000), Address::from_usize(0x1000));
        assert_eq!(addr.add(0x10).offset_from(addr), 0x10);
    }

    #[test]
    fn test_word_access() {
        let mut slot = 0usize;
        let addr = Address::from_ptr(&mut slot as *mut usize);
        unsafe {
            addr.store_ref(Address::from_usize(0x40));
            assert_eq!(addr.load_ref(), Address::from_usize(0x40));
        }
        assert_eq!(format!("{addr:?}"), format!("{:#x}", addr.as_usize()));
    }
}
