//! Virtual Memory Addressing.
//!
//! This module provides the abstraction for a virtual address of the running
//! process ([`Va`]) and for the page granularity of the system ([`PageSize`]).
//!
//! Every address and size is kept at full pointer width. A loaded program may
//! live anywhere in the 64-bit address space, and truncating an address (or
//! comparing it as a signed quantity) silently breaks boundary checks near
//! the top of a segment.
//!
//! ## Arithmetic Operations
//!
//! [`Va`] supports addition and subtraction with `usize` offsets, and the
//! difference of two addresses yields the distance between them in bytes.
//! Page arithmetic always takes a [`PageSize`], because the page size is a
//! property of the running system rather than a compile-time constant.
//!
//! ## Example Usage:
//!
//! ```
//! use abyss::addressing::{PageSize, Va};
//!
//! let page_size = PageSize::new(0x1000).unwrap();
//! let va = Va::new(0x1234_5678);
//! assert_eq!(va.page_down(page_size), Va::new(0x1234_5000));
//! assert_eq!(va.offset(page_size), 0x678);
//! ```

use core::fmt;

/// The page size assumed when the system does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 0x1000;

/// The granularity at which memory is mapped and protected.
///
/// A [`PageSize`] is always a non-zero power of two, which is what makes
/// masking arithmetic in [`Va::page_down`] valid.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PageSize(usize);

impl PageSize {
    /// Creates a page size from a byte count.
    ///
    /// # Returns
    /// - `Some(PageSize)` if `bytes` is a non-zero power of two.
    /// - `None` otherwise.
    #[inline]
    pub const fn new(bytes: usize) -> Option<Self> {
        if bytes.is_power_of_two() {
            Some(Self(bytes))
        } else {
            None
        }
    }

    /// Queries the page size of the running system.
    ///
    /// Falls back to [`DEFAULT_PAGE_SIZE`] if the system reports a nonsensical
    /// value.
    pub fn host() -> Self {
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(reported)
            .ok()
            .and_then(Self::new)
            .unwrap_or(Self(DEFAULT_PAGE_SIZE))
    }

    /// Returns the page size in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        self.0
    }

    /// Returns the mask that extracts the in-page offset of an address.
    #[inline]
    pub const fn mask(self) -> usize {
        self.0 - 1
    }

    /// Rounds `value` down to a multiple of the page size.
    #[inline]
    pub const fn align_down(self, value: usize) -> usize {
        value & !self.mask()
    }

    /// Rounds `value` up to a multiple of the page size.
    ///
    /// Returns `None` if the result does not fit in a `usize`.
    #[inline]
    pub const fn align_up(self, value: usize) -> Option<usize> {
        match value.checked_add(self.mask()) {
            Some(v) => Some(v & !self.mask()),
            None => None,
        }
    }

    /// Returns the number of pages needed to cover `len` bytes.
    #[inline]
    pub const fn pages_for(self, len: usize) -> usize {
        len.div_ceil(self.0)
    }
}

impl fmt::Debug for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageSize(0x{:x})", self.0)
    }
}

/// Represents a virtual address.
///
/// The [`Va`] (Virtual Address) struct represents an address in the virtual
/// memory space of the running process, either an address of the loader
/// itself or of the program it loads.
///
/// This abstraction provides utility methods for alignment and address
/// manipulation, ensuring consistent handling of virtual addresses.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// The virtual address `0`.
    pub const ZERO: Self = Self(0);

    /// Creates a new virtual address.
    #[inline(always)]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Creates a virtual address from a raw pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw `usize` representation of the virtual address.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// Returns the address as a raw mutable byte pointer.
    #[inline]
    pub const fn as_mut_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }

    /// Aligns the virtual address down to the start of its page.
    #[inline]
    pub const fn page_down(self, page_size: PageSize) -> Self {
        Self(page_size.align_down(self.0))
    }

    /// Aligns the virtual address up to the next page boundary.
    ///
    /// Returns `None` if the rounded address overflows.
    #[inline]
    pub const fn page_up(self, page_size: PageSize) -> Option<Self> {
        match page_size.align_up(self.0) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Extracts the offset within the page from the virtual address.
    #[inline]
    pub const fn offset(self, page_size: PageSize) -> usize {
        self.0 & page_size.mask()
    }

    /// Adds `bytes` to the address, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl core::ops::Add<usize> for Va {
    type Output = Self;

    fn add(self, other: usize) -> Self::Output {
        Self(self.0 + other)
    }
}

impl core::ops::AddAssign<usize> for Va {
    fn add_assign(&mut self, other: usize) {
        self.0 += other
    }
}

impl core::ops::Sub<usize> for Va {
    type Output = Self;

    fn sub(self, other: usize) -> Self::Output {
        Self(self.0 - other)
    }
}

impl core::ops::Sub<Self> for Va {
    type Output = usize;

    fn sub(self, other: Self) -> Self::Output {
        self.0 - other.0
    }
}

impl core::ops::SubAssign<usize> for Va {
    fn sub_assign(&mut self, other: usize) {
        self.0 -= other
    }
}

impl fmt::Debug for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Va(0x{:x})", self.0)
    }
}

impl fmt::Display for Va {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_must_be_power_of_two() {
        assert!(PageSize::new(0).is_none(), "zero is not a page size");
        assert!(PageSize::new(0x1800).is_none(), "0x1800 is not a power of two");
        assert_eq!(PageSize::new(0x4000).map(PageSize::bytes), Some(0x4000));
        assert!(PageSize::host().bytes().is_power_of_two());
    }

    #[test]
    fn alignment() {
        let ps = PageSize::new(0x1000).unwrap();
        let va = Va::new(0x1500);
        assert_eq!(va.page_down(ps), Va::new(0x1000));
        assert_eq!(va.page_up(ps), Some(Va::new(0x2000)));
        assert_eq!(Va::new(0x2000).page_up(ps), Some(Va::new(0x2000)));
        assert_eq!(va.offset(ps), 0x500);
        assert_eq!(Va::new(usize::MAX).page_up(ps), None);
        assert_eq!(ps.pages_for(0x2000), 2);
        assert_eq!(ps.pages_for(0x2001), 3);
        assert_eq!(ps.pages_for(0), 0);
    }

    #[test]
    fn addresses_keep_full_width() {
        let high = Va::new(0x7fff_ffff_f000);
        assert_eq!(high + 0x800, Va::new(0x7fff_ffff_f800));
        assert_eq!(Va::new(0x7fff_ffff_f800) - high, 0x800);
        assert_eq!(Va::new(usize::MAX).checked_add(1), None);
    }
}
