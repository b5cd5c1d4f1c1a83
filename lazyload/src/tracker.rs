//! # Page State Tracker
//!
//! A [`PageTracker`] remembers, for every page of one segment, whether the
//! page has been serviced. It answers the question the fault handler asks on
//! every trap: is this the first touch of the page, or is the program
//! violating permissions that were already granted?
//!
//! The tracker is created on the segment's first fault, i.e. *inside* the
//! trap handler, at a moment when the loaded program owns the C heap and may
//! be in the middle of a `malloc`. Its storage therefore comes straight from a
//! private anonymous mapping instead of the allocator. Fresh anonymous memory
//! is zero-filled, so every entry starts out "unserviced" without an
//! initialization pass.
//!
//! Entries only ever go from unserviced to serviced.

use abyss::{Permission, Va, mman};
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};
use std::io;

/// Per-page "serviced" flags of one segment.
pub struct PageTracker {
    flags: NonNull<AtomicBool>,
    capacity: usize,
}

// SAFETY: the tracker exclusively owns its mapping and every access goes
// through atomics.
unsafe impl Send for PageTracker {}
unsafe impl Sync for PageTracker {}

impl PageTracker {
    /// Creates a tracker for `capacity` pages, all unserviced.
    ///
    /// # Errors
    /// Fails if the system refuses to map storage for the flags.
    pub fn new(capacity: usize) -> io::Result<Self> {
        if capacity == 0 {
            return Ok(Self {
                flags: NonNull::dangling(),
                capacity,
            });
        }
        let flags = mman::map_anonymous(capacity, Permission::READ | Permission::WRITE)?;
        Ok(Self {
            flags: flags.cast(),
            capacity,
        })
    }

    /// Number of pages tracked.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn entry(&self, page_index: usize) -> &AtomicBool {
        assert!(
            page_index < self.capacity,
            "page index {page_index} out of range for a tracker of {} pages",
            self.capacity
        );
        // SAFETY: in bounds, and the mapping lives as long as `self`.
        unsafe { &*self.flags.as_ptr().add(page_index) }
    }

    /// Returns `true` if the page has been serviced.
    ///
    /// # Panics
    /// Panics if `page_index >= capacity`.
    #[inline]
    pub fn is_serviced(&self, page_index: usize) -> bool {
        self.entry(page_index).load(Ordering::Acquire)
    }

    /// Records that the page has been serviced.
    ///
    /// # Panics
    /// Panics if `page_index >= capacity`.
    #[inline]
    pub fn mark_serviced(&self, page_index: usize) {
        self.entry(page_index).store(true, Ordering::Release);
    }

    /// Number of pages serviced so far.
    pub fn serviced_count(&self) -> usize {
        (0..self.capacity).filter(|&i| self.is_serviced(i)).count()
    }
}

impl core::fmt::Debug for PageTracker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTracker")
            .field("capacity", &self.capacity)
            .field("serviced", &self.serviced_count())
            .finish()
    }
}

impl Drop for PageTracker {
    fn drop(&mut self) {
        if self.capacity != 0 {
            unsafe {
                let _ = mman::unmap(Va::from_ptr(self.flags.as_ptr()), self.capacity);
            }
        }
    }
}
