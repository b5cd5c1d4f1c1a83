//! [`StackBuilder`], a utility for constructing the initial process stack.
use crate::{Permission, Va};
use abyss::mman;
use std::io;
use thiserror::Error;

/// The stack ran out of room while being built.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("the initial stack is exhausted")]
pub struct StackExhausted;

/// A utility for constructing the initial stack of a program.
///
/// [`StackBuilder`] maps a fresh read/write stack and provides methods to
/// push and align data on it before the program starts. The stack grows
/// downward from the end of the mapping.
///
/// The mapping is never unmapped: once the program runs, it is the program's
/// stack.
///
/// # Usage
/// 1. **Create a new stack** using [`StackBuilder::new`].
/// 2. **Push data** (e.g., arguments, environment variables) onto the stack.
/// 3. **Align the stack** for proper memory layout.
/// 4. **Finalize the stack** using [`StackBuilder::finish`] to obtain the
///    initial stack pointer.
pub struct StackBuilder {
    base: Va,
    sp: Va,
}

impl StackBuilder {
    /// Maps a stack of `size` bytes.
    ///
    /// The stack pointer starts at the end of the mapping.
    pub fn new(size: usize) -> io::Result<Self> {
        let base = mman::map_anonymous(size, Permission::READ | Permission::WRITE)?;
        let base = Va::from_ptr(base.as_ptr());
        Ok(Self {
            base,
            sp: base + size,
        })
    }

    /// Consume the [`StackBuilder`] and return the stack pointer.
    pub fn finish(self) -> Va {
        self.sp
    }

    /// Returns the current stack pointer.
    ///
    /// The stack pointer (`sp`) indicates the top of the stack, where the next
    /// value would be pushed. The stack grows downward, meaning the pointer
    /// decreases as more data is pushed onto it.
    #[inline]
    pub fn sp(&self) -> Va {
        self.sp
    }

    /// Aligns the stack pointer down to `align` bytes, which must be a power
    /// of two.
    #[inline]
    pub fn align(&mut self, align: usize) -> Result<(), StackExhausted> {
        let aligned = Va::new(self.sp.into_usize() & !(align - 1));
        if aligned < self.base {
            return Err(StackExhausted);
        }
        self.sp = aligned;
        Ok(())
    }

    /// Pushes a byte array onto the stack.
    ///
    /// # Returns
    /// - The updated stack pointer, which is where the bytes start.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Result<Va, StackExhausted> {
        if self.sp - self.base < bytes.len() {
            return Err(StackExhausted);
        }
        self.sp -= bytes.len();
        // SAFETY: `[sp, sp + len)` lies in the mapping owned by the builder.
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.sp.as_mut_ptr(), bytes.len());
        }
        Ok(self.sp)
    }

    /// Pushes a `usize` value onto the stack.
    pub fn push_usize(&mut self, v: usize) -> Result<Va, StackExhausted> {
        self.push_bytes(&v.to_ne_bytes())
    }

    /// Pushes `s` as a C-style string (null-terminated) and returns the
    /// address of its first byte.
    #[inline]
    pub fn push_str(&mut self, s: &[u8]) -> Result<Va, StackExhausted> {
        // Make a space for null bytes ('\0').
        self.push_bytes(&[0])?;
        // Push the string slice.
        self.push_bytes(s)
    }

    /// Reads back the `usize` at `at`.
    #[cfg(test)]
    fn peek_usize(&self, at: Va) -> usize {
        unsafe { core::ptr::read_unaligned(at.as_mut_ptr().cast::<usize>()) }
    }
}
