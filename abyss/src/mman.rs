//! Memory mappings of the running process.
//!
//! Every function here is a thin layer over [`crate::syscall`] and is safe to
//! call while a trap is being serviced.

use crate::addressing::Va;
use crate::syscall::{self, Errno};
use core::ffi::c_void;
use core::ptr::NonNull;
use std::io;

bitflags::bitflags! {
    /// Possible memory permissions for a page.
    ///
    /// The [`Permission`] allows you to specify memory access permissions
    /// such as:
    /// - Whether a page is readable.
    /// - Whether a page is writable.
    /// - Whether a page is executable.
    ///
    /// An empty set makes every access to the page trap.
    pub struct Permission: u32 {
        /// Page is readable.
        const READ = 1 << 0;

        /// Page is writable.
        const WRITE = 1 << 1;

        /// Page is executable.
        const EXECUTABLE = 1 << 2;
    }
}

impl Permission {
    /// Translates the permission into `PROT_*` bits understood by `mmap(2)`
    /// and `mprotect(2)`.
    pub fn into_prot(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.contains(Permission::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Permission::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Permission::EXECUTABLE) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl core::fmt::Display for Permission {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let flag = |p: Permission, c: char| if self.contains(p) { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Permission::READ, 'r'),
            flag(Permission::WRITE, 'w'),
            flag(Permission::EXECUTABLE, 'x')
        )
    }
}

/// Maps `len` bytes of fresh zero-filled anonymous memory at exactly `base`.
///
/// # Safety
/// Anything already mapped in `[base, base + len)` is replaced.
pub unsafe fn map_fixed(base: Va, len: usize, perm: Permission) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        syscall::mmap(
            base.as_mut_ptr().cast(),
            len,
            perm.into_prot(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    }?;
    NonNull::new(addr.cast()).ok_or_else(|| io::Error::from(Errno(libc::EINVAL)))
}

/// Reserves `[base, base + len)` with an inaccessible mapping.
///
/// Fails with `EEXIST` instead of replacing an existing mapping.
pub fn reserve(base: Va, len: usize) -> io::Result<()> {
    let addr = unsafe {
        syscall::mmap(
            base.as_mut_ptr().cast(),
            len,
            libc::PROT_NONE,
            libc::MAP_PRIVATE
                | libc::MAP_ANONYMOUS
                | libc::MAP_NORESERVE
                | libc::MAP_FIXED_NOREPLACE,
            -1,
            0,
        )
    }?;
    if Va::from_ptr(addr) != base {
        // Kernels older than 4.17 treat the no-replace flag as a mere hint.
        unsafe {
            let _ = syscall::munmap(addr, len);
        }
        return Err(Errno(libc::EEXIST).into());
    }
    Ok(())
}

/// Maps `len` bytes of zero-filled anonymous memory wherever the kernel
/// chooses.
pub fn map_anonymous(len: usize, perm: Permission) -> io::Result<NonNull<u8>> {
    let addr = unsafe {
        syscall::mmap(
            core::ptr::null_mut(),
            len,
            perm.into_prot(),
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    }?;
    NonNull::new(addr.cast()).ok_or_else(|| io::Error::from(Errno(libc::EINVAL)))
}

/// Changes the protection of `[base, base + len)` to `perm`.
///
/// # Safety
/// Revoking access to memory that Rust code still references is undefined
/// behavior.
pub unsafe fn protect(base: Va, len: usize, perm: Permission) -> io::Result<()> {
    unsafe { syscall::mprotect(base.as_mut_ptr().cast::<c_void>(), len, perm.into_prot()) }
        .map_err(io::Error::from)
}

/// Removes the mapping of `[base, base + len)`.
///
/// # Safety
/// The range must not be referenced after it is unmapped.
pub unsafe fn unmap(base: Va, len: usize) -> io::Result<()> {
    unsafe { syscall::munmap(base.as_mut_ptr().cast::<c_void>(), len) }.map_err(io::Error::from)
}
