//! Raw Linux system calls.
//!
//! The wrappers in this module issue the system call instruction directly
//! instead of going through the C library. Once a loaded program runs, it owns
//! the thread pointer and the C library's per-thread state (most notably
//! `errno`), so the trap handler must not rely on any of them. A raw system
//! call reports failure as a negative return value and never touches
//! thread-local storage.

use core::ffi::c_void;
use std::io;

/// Execute a system call instruction with given arguments.
///
/// Evaluates to the raw `isize` result. A value in `-4095..=-1` is a negated
/// error number.
#[cfg(target_arch = "x86_64")]
#[macro_export]
macro_rules! syscall {
    ($nr:expr) => {
        $crate::syscall!($nr, 0, 0, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr) => {
        $crate::syscall!($nr, $a1, 0, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr) => {
        $crate::syscall!($nr, $a1, $a2, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, $a4, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, $a4, $a5, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr, $a6:expr) => {{
        let mut result: isize;
        #[allow(unused_unsafe)]
        unsafe {
            core::arch::asm!(
                "syscall",
                inlateout("rax") ($nr) as isize => result,
                in("rdi") ($a1) as usize,
                in("rsi") ($a2) as usize,
                in("rdx") ($a3) as usize,
                in("r10") ($a4) as usize,
                in("r8") ($a5) as usize,
                in("r9") ($a6) as usize,
                lateout("rcx") _,
                lateout("r11") _,
                options(nostack)
            );
        }
        result
    }};
}

/// Execute a system call instruction with given arguments.
///
/// Evaluates to the raw `isize` result. A value in `-4095..=-1` is a negated
/// error number.
#[cfg(target_arch = "aarch64")]
#[macro_export]
macro_rules! syscall {
    ($nr:expr) => {
        $crate::syscall!($nr, 0, 0, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr) => {
        $crate::syscall!($nr, $a1, 0, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr) => {
        $crate::syscall!($nr, $a1, $a2, 0, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, 0, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, $a4, 0, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr) => {
        $crate::syscall!($nr, $a1, $a2, $a3, $a4, $a5, 0)
    };
    ($nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr, $a6:expr) => {{
        let mut result: isize;
        #[allow(unused_unsafe)]
        unsafe {
            core::arch::asm!(
                "svc 0",
                in("x8") ($nr) as usize,
                inlateout("x0") ($a1) as isize => result,
                in("x1") ($a2) as usize,
                in("x2") ($a3) as usize,
                in("x3") ($a4) as usize,
                in("x4") ($a5) as usize,
                in("x5") ($a6) as usize,
                options(nostack)
            );
        }
        result
    }};
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("abyss issues raw system calls only on x86_64 and aarch64.");

/// An error number returned by a raw system call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Errno(pub i32);

impl From<Errno> for io::Error {
    fn from(e: Errno) -> Self {
        io::Error::from_raw_os_error(e.0)
    }
}

/// Splits a raw system call result into a value or an [`Errno`].
#[inline]
pub fn check(ret: isize) -> Result<usize, Errno> {
    if (-4095..0).contains(&ret) {
        Err(Errno(-ret as i32))
    } else {
        Ok(ret as usize)
    }
}

/// `write(2)` the whole buffer, retrying on partial writes and `EINTR`.
pub fn write_all(fd: i32, mut bytes: &[u8]) -> Result<(), Errno> {
    while !bytes.is_empty() {
        match check(syscall!(libc::SYS_write, fd, bytes.as_ptr(), bytes.len())) {
            Ok(0) => return Err(Errno(libc::EIO)),
            Ok(n) => bytes = &bytes[n..],
            Err(Errno(libc::EINTR)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// `pread(2)` into `buf` at `offset`.
///
/// Returns the number of bytes read, which may be less than `buf.len()`.
pub fn pread(fd: i32, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
    loop {
        match check(syscall!(
            libc::SYS_pread64,
            fd,
            buf.as_mut_ptr(),
            buf.len(),
            offset
        )) {
            Err(Errno(libc::EINTR)) => continue,
            r => return r,
        }
    }
}

/// `mmap(2)`.
///
/// # Safety
/// A `MAP_FIXED` mapping silently replaces whatever was mapped at `addr`.
pub unsafe fn mmap(
    addr: *mut c_void,
    len: usize,
    prot: i32,
    flags: i32,
    fd: i32,
    offset: u64,
) -> Result<*mut c_void, Errno> {
    check(syscall!(libc::SYS_mmap, addr, len, prot, flags, fd, offset)).map(|v| v as *mut c_void)
}

/// `mprotect(2)`.
///
/// # Safety
/// Revoking access to memory that is still referenced is undefined behavior.
pub unsafe fn mprotect(addr: *mut c_void, len: usize, prot: i32) -> Result<(), Errno> {
    check(syscall!(libc::SYS_mprotect, addr, len, prot)).map(|_| ())
}

/// `munmap(2)`.
///
/// # Safety
/// The range must not be referenced after it is unmapped.
pub unsafe fn munmap(addr: *mut c_void, len: usize) -> Result<(), Errno> {
    check(syscall!(libc::SYS_munmap, addr, len)).map(|_| ())
}

/// The kernel's `struct sigaction`, which differs from the C library's.
#[repr(C)]
struct KernelSigaction {
    handler: usize,
    flags: u64,
    restorer: usize,
    mask: u64,
}

/// `rt_sigaction(2)` resetting `signal` to its default action.
///
/// A default action needs no restorer, so the kernel structure can be
/// filled in directly.
pub fn reset_signal(signal: i32) -> Result<(), Errno> {
    let action = KernelSigaction {
        handler: libc::SIG_DFL,
        flags: 0,
        restorer: 0,
        mask: 0,
    };
    check(syscall!(
        libc::SYS_rt_sigaction,
        signal,
        core::ptr::addr_of!(action),
        0,
        core::mem::size_of::<u64>()
    ))
    .map(|_| ())
}

/// `getpid(2)`.
#[inline]
pub fn getpid() -> i32 {
    syscall!(libc::SYS_getpid) as i32
}

/// `kill(2)`.
#[inline]
pub fn kill(pid: i32, signal: i32) -> Result<(), Errno> {
    check(syscall!(libc::SYS_kill, pid, signal)).map(|_| ())
}

/// `exit_group(2)`: terminate every thread of the process with `status`.
pub fn exit_group(status: i32) -> ! {
    loop {
        syscall!(libc::SYS_exit_group, status);
    }
}
