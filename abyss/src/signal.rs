//! Trap (signal) plumbing.
//!
//! A trap on an invalid memory access is delivered as `SIGSEGV`. This module
//! installs a handler for it, provides an alternate stack to run the handler
//! on, and offers the two ways out of a handler that cannot resume:
//! escalating to the default behavior and terminating outright.

use crate::addressing::Va;
use crate::mman::{self, Permission};
use crate::syscall;
use core::ffi::{c_int, c_void};
use num_enum::TryFromPrimitive;
use std::io;

/// The signature of a handler installed with [`install`].
pub type TrapHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// Reason of a `SIGSEGV` reported by the kernel in `si_code`.
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
pub enum SegvCode {
    /// Address not mapped to object.
    MapErr = 1,
    /// Invalid permissions for mapped object.
    AccErr = 2,
}

/// A trap as delivered to the handler.
#[derive(Clone, Copy, Debug)]
pub struct TrapInfo {
    /// The signal number.
    pub signal: c_int,
    /// The raw `si_code` of the signal.
    pub code: c_int,
    /// The faulting address.
    pub address: Va,
}

impl TrapInfo {
    /// Decodes the trap from the raw handler arguments.
    ///
    /// # Safety
    /// `info` must be the `siginfo_t` pointer the kernel handed to an
    /// `SA_SIGINFO` handler, or null.
    pub unsafe fn from_raw(signal: c_int, info: *const libc::siginfo_t) -> Self {
        match unsafe { info.as_ref() } {
            Some(info) => Self {
                signal,
                code: info.si_code,
                address: Va::from_ptr(unsafe { info.si_addr() }),
            },
            None => Self {
                signal,
                code: 0,
                address: Va::ZERO,
            },
        }
    }

    /// Returns the reason of an invalid memory access, or `None` if this trap
    /// is of any other class (another signal, or a `SIGSEGV` sent by a
    /// process rather than raised by the memory subsystem).
    pub fn invalid_access(&self) -> Option<SegvCode> {
        if self.signal != libc::SIGSEGV {
            return None;
        }
        SegvCode::try_from(self.code).ok()
    }
}

fn sigaction(signal: c_int, handler: libc::sighandler_t, flags: c_int) -> io::Result<()> {
    let mut action: libc::sigaction = unsafe { core::mem::zeroed() };
    action.sa_sigaction = handler;
    action.sa_flags = flags;
    let rc = unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        libc::sigaction(signal, &action, core::ptr::null_mut())
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Installs `handler` for `signal`, running on the alternate stack if one is
/// set up.
pub fn install(signal: c_int, handler: TrapHandler) -> io::Result<()> {
    sigaction(
        signal,
        handler as libc::sighandler_t,
        libc::SA_SIGINFO | libc::SA_ONSTACK,
    )
}

/// Restores the default disposition of `signal`.
///
/// Returning from a `SIGSEGV` handler after this re-executes the faulting
/// access, and the kernel then terminates the process the default way. Safe
/// to call from a trap handler: it issues the system call directly and never
/// touches `errno`.
pub fn restore_default(signal: c_int) -> io::Result<()> {
    syscall::reset_signal(signal).map_err(io::Error::from)
}

/// Maps a stack of `size` bytes and registers it as the alternate signal
/// stack of the calling thread.
pub fn install_alternate_stack(size: usize) -> io::Result<()> {
    let size = size.max(libc::SIGSTKSZ);
    let base = mman::map_anonymous(size, Permission::READ | Permission::WRITE)?;
    let stack = libc::stack_t {
        ss_sp: base.as_ptr().cast(),
        ss_flags: 0,
        ss_size: size,
    };
    if unsafe { libc::sigaltstack(&stack, core::ptr::null_mut()) } == 0 {
        Ok(())
    } else {
        let e = io::Error::last_os_error();
        unsafe {
            let _ = mman::unmap(Va::from_ptr(base.as_ptr()), size);
        }
        Err(e)
    }
}

/// Terminates the process immediately with `status`, without running any
/// exit hook.
pub fn exit_immediately(status: i32) -> ! {
    syscall::exit_group(status)
}

/// Terminates the process by `signal` with its default action.
///
/// Falls back to exiting with `128 + signal` if the signal does not kill the
/// process.
pub fn terminate_by(signal: c_int) -> ! {
    let _ = restore_default(signal);
    let _ = syscall::kill(syscall::getpid(), signal);
    syscall::exit_group(128 + signal)
}
