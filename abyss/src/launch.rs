//! Transfer of control into a loaded program.
//!
//! [`launch`] discards the current stack and register state and starts
//! executing at the program's entry point with the process-entry register
//! contract of the architecture:
//!
//! | Architecture | Stack pointer | Exit hook register | Frame registers |
//! | ------------ | ------------- | ------------------ | --------------- |
//! | x86_64       | `rsp` = `sp`  | `rdx` = 0          | `rbp` = 0       |
//! | aarch64      | `sp` = `sp`   | `x0` = 0           | `x29`, `x30` = 0 |
//!
//! The word at `sp` must be `argc`, followed by `argv`, `envp` and the
//! auxiliary vector as the System V ABI prescribes.

use crate::addressing::Va;

/// Starts executing at `entry` with the stack pointer set to `sp`.
///
/// # Safety
/// `entry` must be the entry point of a program whose image is reachable
/// (mapped, or serviced on demand) and `sp` must point at a well-formed
/// initial process stack aligned to 16 bytes. Nothing of the caller survives.
#[cfg(target_arch = "x86_64")]
pub unsafe fn launch(entry: Va, sp: Va) -> ! {
    unsafe {
        core::arch::asm!(
            "mov rsp, rdi",
            "xor ebp, ebp",
            "xor edx, edx",
            "jmp rsi",
            in("rdi") sp.into_usize(),
            in("rsi") entry.into_usize(),
            options(noreturn)
        )
    }
}

/// Starts executing at `entry` with the stack pointer set to `sp`.
///
/// # Safety
/// `entry` must be the entry point of a program whose image is reachable
/// (mapped, or serviced on demand) and `sp` must point at a well-formed
/// initial process stack aligned to 16 bytes. Nothing of the caller survives.
#[cfg(target_arch = "aarch64")]
pub unsafe fn launch(entry: Va, sp: Va) -> ! {
    unsafe {
        core::arch::asm!(
            "mov sp, x1",
            "mov x0, xzr",
            "mov x29, xzr",
            "mov x30, xzr",
            "br x2",
            in("x1") sp.into_usize(),
            in("x2") entry.into_usize(),
            options(noreturn)
        )
    }
}
