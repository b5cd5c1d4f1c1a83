//! The abyss under the loader that talks to the operating system.
//!
//! This crate contains the collection of low-level primitives the demand
//! paging loader is built on: raw system calls, memory mappings, trap
//! (signal) installation, a log sink that may be used while a trap is being
//! serviced, and the architecture-specific jump into a loaded program.
//!
//! Most of the code here runs in one of two delicate contexts:
//! - **inside a trap handler**, where the C heap may belong to the guest
//!   program and only async-signal-safe operations are permitted;
//! - **right before control transfer**, where the current stack and registers
//!   are thrown away.
//!
//! The [`lazyload`] crate is expected to use these modules rather than
//! calling into `libc` on its own.
//!
//! [`lazyload`]: ../lazyload/index.html
#![allow(clippy::missing_safety_doc)]
#![deny(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("abyss only supports Linux.");

pub mod addressing;
pub mod kprint;
pub mod launch;
pub mod mman;
pub mod signal;
pub mod syscall;

pub use addressing::{PageSize, Va};
pub use mman::Permission;
