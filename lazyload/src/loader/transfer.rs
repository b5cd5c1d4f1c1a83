//! Transferring control to a loaded program.
//!
//! A statically-linked program expects the kernel's process-entry state: the
//! stack pointer points at `argc`, followed by the `argv` and `envp` pointer
//! arrays and the auxiliary vector, with the strings they refer to stored
//! further up the stack.
//!
//! **Example stack layout for `hello world`:**
//!
//! | Address (growing up) | Data                                        |
//! | -------------------- | ------------------------------------------- |
//! | `sp`                 | `argc` = 2                                  |
//! | `sp + 8`             | `argv[0]`, `argv[1]`, `NULL`                |
//! |                      | `envp[0]`, ..., `NULL`                      |
//! |                      | auxiliary vector pairs, ..., `AT_NULL`, 0   |
//! |                      | padding (16-byte alignment)                 |
//! |                      | 16 random bytes (`AT_RANDOM`)               |
//! |                      | `"hello\0"`, `"world\0"`, environment, ...  |
//! | end of stack         |                                             |
//!
//! The C runtime of the program reads its TLS template through `AT_PHDR`, its
//! stack protector canary from `AT_RANDOM` and the page size from
//! `AT_PAGESZ`. Entries the loader cannot compute itself (hardware
//! capabilities, the vDSO, the clock tick) are forwarded from the loader's
//! own auxiliary vector.

use super::stack_builder::{StackBuilder, StackExhausted};
use crate::{Config, LoaderError, Va, segment::SegmentTable};
use num_enum::IntoPrimitive;
use std::{
    convert::Infallible,
    ffi::{OsStr, OsString},
    os::unix::ffi::OsStrExt,
};

/// Types of auxiliary vector entries.
#[repr(usize)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive)]
pub enum AuxType {
    /// End of the vector.
    Null = 0,
    /// Address of the program headers.
    Phdr = 3,
    /// Size of one program header.
    Phent = 4,
    /// Number of program headers.
    Phnum = 5,
    /// Page size.
    Pagesz = 6,
    /// Entry point of the program.
    Entry = 9,
    /// Real user id.
    Uid = 11,
    /// Effective user id.
    Euid = 12,
    /// Real group id.
    Gid = 13,
    /// Effective group id.
    Egid = 14,
    /// Hardware capabilities.
    Hwcap = 16,
    /// Frequency of `times(2)`.
    Clktck = 17,
    /// Secure mode.
    Secure = 23,
    /// Address of 16 random bytes.
    Random = 25,
    /// More hardware capabilities.
    Hwcap2 = 26,
    /// File name of the program.
    Execfn = 31,
    /// Address of the vDSO.
    SysinfoEhdr = 33,
}

/// Entries forwarded from the loader's own auxiliary vector when present.
const FORWARDED: [AuxType; 4] = [
    AuxType::Hwcap,
    AuxType::Hwcap2,
    AuxType::Clktck,
    AuxType::SysinfoEhdr,
];

fn host_aux(ty: AuxType) -> usize {
    // SAFETY: getauxval() has no preconditions.
    unsafe { libc::getauxval(usize::from(ty) as libc::c_ulong) as usize }
}

/// Computes the auxiliary vector of the program, without the final
/// `AT_NULL`.
pub fn auxiliary_vector(
    table: &SegmentTable,
    config: &Config,
    random: Va,
    execfn: Va,
) -> Vec<(AuxType, usize)> {
    let mut auxv = Vec::new();
    if let Some(phdrs) = table.program_headers() {
        auxv.push((AuxType::Phdr, phdrs.address.into_usize()));
        auxv.push((AuxType::Phent, phdrs.entry_size));
        auxv.push((AuxType::Phnum, phdrs.count));
    }
    // SAFETY: the id getters have no preconditions.
    let (uid, euid, gid, egid) = unsafe {
        (
            libc::getuid(),
            libc::geteuid(),
            libc::getgid(),
            libc::getegid(),
        )
    };
    auxv.extend([
        (AuxType::Pagesz, config.page_size.bytes()),
        (AuxType::Entry, table.entry().into_usize()),
        (AuxType::Uid, uid as usize),
        (AuxType::Euid, euid as usize),
        (AuxType::Gid, gid as usize),
        (AuxType::Egid, egid as usize),
        (AuxType::Secure, host_aux(AuxType::Secure)),
        (AuxType::Random, random.into_usize()),
        (AuxType::Execfn, execfn.into_usize()),
    ]);
    for ty in FORWARDED {
        let value = host_aux(ty);
        if value != 0 {
            auxv.push((ty, value));
        }
    }
    auxv
}

fn random_bytes() -> Result<[u8; 16], String> {
    let mut bytes = [0u8; 16];
    // SAFETY: `bytes` is valid for 16 bytes of writes.
    let n = unsafe { libc::getrandom(bytes.as_mut_ptr().cast(), bytes.len(), 0) };
    if n == bytes.len() as isize {
        Ok(bytes)
    } else {
        Err(format!("getrandom: {}", std::io::Error::last_os_error()))
    }
}

/// Lays out the initial process stack and returns the stack pointer.
pub fn build_stack<S: AsRef<OsStr>>(
    table: &SegmentTable,
    args: &[S],
    env: &[OsString],
    config: &Config,
) -> Result<Va, LoaderError> {
    let fail = |reason: String| LoaderError::Transfer {
        entry: table.entry(),
        reason,
    };
    let exhausted =
        |_: StackExhausted| fail(format!("{:#x}-byte stack exhausted", config.stack_size));

    let args: Vec<&OsStr> = args.iter().map(|s| s.as_ref()).collect();
    for s in args.iter().copied().chain(env.iter().map(OsString::as_os_str)) {
        if s.as_bytes().contains(&0) {
            return Err(fail(format!("{s:?} contains a NUL byte")));
        }
    }

    let mut builder = StackBuilder::new(config.stack_size)
        .map_err(|e| fail(format!("cannot map the stack: {e}")))?;
    let execfn = args.first().copied().unwrap_or_default();
    let execfn = builder.push_str(execfn.as_bytes()).map_err(exhausted)?;
    let mut env_ptrs = Vec::with_capacity(env.len());
    for s in env.iter().rev() {
        env_ptrs.push(builder.push_str(s.as_bytes()).map_err(exhausted)?);
    }
    let mut arg_ptrs = Vec::with_capacity(args.len());
    for s in args.iter().rev() {
        arg_ptrs.push(builder.push_str(s.as_bytes()).map_err(exhausted)?);
    }
    let random = builder.push_bytes(&random_bytes().map_err(fail)?).map_err(exhausted)?;
    builder.align(16).map_err(exhausted)?;

    let auxv = auxiliary_vector(table, config, random, execfn);
    // argc, argv + NULL, envp + NULL, auxv pairs + AT_NULL pair.
    let words = 1 + (args.len() + 1) + (env.len() + 1) + 2 * (auxv.len() + 1);
    if words % 2 == 1 {
        builder.push_usize(0).map_err(exhausted)?;
    }

    builder.push_usize(0).map_err(exhausted)?;
    builder.push_usize(AuxType::Null.into()).map_err(exhausted)?;
    for &(ty, value) in auxv.iter().rev() {
        builder.push_usize(value).map_err(exhausted)?;
        builder.push_usize(ty.into()).map_err(exhausted)?;
    }
    builder.push_usize(0).map_err(exhausted)?;
    for ptr in env_ptrs {
        builder.push_usize(ptr.into_usize()).map_err(exhausted)?;
    }
    builder.push_usize(0).map_err(exhausted)?;
    for ptr in arg_ptrs {
        builder.push_usize(ptr.into_usize()).map_err(exhausted)?;
    }
    builder.push_usize(args.len()).map_err(exhausted)?;
    Ok(builder.finish())
}

/// Starts the program described by `table` with the argument vector `args`
/// and the environment of the loader.
///
/// Never returns on success.
pub fn start<S: AsRef<OsStr>>(
    table: &SegmentTable,
    args: &[S],
    config: &Config,
) -> Result<Infallible, LoaderError> {
    let env: Vec<OsString> = std::env::vars_os()
        .map(|(key, value)| {
            let mut entry = key;
            entry.push("=");
            entry.push(value);
            entry
        })
        .collect();
    let sp = build_stack(table, args, &env, config)?;
    log::info!("starting at {} with sp {}", table.entry(), sp);
    // SAFETY: every page of the image is either serviced on demand by the
    // installed fault handler or reserved, and `sp` is a complete initial
    // stack.
    unsafe { abyss::launch::launch(table.entry(), sp) }
}
