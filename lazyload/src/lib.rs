//! # lazyload: a user-space demand-paging loader
//!
//! `lazyload` runs a statically-linked executable without copying its
//! loadable segments into memory up front. Each segment's address range is
//! reserved but left inaccessible; the first access to any page inside it
//! traps, and the loader services the trap by mapping the page, filling it
//! from the backing file (or with zeroes past the file-backed part), and
//! applying the segment's permissions. The faulting instruction then simply
//! runs again.
//!
//! This is what the page-fault path of an operating system kernel does for
//! `execve`, moved into a user-space trap handler.
//!
//! ## Components
//!
//! From the leaves up:
//!
//! - [`segment`]: [`Segment`] and [`SegmentTable`], the executable's memory
//!   image as produced by a [`DescriptorProvider`].
//! - [`tracker`]: [`PageTracker`], which pages of a segment were serviced.
//! - [`classifier`]: which segment (if any) owns a faulting address.
//! - [`servicer`]: [`PageServicer`], map + zero + load + protect one page.
//! - [`fault`]: [`FaultHandler`], the state machine tying the above
//!   together, and the trap entry point.
//! - [`loader`]: [`initialize`] and [`execute`].
//!
//! ## Trap Flow
//!
//! ```text
//!  access ──► SIGSEGV ──► classify ──┬─ unowned ─────────────► default action (killed by SIGSEGV)
//!                                    ├─ owned, serviced ─────► default action (killed by SIGSEGV)
//!                                    └─ owned, unserviced ───► service page ──► resume access
//! ```
//!
//! Servicing is synchronous on the faulting thread, so exactly one fault is in
//! flight at any time. A page is serviced at most once: a later fault on it
//! can only be a genuine permission violation.
//!
//! ## Example
//!
//! ```no_run
//! fn main() -> Result<(), lazyload::LoaderError> {
//!     lazyload::initialize()?;
//!     // Only returns on failure.
//!     match lazyload::execute("./hello", &["./hello", "world"])? {}
//! }
//! ```
#![deny(missing_docs)]

pub mod classifier;
pub mod config;
pub mod fault;
pub mod loader;
pub mod segment;
pub mod servicer;
pub mod tracker;

pub use abyss::{PageSize, Permission, Va};
pub use config::{Config, ConfigBuilder};
pub use fault::{Disposition, FaultHandler};
pub use loader::{
    DescriptorProvider, LoaderContext, elf::ElfProvider, execute, execute_with, initialize,
    initialize_with,
};
pub use segment::{ProgramHeaders, Segment, SegmentTable};
pub use servicer::{BackingStore, HostMapper, PageMapper, PagePlan, PageServicer, ServiceError};
pub use tracker::PageTracker;

use std::{io, path::PathBuf};
use thiserror::Error;

/// Enum representing errors that can occur while setting up or starting a
/// program.
///
/// Every variant is returned to the caller of [`initialize`] or [`execute`];
/// none of them is ever raised from inside the trap handler. Failures while
/// servicing a fault are [`ServiceError`]s and terminate the program instead.
#[derive(Debug, Error)]
pub enum LoaderError {
    /// The trap handler could not be installed, or the loader was used
    /// before (or installed after) its one-time setup.
    #[error("cannot set up the fault handler: {0}")]
    Setup(#[source] io::Error),
    /// The backing file cannot be opened.
    #[error("cannot open {path}: {source}")]
    Open {
        /// The executable that was asked for.
        path: PathBuf,
        /// The reason reported by the system.
        #[source]
        source: io::Error,
    },
    /// The descriptor provider rejected the file.
    #[error("cannot load {path}: {source}")]
    Parse {
        /// The executable that was asked for.
        path: PathBuf,
        /// What is wrong with it.
        #[source]
        source: ParseError,
    },
    /// The segments cannot be serviced with the configured page size.
    #[error("segments do not fit {page_size:#x}-byte pages: {source}")]
    Layout {
        /// The page size faults are serviced with.
        page_size: usize,
        /// How the segments conflict at that page size.
        #[source]
        source: ParseError,
    },
    /// A segment's address range cannot be reserved.
    #[error("cannot reserve {len:#x} bytes at {base}: {source}")]
    Reserve {
        /// Start of the page span of the segment.
        base: Va,
        /// Length of the page span of the segment.
        len: usize,
        /// The reason reported by the system.
        #[source]
        source: io::Error,
    },
    /// Control could not be transferred to the program.
    #[error("cannot start the program at {entry}: {reason}")]
    Transfer {
        /// The entry point of the program.
        entry: Va,
        /// Why the transfer failed.
        reason: String,
    },
}

/// Reasons for a descriptor provider to reject an executable.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ParseError {
    /// The file is not an ELF file of the supported class and encoding.
    #[error("not a 64-bit little-endian ELF file ({0})")]
    NotElf(String),
    /// The file targets another machine.
    #[error("built for machine {0:#x}, which is not this machine")]
    WrongMachine(u16),
    /// The file is not a statically-linked executable.
    #[error("object type {0} is not a fixed-address executable (ET_EXEC)")]
    NotExecutable(u16),
    /// The file requests a program interpreter.
    #[error("dynamically-linked executables are not supported")]
    DynamicallyLinked,
    /// The file has no loadable segment.
    #[error("no loadable segment")]
    NoSegments,
    /// A segment needs more bytes from the file than the file has.
    #[error("segment {index} reads [{offset:#x}, +{size:#x}) beyond the end of the file ({file_len:#x})")]
    FileRange {
        /// Position of the segment in the table.
        index: usize,
        /// File offset of the segment.
        offset: u64,
        /// File size of the segment.
        size: u64,
        /// Length of the backing file.
        file_len: u64,
    },
    /// A segment occupies fewer bytes in memory than in the file.
    #[error("segment {index} has memory size {memory_size:#x} below file size {file_size:#x}")]
    MemoryBelowFile {
        /// Position of the segment in the table.
        index: usize,
        /// Memory size of the segment.
        memory_size: usize,
        /// File size of the segment.
        file_size: usize,
    },
    /// A segment wraps around the end of the address space.
    #[error("segment {index} wraps around the address space")]
    Overflow {
        /// Position of the segment in the table.
        index: usize,
    },
    /// Two segments share a page.
    #[error("segments {first} and {second} share a page")]
    Overlap {
        /// Position of the earlier segment in the table.
        first: usize,
        /// Position of the later segment in the table.
        second: usize,
    },
}
