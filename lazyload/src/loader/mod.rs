//! ## Loading a program
//!
//! Running a program under `lazyload` takes two calls:
//!
//! 1. [`initialize`] (or [`initialize_with`]) installs the trap handler for
//!    invalid memory accesses, together with an alternate stack for it to run
//!    on, and the console log sink. Traps of every other class keep their
//!    default behavior.
//! 2. [`execute`] (or [`execute_with`]) opens the executable, obtains its
//!    [`SegmentTable`] from a [`DescriptorProvider`], reserves the page spans
//!    of the segments and transfers control to the entry point. It only
//!    returns on failure.
//!
//! Nothing of the program is read at this point. The reserved ranges are
//! inaccessible, so the very first instruction fetch at the entry point traps
//! and is serviced like any other fault.
//!
//! ## Loader context
//!
//! Everything the trap handler needs lives in a single [`LoaderContext`]: the
//! segment table (with its page trackers) and the open backing file. It is
//! installed once into process-wide storage and never torn down. In
//! particular, the backing file is never closed: pages are read from it for
//! as long as the program runs.
//!
//! ## Reservation
//!
//! Before control is transferred, each segment's page span is covered by an
//! inaccessible mapping that refuses to replace an existing one. This keeps
//! the allocator of the loader out of the image, and an image that collides
//! with a mapping of the loader itself is reported as
//! [`LoaderError::Reserve`] instead of silently clobbering it.

pub mod elf;
pub mod stack_builder;
pub mod transfer;

use crate::{Config, LoaderError, PageSize, Va, fault, segment::SegmentTable};
use abyss::{kprint, mman, signal};
use std::{convert::Infallible, ffi::OsStr, fs::File, io, path::Path, sync::OnceLock};

/// A source of [`SegmentTable`]s.
///
/// A provider knows one executable format and turns a file of that format
/// into the memory image the loader services.
pub trait DescriptorProvider {
    /// Describes the executable at `path`.
    ///
    /// # Errors
    /// - [`LoaderError::Open`] if the file cannot be read.
    /// - [`LoaderError::Parse`] if the file is not a loadable executable.
    fn parse(&self, path: &Path) -> Result<SegmentTable, LoaderError>;
}

/// The process-wide state of the loader.
#[derive(Debug)]
pub struct LoaderContext {
    table: SegmentTable,
    backing: File,
    page_size: PageSize,
}

static CONFIG: OnceLock<Config> = OnceLock::new();
static CONTEXT: OnceLock<LoaderContext> = OnceLock::new();

/// The configuration installed by [`initialize_with`].
pub(crate) fn config() -> Option<&'static Config> {
    CONFIG.get()
}

/// The context installed by [`LoaderContext::install`].
pub(crate) fn context() -> Option<&'static LoaderContext> {
    CONTEXT.get()
}

/// Exit status for traps that are not invalid memory accesses.
pub(crate) fn foreign_trap_status() -> i32 {
    config().map_or(139, |config| config.foreign_trap_status)
}

impl LoaderContext {
    /// Bundles a segment table with the file its pages are read from.
    pub fn new(table: SegmentTable, backing: File, page_size: PageSize) -> Self {
        Self {
            table,
            backing,
            page_size,
        }
    }

    /// The segment table of the loaded program.
    #[inline]
    pub fn table(&self) -> &SegmentTable {
        &self.table
    }

    /// The file pages are read from.
    #[inline]
    pub fn backing(&self) -> &File {
        &self.backing
    }

    /// The page size pages are serviced with.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Reserves the page spans of the segments (unless disabled in the
    /// configuration) and makes the context visible to the trap handler.
    ///
    /// # Errors
    /// - [`LoaderError::Setup`] if the page size is not a multiple of the
    ///   system's, [`initialize`] has not run, or a context is already
    ///   installed.
    /// - [`LoaderError::Layout`] if two segments share a page at the page
    ///   size of the context.
    /// - [`LoaderError::Reserve`] if a page span cannot be reserved.
    pub fn install(self) -> Result<&'static LoaderContext, LoaderError> {
        check_page_size(self.page_size)?;
        self.table
            .check_pages(self.page_size)
            .map_err(|source| LoaderError::Layout {
                page_size: self.page_size.bytes(),
                source,
            })?;
        let config = config().ok_or_else(not_initialized)?;
        if CONTEXT.get().is_some() {
            return Err(already_loaded());
        }
        if config.reserve_segments {
            self.reserve()?;
        }
        let mut installed = false;
        let context = CONTEXT.get_or_init(|| {
            installed = true;
            self
        });
        if installed {
            Ok(context)
        } else {
            Err(already_loaded())
        }
    }

    fn reserve(&self) -> Result<(), LoaderError> {
        let mut reserved: Vec<(Va, usize)> = Vec::new();
        for segment in self.table.segments().iter().filter(|s| s.memory_size != 0) {
            let span = segment.page_span(self.page_size);
            let (base, len) = (span.start, span.end - span.start);
            if let Err(source) = mman::reserve(base, len) {
                for (base, len) in reserved {
                    // SAFETY: reserved above and referenced by no one.
                    unsafe {
                        let _ = mman::unmap(base, len);
                    }
                }
                return Err(LoaderError::Reserve { base, len, source });
            }
            log::debug!("reserved [{}, {}) ({})", base, span.end, segment.permissions);
            reserved.push((base, len));
        }
        Ok(())
    }
}

/// Pages are mapped with `MAP_FIXED`, so they must consist of whole system
/// pages.
fn check_page_size(page_size: PageSize) -> Result<(), LoaderError> {
    let host = PageSize::host();
    if page_size.bytes() % host.bytes() == 0 {
        Ok(())
    } else {
        Err(LoaderError::Setup(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!(
                "page size {:#x} is not a multiple of the system page size {:#x}",
                page_size.bytes(),
                host.bytes()
            ),
        )))
    }
}

fn not_initialized() -> LoaderError {
    LoaderError::Setup(io::Error::other("the loader is not initialized"))
}

fn already_loaded() -> LoaderError {
    LoaderError::Setup(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "a program is already loaded",
    ))
}

/// Installs the loader with the default configuration.
///
/// Equivalent to `initialize_with(Config::from_env())`.
pub fn initialize() -> Result<(), LoaderError> {
    initialize_with(Config::from_env())
}

/// Installs the loader.
///
/// Sets up the log sink at `config.log_level`, maps the alternate stack the
/// trap handler runs on, and installs the handler for `SIGSEGV`. Must be
/// called exactly once, before [`execute`], on the thread that will run the
/// program.
///
/// # Errors
/// [`LoaderError::Setup`] if the page size is not a multiple of the system
/// page size, the loader is already initialized or the environment rejects
/// the handler.
pub fn initialize_with(config: Config) -> Result<(), LoaderError> {
    kprint::init(config.log_level);
    check_page_size(config.page_size)?;
    let alternate_stack_size = config.alternate_stack_size;
    CONFIG.set(config).map_err(|_| {
        LoaderError::Setup(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "the loader is already initialized",
        ))
    })?;
    signal::install_alternate_stack(alternate_stack_size).map_err(LoaderError::Setup)?;
    signal::install(libc::SIGSEGV, fault::on_trap).map_err(LoaderError::Setup)?;
    log::info!("fault handler installed");
    Ok(())
}

/// Runs the statically-linked ELF executable at `path` with the argument
/// vector `args`.
///
/// `args` is handed to the program as is, so `args[0]` should be the program
/// name.
///
/// # Errors
/// Only returns on failure; see [`execute_with`].
pub fn execute<P, S>(path: P, args: &[S]) -> Result<Infallible, LoaderError>
where
    P: AsRef<Path>,
    S: AsRef<OsStr>,
{
    execute_with(&elf::ElfProvider, path, args)
}

/// Runs the executable at `path`, described by `provider`, with the argument
/// vector `args`.
///
/// # Errors
/// - [`LoaderError::Setup`] if [`initialize`] has not run or a program is
///   already loaded.
/// - [`LoaderError::Open`] if `path` cannot be opened for reading.
/// - [`LoaderError::Parse`] if the provider rejects the file.
/// - [`LoaderError::Reserve`] if the image collides with existing mappings.
/// - [`LoaderError::Transfer`] if control cannot be transferred.
pub fn execute_with<D, P, S>(provider: &D, path: P, args: &[S]) -> Result<Infallible, LoaderError>
where
    D: DescriptorProvider + ?Sized,
    P: AsRef<Path>,
    S: AsRef<OsStr>,
{
    let path = path.as_ref();
    let config = config().ok_or_else(not_initialized)?;
    let backing = File::open(path).map_err(|source| LoaderError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let table = provider.parse(path)?;
    log::info!(
        "{}: {} segment(s), entry {}",
        path.display(),
        table.segments().len(),
        table.entry()
    );
    let context = LoaderContext::new(table, backing, config.page_size).install()?;
    transfer::start(context.table(), args, config)
}
