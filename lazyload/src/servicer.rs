//! # Page Servicer
//!
//! The page servicer brings exactly one page of one segment to life. Given a
//! segment and a page index, it:
//!
//! 1. maps a fresh page at the page-aligned address, fixed in place and
//!    temporarily writable,
//! 2. zeroes the whole page, which covers the BSS tail and any bytes past
//!    `memory_size` in the last page,
//! 3. reads the file-backed part of the page (if any) from the backing file,
//! 4. applies the segment's final permissions, and
//! 5. marks the page serviced in the segment's [`PageTracker`].
//!
//! The write-enable, fill, restrict order matters: filling needs write access
//! while the final permission may well be read-only or execute-only.
//!
//! Which bytes come from the file is a pure computation, [`PagePlan`]. The
//! operating system is reached only through two seams, [`BackingStore`] for
//! file reads and [`PageMapper`] for mappings, so the servicer is testable
//! without taking a single real trap.
//!
//! ## Failures
//!
//! There is no rollback. If any step fails, the page may be left mapped but
//! partially initialized, and the caller must terminate the program rather
//! than resume it. A short read is such a failure: it means the descriptor
//! promised bytes the file does not have, and zero-filling them would hide a
//! corrupted executable.

use crate::{PageSize, Permission, Va, segment::Segment, tracker::PageTracker};
use abyss::{mman, syscall};
use core::ops::Range;
use std::{fs::File, io, os::fd::AsRawFd};
use thiserror::Error;

/// Failures while servicing a page. Each of them is fatal to the program.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The backing file ended before the bytes the segment promised.
    #[error("short read at file offset {offset:#x}: expected {expected:#x} bytes, got {got:#x}")]
    ShortRead {
        /// File offset of the read.
        offset: u64,
        /// Bytes requested.
        expected: usize,
        /// Bytes available.
        got: usize,
    },
    /// The backing file could not be read.
    #[error("cannot read the backing file: {0}")]
    Read(#[source] io::Error),
    /// The page could not be mapped.
    #[error("cannot map the page at {base}: {source}")]
    Map {
        /// Address of the page.
        base: Va,
        /// The reason reported by the system.
        #[source]
        source: io::Error,
    },
    /// The final permissions could not be applied.
    #[error("cannot protect the page at {base}: {source}")]
    Protect {
        /// Address of the page.
        base: Va,
        /// The reason reported by the system.
        #[source]
        source: io::Error,
    },
    /// The page tracker of the segment could not be created.
    #[error("cannot create the page tracker: {0}")]
    Tracker(#[source] io::Error),
}

/// A source of file bytes, read by position.
///
/// Reads must not go through a buffer or a shared cursor: they happen inside
/// the trap handler, possibly while the program itself is using the same
/// library state.
pub trait BackingStore {
    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Returns `0` at the end of the data.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fills `buf` with the bytes at `offset`.
    ///
    /// # Errors
    /// [`ServiceError::ShortRead`] if the data ends early.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<(), ServiceError> {
        let mut done = 0;
        while done < buf.len() {
            match self.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => {
                    return Err(ServiceError::ShortRead {
                        offset,
                        expected: buf.len(),
                        got: done,
                    });
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(ServiceError::Read(e)),
            }
        }
        Ok(())
    }
}

impl BackingStore for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        syscall::pread(self.as_raw_fd(), buf, offset).map_err(io::Error::from)
    }
}

impl BackingStore for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        let Some(src) = self.get(start..) else {
            return Ok(0);
        };
        let n = src.len().min(buf.len());
        buf[..n].copy_from_slice(&src[..n]);
        Ok(n)
    }
}

/// Establishes and protects page mappings.
pub trait PageMapper {
    /// Maps `len` bytes at exactly `base`, writable, and hands them to
    /// `fill`.
    fn map_writable<R>(
        &self,
        base: Va,
        len: usize,
        fill: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ServiceError>;

    /// Applies `permissions` to `[base, base + len)`.
    fn protect(&self, base: Va, len: usize, permissions: Permission) -> Result<(), ServiceError>;
}

/// [`PageMapper`] of the running process.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostMapper;

impl PageMapper for HostMapper {
    fn map_writable<R>(
        &self,
        base: Va,
        len: usize,
        fill: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, ServiceError> {
        // SAFETY: `base` is a page of the loaded image that has never been
        // serviced. Only the reservation of the image lives there.
        let page = unsafe { mman::map_fixed(base, len, Permission::READ | Permission::WRITE) }
            .map_err(|source| ServiceError::Map { base, source })?;
        // SAFETY: freshly mapped, writable and referenced nowhere else.
        Ok(fill(unsafe {
            core::slice::from_raw_parts_mut(page.as_ptr(), len)
        }))
    }

    fn protect(&self, base: Va, len: usize, permissions: Permission) -> Result<(), ServiceError> {
        // SAFETY: the loader keeps no reference into the image.
        unsafe { mman::protect(base, len, permissions) }
            .map_err(|source| ServiceError::Protect { base, source })
    }
}

/// Which bytes of one page come from the backing file.
///
/// The file-backed part of a page is the intersection of the page with
/// `[virtual_address, virtual_address + file_size)`. Every other byte of the
/// page is zero.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PagePlan {
    /// Address of the page.
    pub page_base: Va,
    /// In-page range of the file-backed bytes. Empty for a pure BSS page.
    pub copy: Range<usize>,
    /// File offset of the first file-backed byte.
    pub file_offset: u64,
}

impl PagePlan {
    /// Plans the page of `segment` that starts at `page_base`.
    pub fn new(segment: &Segment, page_base: Va, page_size: PageSize) -> Self {
        let page_end = page_base + page_size.bytes();
        let start = segment.virtual_address.max(page_base);
        let end = segment.file_end().min(page_end);
        if start < end {
            Self {
                page_base,
                copy: (start - page_base)..(end - page_base),
                file_offset: segment.file_offset + (start - segment.virtual_address) as u64,
            }
        } else {
            Self {
                page_base,
                copy: 0..0,
                file_offset: 0,
            }
        }
    }

    /// Number of bytes read from the file.
    #[inline]
    pub fn bytes_from_file(&self) -> usize {
        self.copy.len()
    }
}

/// Services pages against a backing store and a mapper.
pub struct PageServicer<'a, B: BackingStore + ?Sized, M: PageMapper> {
    backing: &'a B,
    mapper: M,
    page_size: PageSize,
}

impl<'a, B: BackingStore + ?Sized, M: PageMapper> PageServicer<'a, B, M> {
    /// Creates a servicer.
    pub fn new(backing: &'a B, mapper: M, page_size: PageSize) -> Self {
        Self {
            backing,
            mapper,
            page_size,
        }
    }

    /// The page size the servicer maps with.
    #[inline]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Services page `page` of `segment` and records it in `tracker`.
    ///
    /// `page` must be below `segment.page_count()` and not yet serviced.
    pub fn service(
        &self,
        segment: &Segment,
        page: usize,
        tracker: &PageTracker,
    ) -> Result<(), ServiceError> {
        let page_base = segment.page_span(self.page_size).start + page * self.page_size.bytes();
        let plan = PagePlan::new(segment, page_base, self.page_size);
        log::debug!(
            "servicing {} ({}, {:#x} bytes from file offset {:#x})",
            page_base,
            segment.permissions,
            plan.bytes_from_file(),
            plan.file_offset
        );

        self.mapper
            .map_writable(page_base, self.page_size.bytes(), |bytes| {
                bytes.fill(0);
                if plan.bytes_from_file() == 0 {
                    return Ok(());
                }
                self.backing
                    .read_exact_at(&mut bytes[plan.copy.clone()], plan.file_offset)
            })??;
        self.mapper
            .protect(page_base, self.page_size.bytes(), segment.permissions)?;
        tracker.mark_serviced(page);
        Ok(())
    }
}
