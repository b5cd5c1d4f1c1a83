//! The memory image of an executable.
//!
//! A [`SegmentTable`] is produced once by a descriptor provider and then
//! lives, unchanged, until the process exits. The only state that changes
//! during execution is each segment's [`PageTracker`], born on the segment's
//! first fault.
//!
//! ## Page Span
//!
//! A segment does not need to start on a page boundary. Its **page span** is
//! `[align_down(virtual_address), align_up(virtual_address + memory_size))`,
//! and pages are numbered from the start of the span. For a page-aligned
//! segment the index of an address `a` is simply
//! `(a - virtual_address) / page_size`.
//!
//! ```text
//!   virtual_address            + file_size         + memory_size
//!   |<------- file-backed ------>|<------ BSS ------>|
//! +-+--------------+-------------+-----+-------------+--+
//! | |   page 0     |   page 1          |   page 2       |
//! +-+--------------+-------------------+----------------+
//! ^ page span start                                     ^ page span end
//! ```

use crate::{PageSize, ParseError, Permission, Va, tracker::PageTracker};
use std::{io, ops::Range, sync::OnceLock};

/// One loadable segment of an executable.
#[derive(Debug)]
pub struct Segment {
    /// Address of the first byte of the segment.
    pub virtual_address: Va,
    /// Bytes the segment occupies in memory.
    pub memory_size: usize,
    /// Leading bytes of the segment that come from the backing file. The
    /// remaining `memory_size - file_size` bytes read as zero.
    pub file_size: usize,
    /// Where the file-backed bytes start in the backing file.
    pub file_offset: u64,
    /// Protection of the segment's pages once serviced.
    pub permissions: Permission,
    tracker: OnceLock<PageTracker>,
}

impl Segment {
    /// Creates a segment descriptor.
    pub fn new(
        virtual_address: Va,
        memory_size: usize,
        file_size: usize,
        file_offset: u64,
        permissions: Permission,
    ) -> Self {
        Self {
            virtual_address,
            memory_size,
            file_size,
            file_offset,
            permissions,
            tracker: OnceLock::new(),
        }
    }

    /// One past the last byte of the segment.
    ///
    /// [`SegmentTable::new`] guarantees this does not overflow.
    #[inline]
    pub fn end(&self) -> Va {
        self.virtual_address + self.memory_size
    }

    /// One past the last file-backed byte of the segment.
    #[inline]
    pub fn file_end(&self) -> Va {
        self.virtual_address + self.file_size
    }

    /// Returns `true` if `addr` lies in `[virtual_address, virtual_address +
    /// memory_size)`.
    #[inline]
    pub fn contains(&self, addr: Va) -> bool {
        self.virtual_address <= addr && addr < self.end()
    }

    /// The page-aligned range of addresses the segment touches.
    pub fn page_span(&self, page_size: PageSize) -> Range<Va> {
        let start = self.virtual_address.page_down(page_size);
        // Validated in `SegmentTable::new`.
        let end = self.end().page_up(page_size).unwrap_or(Va::new(usize::MAX));
        start..end
    }

    /// Number of pages in the segment's page span.
    pub fn page_count(&self, page_size: PageSize) -> usize {
        let span = self.page_span(page_size);
        (span.end - span.start) / page_size.bytes()
    }

    /// Index of the page holding `addr`, counted from the start of the page
    /// span.
    ///
    /// `addr` must be owned by the segment.
    #[inline]
    pub fn page_index(&self, addr: Va, page_size: PageSize) -> usize {
        (addr.page_down(page_size) - self.virtual_address.page_down(page_size)) / page_size.bytes()
    }

    /// The page tracker, if the segment has ever faulted.
    #[inline]
    pub fn tracker(&self) -> Option<&PageTracker> {
        self.tracker.get()
    }

    /// The page tracker, created on the first call.
    pub fn tracker_or_init(&self, page_size: PageSize) -> io::Result<&PageTracker> {
        if let Some(tracker) = self.tracker.get() {
            return Ok(tracker);
        }
        let tracker = PageTracker::new(self.page_count(page_size))?;
        Ok(self.tracker.get_or_init(|| tracker))
    }
}

/// Location of the program header table inside the loaded image.
///
/// C runtimes of statically-linked programs find their own TLS template and
/// other metadata through it, via the `AT_PHDR` auxiliary vector entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProgramHeaders {
    /// Virtual address of the first program header.
    pub address: Va,
    /// Size of one program header.
    pub entry_size: usize,
    /// Number of program headers.
    pub count: usize,
}

/// The ordered set of segments of an executable, with its entry point.
#[derive(Debug)]
pub struct SegmentTable {
    entry: Va,
    segments: Vec<Segment>,
    program_headers: Option<ProgramHeaders>,
}

impl SegmentTable {
    /// Builds a table after checking the invariants the loader relies on.
    ///
    /// # Errors
    /// - [`ParseError::MemoryBelowFile`] if a segment has `memory_size <
    ///   file_size`.
    /// - [`ParseError::Overflow`] if a segment's page span wraps around.
    /// - [`ParseError::Overlap`] if two segments share a page, as servicing
    ///   one would then replace the other's page.
    pub fn new(
        entry: Va,
        segments: Vec<Segment>,
        page_size: PageSize,
    ) -> Result<Self, ParseError> {
        for (index, segment) in segments.iter().enumerate() {
            if segment.memory_size < segment.file_size {
                return Err(ParseError::MemoryBelowFile {
                    index,
                    memory_size: segment.memory_size,
                    file_size: segment.file_size,
                });
            }
        }
        let table = Self {
            entry,
            segments,
            program_headers: None,
        };
        table.check_pages(page_size)?;
        Ok(table)
    }

    /// Checks that the segments can be serviced with pages of `page_size`.
    ///
    /// Page spans depend on the page size: two segments that are apart at
    /// one size may share a page at a larger one, and servicing one of them
    /// would then replace the other's serviced page.
    ///
    /// # Errors
    /// - [`ParseError::Overflow`] if a segment's page span wraps around.
    /// - [`ParseError::Overlap`] if two segments share a page.
    pub fn check_pages(&self, page_size: PageSize) -> Result<(), ParseError> {
        for (index, segment) in self.segments.iter().enumerate() {
            segment
                .virtual_address
                .checked_add(segment.memory_size)
                .and_then(|end| end.page_up(page_size))
                .ok_or(ParseError::Overflow { index })?;
        }
        for (first, a) in self.segments.iter().enumerate() {
            for (second, b) in self.segments.iter().enumerate().skip(first + 1) {
                if a.memory_size == 0 || b.memory_size == 0 {
                    continue;
                }
                let (a, b) = (a.page_span(page_size), b.page_span(page_size));
                if a.start < b.end && b.start < a.end {
                    return Err(ParseError::Overlap { first, second });
                }
            }
        }
        Ok(())
    }

    /// Attaches the location of the program header table.
    pub fn with_program_headers(mut self, program_headers: ProgramHeaders) -> Self {
        self.program_headers = Some(program_headers);
        self
    }

    /// The entry point of the program.
    #[inline]
    pub fn entry(&self) -> Va {
        self.entry
    }

    /// The segments in table order.
    #[inline]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The program header table, if the provider located it.
    #[inline]
    pub fn program_headers(&self) -> Option<ProgramHeaders> {
        self.program_headers
    }
}
