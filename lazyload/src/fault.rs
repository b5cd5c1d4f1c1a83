//! # Fault Handler
//!
//! The fault handler is the orchestrator of the loader. Every trap on an
//! invalid memory access of the running program ends up in
//! [`FaultHandler::handle`], which walks a small state machine:
//!
//! ```text
//!            +------+  trap   +-------------+
//!            | IDLE |-------->| CLASSIFYING |
//!            +------+         +-------------+
//!               ^               |     |     |
//!               |     unowned   |     |     |  owned, unserviced
//!               |   +-----------+     |     +--------------+
//!               |   v                 v                    v
//!               | OUT OF BOUNDS   PROTECTION VIOLATION   SERVICE
//!               |   (default)       (owned, serviced)      |
//!               |                      (default)           |
//!               +------------------------------------------+
//!                          resume the faulting access
//! ```
//!
//! Only `SERVICE` leads back to `IDLE`. The two other outcomes hand the trap
//! to the default behavior of the system, which terminates the program. A
//! page is serviced at most once, so a trap on a serviced page is always a
//! genuine violation of the permissions it was granted (for instance a write
//! to a code page) and never a chance to load it again.
//!
//! The handler holds no state of its own. The segment table and the page
//! trackers inside it carry everything across traps.
//!
//! ## Trap entry
//!
//! The process-level entry point (installed by [`crate::initialize`]) decodes
//! the delivered trap and turns a [`Disposition`] into process behavior:
//!
//! | Trap / disposition                    | Behavior                                  |
//! | ------------------------------------- | ----------------------------------------- |
//! | not an invalid access                 | exit with `Config::foreign_trap_status`   |
//! | [`Disposition::Serviced`]             | return; the access runs again             |
//! | [`Disposition::OutOfBounds`]          | default action, killed by `SIGSEGV`       |
//! | [`Disposition::ProtectionViolation`]  | default action, killed by `SIGSEGV`       |
//! | [`Disposition::Failed`]               | abort (`SIGABRT`); never resumed          |

use crate::{
    Va,
    classifier::{Classification, classify},
    loader,
    segment::SegmentTable,
    servicer::{BackingStore, HostMapper, PageMapper, PageServicer, ServiceError},
};
use abyss::signal::{self, TrapInfo};
use core::ffi::{c_int, c_void};

/// What became of one trap.
#[derive(Debug)]
pub enum Disposition {
    /// The page was serviced; the faulting access can be resumed.
    Serviced {
        /// Position of the owning segment in the table.
        segment: usize,
        /// Index of the serviced page in the segment.
        page: usize,
    },
    /// No segment owns the address.
    OutOfBounds,
    /// The page was serviced before, so the access violates its permissions.
    ProtectionViolation {
        /// Position of the owning segment in the table.
        segment: usize,
        /// Index of the page in the segment.
        page: usize,
    },
    /// Servicing failed; the page must not be resumed.
    Failed(ServiceError),
}

/// Decides, and carries out, what happens to a faulting address.
pub struct FaultHandler<'a, B: BackingStore + ?Sized, M: PageMapper> {
    table: &'a SegmentTable,
    servicer: PageServicer<'a, B, M>,
}

impl<'a, B: BackingStore + ?Sized, M: PageMapper> FaultHandler<'a, B, M> {
    /// Creates a handler for the image described by `table`.
    pub fn new(table: &'a SegmentTable, servicer: PageServicer<'a, B, M>) -> Self {
        Self { table, servicer }
    }

    /// Handles a fault at `addr`.
    pub fn handle(&self, addr: Va) -> Disposition {
        let page_size = self.servicer.page_size();
        let (index, page) = match classify(self.table, addr, page_size) {
            Classification::Unowned => return Disposition::OutOfBounds,
            Classification::Owned { segment, page } => (segment, page),
        };
        let segment = &self.table.segments()[index];
        let tracker = match segment.tracker_or_init(page_size) {
            Ok(tracker) => tracker,
            Err(e) => return Disposition::Failed(ServiceError::Tracker(e)),
        };
        if tracker.is_serviced(page) {
            return Disposition::ProtectionViolation {
                segment: index,
                page,
            };
        }
        match self.servicer.service(segment, page, tracker) {
            Ok(()) => Disposition::Serviced {
                segment: index,
                page,
            },
            Err(e) => Disposition::Failed(e),
        }
    }
}

/// Hands the current trap to the default behavior of `SIGSEGV`.
///
/// The handler returns afterwards, the access runs again and the kernel
/// terminates the process as if no handler had ever been installed.
fn escalate() {
    if signal::restore_default(libc::SIGSEGV).is_err() {
        signal::terminate_by(libc::SIGSEGV);
    }
}

/// The process-level trap entry point.
pub(crate) extern "C" fn on_trap(signo: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    // SAFETY: installed with SA_SIGINFO, so `info` comes from the kernel.
    let trap = unsafe { TrapInfo::from_raw(signo, info) };
    let Some(code) = trap.invalid_access() else {
        log::error!(
            "unexpected trap: signal {} code {} at {}",
            trap.signal,
            trap.code,
            trap.address
        );
        signal::exit_immediately(loader::foreign_trap_status());
    };
    let Some(context) = loader::context() else {
        log::warn!("{:?} fault at {} before any program was loaded", code, trap.address);
        return escalate();
    };

    let handler = FaultHandler::new(
        context.table(),
        PageServicer::new(context.backing(), HostMapper, context.page_size()),
    );
    match handler.handle(trap.address) {
        Disposition::Serviced { .. } => {}
        Disposition::OutOfBounds => {
            log::warn!("segmentation fault at {}: outside every segment", trap.address);
            escalate();
        }
        Disposition::ProtectionViolation { segment, page } => {
            log::warn!(
                "segmentation fault at {}: page {} of segment {} ({}) is already loaded",
                trap.address,
                page,
                segment,
                context.table().segments()[segment].permissions
            );
            escalate();
        }
        Disposition::Failed(e) => {
            log::error!("cannot load the page at {}: {}", trap.address, e);
            signal::terminate_by(libc::SIGABRT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        PageSize, Permission,
        segment::Segment,
        servicer::testing::{CountingStore, FakeMapper},
    };
    use proptest::prelude::*;

    const RX: Permission = Permission::READ.union(Permission::EXECUTABLE);
    const RW: Permission = Permission::READ.union(Permission::WRITE);

    fn ps() -> PageSize {
        PageSize::new(0x1000).unwrap()
    }

    /// The segment table shared by the scenarios.
    fn scenario_table() -> SegmentTable {
        SegmentTable::new(
            Va::new(0x1000),
            vec![
                Segment::new(Va::new(0x1000), 0x2000, 0x1500, 0, RX),
                Segment::new(Va::new(0x3000), 0x1000, 0, 0x4000, RW),
            ],
            ps(),
        )
        .unwrap()
    }

    #[test]
    fn scenario_file_backed_and_straddling_pages() {
        let table = scenario_table();
        let store = CountingStore::patterned(0x1500);
        let mapper = FakeMapper::default();
        let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));

        assert!(matches!(
            handler.handle(Va::new(0x1000)),
            Disposition::Serviced { segment: 0, page: 0 }
        ));
        assert_eq!(
            mapper.page(0x1000),
            &store.bytes[..0x1000],
            "page 0 should hold file bytes [0, 0x1000)"
        );

        assert!(matches!(
            handler.handle(Va::new(0x2500)),
            Disposition::Serviced { segment: 0, page: 1 }
        ));
        let page = mapper.page(0x2000);
        assert_eq!(&page[..0x500], &store.bytes[0x1000..0x1500]);
        assert!(page[0x500..].iter().all(|&b| b == 0), "the tail past file_size should be zero");
        assert_eq!(mapper.permissions(0x2000), Some(RX));
    }

    #[test]
    fn scenario_pure_bss_page() {
        let table = scenario_table();
        let store = CountingStore::patterned(0x1500);
        let mapper = FakeMapper::default();
        let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));

        assert!(matches!(
            handler.handle(Va::new(0x3000)),
            Disposition::Serviced { segment: 1, page: 0 }
        ));
        assert!(mapper.page(0x3000).iter().all(|&b| b == 0));
        assert_eq!(store.reads.get(), 0, "a BSS page should not read the file");
        assert_eq!(mapper.permissions(0x3000), Some(RW));
    }

    #[test]
    fn scenario_out_of_bounds() {
        let table = scenario_table();
        let store = CountingStore::patterned(0x1500);
        let mapper = FakeMapper::default();
        let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));

        assert!(matches!(handler.handle(Va::new(0x10000)), Disposition::OutOfBounds));
        assert_eq!(mapper.maps.get(), 0, "an unowned address should never be serviced");
        assert!(
            table.segments().iter().all(|s| s.tracker().is_none()),
            "an unowned address should not create a tracker"
        );
    }

    #[test]
    fn scenario_violation_after_service() {
        let table = scenario_table();
        let store = CountingStore::patterned(0x1500);
        let mapper = FakeMapper::default();
        let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));

        assert!(matches!(handler.handle(Va::new(0x1000)), Disposition::Serviced { .. }));
        let reads = store.reads.get();
        assert!(matches!(
            handler.handle(Va::new(0x1000)),
            Disposition::ProtectionViolation { segment: 0, page: 0 }
        ));
        assert!(matches!(
            handler.handle(Va::new(0x1fff)),
            Disposition::ProtectionViolation { segment: 0, page: 0 }
        ));
        assert_eq!(mapper.maps.get(), 1, "a serviced page should never be mapped again");
        assert_eq!(store.reads.get(), reads);
    }

    #[test]
    fn short_read_fails_without_marking() {
        let table = scenario_table();
        // The file is shorter than segment 0 claims.
        let store = CountingStore::patterned(0x1200);
        let mapper = FakeMapper::default();
        let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));

        assert!(matches!(
            handler.handle(Va::new(0x2000)),
            Disposition::Failed(ServiceError::ShortRead { .. })
        ));
        let tracker = table.segments()[0].tracker().unwrap();
        assert_eq!(tracker.serviced_count(), 0);
    }

    proptest! {
        #[test]
        fn every_page_is_file_bytes_then_zero(
            vaddr in 0x1000usize..0x40_0000,
            memory_size in 1usize..0x6000,
            file_percent in 0usize..=100,
            file_offset in 0u64..0x3000,
        ) {
            let file_size = memory_size * file_percent / 100;
            let store = CountingStore::patterned(file_offset as usize + file_size);
            let table = SegmentTable::new(
                Va::new(vaddr),
                vec![Segment::new(Va::new(vaddr), memory_size, file_size, file_offset, RW)],
                ps(),
            )
            .unwrap();
            let mapper = FakeMapper::default();
            let handler = FaultHandler::new(&table, PageServicer::new(&store, &mapper, ps()));
            let segment = &table.segments()[0];
            let span = segment.page_span(ps());

            let mut page_base = span.start;
            while page_base < span.end {
                let addr = page_base.max(segment.virtual_address);
                let is_serviced = matches!(handler.handle(addr), Disposition::Serviced { .. });
                prop_assert!(is_serviced, "the first touch of {} should service it", addr);
                let is_violation =
                    matches!(handler.handle(addr), Disposition::ProtectionViolation { .. });
                prop_assert!(is_violation, "the second touch of {} should not service it", addr);
                page_base += ps().bytes();
            }
            prop_assert_eq!(mapper.maps.get(), segment.page_count(ps()));

            let mut page_base = span.start;
            while page_base < span.end {
                let page = mapper.page(page_base.into_usize());
                for (i, &byte) in page.iter().enumerate() {
                    let a = page_base + i;
                    let expected = if segment.virtual_address <= a && a < segment.file_end() {
                        store.bytes[file_offset as usize + (a - segment.virtual_address)]
                    } else {
                        0
                    };
                    prop_assert_eq!(byte, expected, "byte at {}", a);
                }
                page_base += ps().bytes();
            }
        }
    }
}
