//! # Fault Classifier
//!
//! Resolves a faulting address to the segment that owns it. A segment owns
//! every address in `[virtual_address, virtual_address + memory_size)`;
//! segments are searched in table order and the first owner wins.
//!
//! The result is an explicit value, so the caller never has to inspect a
//! "found" flag left behind by a search loop.

use crate::{PageSize, Va, segment::SegmentTable};

/// The outcome of classifying a faulting address.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Classification {
    /// The address belongs to a segment.
    Owned {
        /// Position of the segment in the table.
        segment: usize,
        /// Index of the page holding the address, counted from the start of
        /// the segment's page span.
        page: usize,
    },
    /// No segment owns the address.
    Unowned,
}

/// Finds the segment owning `addr` and the page of it that holds `addr`.
pub fn classify(table: &SegmentTable, addr: Va, page_size: PageSize) -> Classification {
    table
        .segments()
        .iter()
        .position(|segment| segment.contains(addr))
        .map_or(Classification::Unowned, |index| Classification::Owned {
            segment: index,
            page: table.segments()[index].page_index(addr, page_size),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Permission, segment::Segment};

    fn table() -> SegmentTable {
        SegmentTable::new(
            Va::new(0x1000),
            vec![
                Segment::new(
                    Va::new(0x1000),
                    0x2000,
                    0x1500,
                    0,
                    Permission::READ | Permission::EXECUTABLE,
                ),
                Segment::new(
                    Va::new(0x3000),
                    0x1000,
                    0,
                    0x9999,
                    Permission::READ | Permission::WRITE,
                ),
            ],
            PageSize::new(0x1000).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn owned_addresses() {
        let ps = PageSize::new(0x1000).unwrap();
        let table = table();
        assert_eq!(
            classify(&table, Va::new(0x1000), ps),
            Classification::Owned { segment: 0, page: 0 }
        );
        assert_eq!(
            classify(&table, Va::new(0x1500), ps),
            Classification::Owned { segment: 0, page: 0 }
        );
        assert_eq!(
            classify(&table, Va::new(0x2fff), ps),
            Classification::Owned { segment: 0, page: 1 }
        );
        assert_eq!(
            classify(&table, Va::new(0x3000), ps),
            Classification::Owned { segment: 1, page: 0 },
            "the first byte after segment 0 should belong to segment 1"
        );
    }

    #[test]
    fn unowned_addresses() {
        let ps = PageSize::new(0x1000).unwrap();
        let table = table();
        for addr in [0, 0xfff, 0x4000, 0x10000, usize::MAX] {
            assert_eq!(
                classify(&table, Va::new(addr), ps),
                Classification::Unowned,
                "{addr:#x} should not be owned by any segment"
            );
        }
    }

    #[test]
    fn bytes_past_memory_size_in_the_last_page_are_unowned() {
        let ps = PageSize::new(0x1000).unwrap();
        let table = SegmentTable::new(
            Va::ZERO,
            vec![Segment::new(Va::new(0x5000), 0x10, 0x10, 0, Permission::READ)],
            ps,
        )
        .unwrap();
        assert_eq!(
            classify(&table, Va::new(0x500f), ps),
            Classification::Owned { segment: 0, page: 0 }
        );
        assert_eq!(classify(&table, Va::new(0x5010), ps), Classification::Unowned);
    }
}
