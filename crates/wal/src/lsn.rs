//! LSN space addressing: mapping a 64-bit LSN into a file offset inside the
//! circular LSN region framed by the two master blocks, and splitting a
//! record that would cross the end of the ring into head/tail segments.

use crate::format::MASTER_BLOCK_SIZE;
use durlog_common::Lsn;

/// Geometry of the circular LSN region: its size and where it starts in the
/// file (immediately after the leading master block).
#[derive(Debug, Clone, Copy)]
pub struct LsnSpace {
    pub region_size: u64,
}

impl LsnSpace {
    pub fn new(file_size: u64) -> Self {
        Self {
            region_size: file_size - 2 * MASTER_BLOCK_SIZE as u64,
        }
    }

    /// Map an LSN to its file offset and the contiguous run length available
    /// there before the ring wraps back to the start.
    pub fn map(&self, lsn: Lsn) -> (u64, u64) {
        let pos = lsn % self.region_size;
        let offset = MASTER_BLOCK_SIZE as u64 + pos;
        let contiguous = self.region_size - pos;
        (offset, contiguous)
    }

    /// Split a write of `len` bytes starting at `lsn` into one or two
    /// physical segments `(offset, len)`. A second segment is returned only
    /// when the write crosses the end of the ring.
    pub fn split(&self, lsn: Lsn, len: u64) -> (SegmentPlan, Option<SegmentPlan>) {
        let (offset, contiguous) = self.map(lsn);
        if len <= contiguous {
            (SegmentPlan { offset, len }, None)
        } else {
            let head = SegmentPlan { offset, len: contiguous };
            let tail = SegmentPlan {
                offset: MASTER_BLOCK_SIZE as u64,
                len: len - contiguous,
            };
            (head, Some(tail))
        }
    }

    /// The LSN immediately following a record of `len` bytes starting at
    /// `lsn`. LSNs themselves are never wrapped — only their file-offset
    /// mapping is circular — so this is plain addition.
    pub fn advance(&self, lsn: Lsn, len: u64) -> Lsn {
        lsn + len
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentPlan {
    pub offset: u64,
    pub len: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_non_wrapping_lsn() {
        let space = LsnSpace {
            region_size: 12 * 1024,
        };
        let (offset, contiguous) = space.map(0);
        assert_eq!(offset, MASTER_BLOCK_SIZE as u64);
        assert_eq!(contiguous, 12 * 1024);
    }

    #[test]
    fn splits_record_crossing_ring_end() {
        // R = 12 KiB, previous writes leave next = R - 2 KiB.
        let space = LsnSpace {
            region_size: 12 * 1024,
        };
        let lsn = space.region_size - 2 * 1024;
        let (head, tail) = space.split(lsn, 4 * 1024);
        assert_eq!(head.offset, MASTER_BLOCK_SIZE as u64 + lsn);
        assert_eq!(head.len, 2 * 1024);
        let tail = tail.expect("should split");
        assert_eq!(tail.offset, MASTER_BLOCK_SIZE as u64);
        assert_eq!(tail.len, 2 * 1024);
    }

    #[test]
    fn does_not_split_when_it_fits() {
        let space = LsnSpace {
            region_size: 12 * 1024,
        };
        let (head, tail) = space.split(0, 4096);
        assert_eq!(head.len, 4096);
        assert!(tail.is_none());
    }
}
