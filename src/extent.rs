//! Allocation extents
//!
//! An extent is a contiguous byte range of an image classified as data or
//! as a hole (logically zero). A query for a range yields extents that are
//! ordered by start, non-overlapping, and together cover the range exactly.
//! The wire form matches the imageio `GET /extents` JSON.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
    #[serde(default)]
    pub zero: bool,
}

impl Extent {
    pub fn data(start: u64, length: u64) -> Self {
        Extent {
            start,
            length,
            zero: false,
        }
    }

    pub fn zero(start: u64, length: u64) -> Self {
        Extent {
            start,
            length,
            zero: true,
        }
    }

    /// End offset (exclusive).
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Check the extent-list invariant for a requested range: contiguous,
/// ordered, non-overlapping, exact coverage.
pub fn covers_exactly(extents: &[Extent], start: u64, length: u64) -> bool {
    let mut pos = start;
    for e in extents {
        if e.start != pos || e.length == 0 {
            return false;
        }
        pos = e.end();
    }
    pos == start + length
}

/// Merge adjacent extents of the same kind. Sources frequently report
/// fragmented maps; merging here keeps the planner's coalescing simple.
pub fn merge(extents: Vec<Extent>) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for e in extents {
        if e.length == 0 {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.zero == e.zero && last.end() == e.start => {
                last.length += e.length;
            }
            _ => out.push(e),
        }
    }
    out
}
