//! Transfer planner
//!
//! Turns an extent map plus the sparse/backing-chain policy into the work
//! items the scheduler executes. Item order follows ascending source
//! offset, but execution order across connections is unordered.

use crate::extent::{merge, Extent};

/// Largest single copy item. Bounds per-request memory and keeps progress
/// updates flowing on large allocations.
pub const MAX_COPY_ITEM: u64 = 128 * 1024 * 1024;

/// Largest single zero item. Zero requests carry no payload so they can be
/// much larger than copy items.
pub const MAX_ZERO_ITEM: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CopyData,
    WriteZero,
}

/// One unit of transfer work. Owned by exactly one connection from
/// dispatch until success or terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkItem {
    pub offset: u64,
    pub length: u64,
    pub action: Action,
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    /// Reproduce holes with zero requests instead of transmitting bytes.
    /// When false the target is expected to be fully allocated already and
    /// the whole range is copied.
    pub sparse: bool,
    /// When false, only extents allocated in the top image are copied;
    /// unallocated regions are skipped entirely, not zeroed.
    pub backing_chain: bool,
    pub max_copy_item: u64,
    pub max_zero_item: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        PlanOptions {
            sparse: true,
            backing_chain: true,
            max_copy_item: MAX_COPY_ITEM,
            max_zero_item: MAX_ZERO_ITEM,
        }
    }
}

/// Build the work-item sequence for one transfer.
///
/// The extents must satisfy the coverage invariant for the transferred
/// range. Zero-length input produces no items.
pub fn plan(extents: Vec<Extent>, opts: &PlanOptions) -> Vec<WorkItem> {
    let extents = merge(extents);
    if extents.is_empty() {
        return Vec::new();
    }

    if !opts.backing_chain {
        // Copy only what the top image allocates. Holes read through to
        // the backing file on the source, so writing or zeroing them
        // would corrupt the target's own chain.
        return extents
            .iter()
            .filter(|e| !e.zero)
            .flat_map(|e| split(e.start, e.length, Action::CopyData, opts.max_copy_item))
            .collect();
    }

    if !opts.sparse {
        // Preallocated target: transmit everything, holes included.
        let start = extents[0].start;
        let end = extents[extents.len() - 1].end();
        return split(start, end - start, Action::CopyData, opts.max_copy_item);
    }

    extents
        .iter()
        .flat_map(|e| {
            if e.zero {
                split(e.start, e.length, Action::WriteZero, opts.max_zero_item)
            } else {
                split(e.start, e.length, Action::CopyData, opts.max_copy_item)
            }
        })
        .collect()
}

fn split(start: u64, length: u64, action: Action, max: u64) -> Vec<WorkItem> {
    let mut items = Vec::new();
    let mut offset = start;
    let mut remaining = length;
    while remaining > 0 {
        let n = remaining.min(max);
        items.push(WorkItem {
            offset,
            length: n,
            action,
        });
        offset += n;
        remaining -= n;
    }
    items
}
