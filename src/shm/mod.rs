//! Shared memory region management.
//!
//! One memfd-backed `MAP_SHARED` region is created before any worker is
//! forked and inherited by every child. It holds a [`RegionHeader`]
//! (global continue flag + start barrier) followed by one
//! [`InstanceBlock`] per worker (bogo-ops counter, checksum record,
//! state word, metric slots).
//!
//! Ownership of each instance block is statically partitioned by
//! instance index at allocation time, so the hot path needs no locks:
//! exactly one process writes a given block while it is alive, and the
//! parent only reads it through the consistency protocols in
//! [`crate::counter`] and [`crate::checksum`].

mod layout;
mod region;

pub use layout::{BarrierBlock, ChecksumSlot, InstanceBlock, MetricSlot, RegionHeader};
pub use layout::{METRIC_DESC_LEN, METRIC_SLOTS};
pub use region::SharedRegion;
