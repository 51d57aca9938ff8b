//! In-memory layout of the shared region.
//!
//! Every struct here is `#[repr(C)]`, valid when zero-initialized (the
//! kernel hands the mapping back zeroed), and built exclusively from
//! atomics so parent and children can touch their own fields without
//! tearing. The region is `RegionHeader` followed immediately by
//! `instance_count` copies of `InstanceBlock`.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Number of named metric slots per instance.
pub const METRIC_SLOTS: usize = 96;

/// Inline capacity of a metric slot description, in bytes.
pub const METRIC_DESC_LEN: usize = 48;

/// Magic value identifying a Torsion region.
pub(crate) const REGION_MAGIC: u32 = 0x544F_5253; // "TORS"

/// Region layout version.
pub(crate) const REGION_VERSION: u32 = 1;

/// Rendezvous state for the synchronized-start barrier.
///
/// Lives in the header; see [`crate::barrier::StartBarrier`] for the
/// wait protocol.
#[repr(C)]
pub struct BarrierBlock {
    /// Number of instances that must arrive before release.
    pub(crate) participants: AtomicU32,
    /// Instances arrived so far.
    pub(crate) arrived: AtomicU32,
    /// Release flag; level-triggered, set once per run.
    pub(crate) release: AtomicU32,
    _pad: AtomicU32,
}

/// Header at offset zero of the shared region.
#[repr(C, align(128))]
pub struct RegionHeader {
    magic: AtomicU32,
    version: AtomicU32,
    instance_count: AtomicU32,
    /// Global continue flag: 1 while the run is live, 0 once the
    /// deadline fired or a manual stop was requested. Level-triggered.
    run_flag: AtomicU32,
    pub(crate) barrier: BarrierBlock,
}

impl RegionHeader {
    /// Initialize the header in a freshly zeroed mapping.
    pub(crate) fn init(&self, instances: u32) {
        self.magic.store(REGION_MAGIC, Ordering::Relaxed);
        self.version.store(REGION_VERSION, Ordering::Relaxed);
        self.instance_count.store(instances, Ordering::Relaxed);
        self.run_flag.store(1, Ordering::Release);
    }

    /// Whether the header carries the expected magic/version.
    pub fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == REGION_MAGIC
            && self.version.load(Ordering::Relaxed) == REGION_VERSION
    }

    /// Number of instance blocks following the header.
    pub fn instance_count(&self) -> u32 {
        self.instance_count.load(Ordering::Relaxed)
    }

    /// Whether the run is still live. Relaxed; callers tolerate
    /// observing the flip one poll late.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.run_flag.load(Ordering::Relaxed) != 0
    }

    /// Flip the continue flag. Level-triggered: stays flipped, so
    /// late-starting instances still observe it. Async-signal-safe.
    #[inline]
    pub fn halt(&self) {
        self.run_flag.store(0, Ordering::Release);
    }
}

/// Redundant copy of an instance's counter data plus a CRC.
///
/// Written only by the parent (snapshot) and verified at report time;
/// a mismatch means something scribbled over the region.
#[repr(C)]
pub struct ChecksumSlot {
    /// Copy of the bogo-ops counter at snapshot time.
    pub(crate) counter_copy: AtomicU64,
    /// Copy of the run flags: bit 0 = run_ok, bit 1 = force_killed.
    pub(crate) flags_copy: AtomicU32,
    /// CRC32 over the padded payload (counter_copy + flags_copy).
    pub(crate) crc: AtomicU32,
    /// Non-zero once a snapshot has been recorded.
    pub(crate) valid: AtomicU32,
    _pad: [AtomicU32; 3],
}

/// One named, typed secondary measurement slot.
///
/// Single-writer (the owning instance); the parent reads slots only
/// after the instance is reaped, so plain release/relaxed pairs are
/// enough.
#[repr(C)]
pub struct MetricSlot {
    /// f64 bit pattern of the measurement value.
    pub(crate) value_bits: AtomicU64,
    /// Aggregation kind + 1; 0 means the slot is unused.
    pub(crate) kind_tag: AtomicU32,
    /// Length of the description in `desc`.
    pub(crate) desc_len: AtomicU32,
    /// Inline description bytes (truncated copy of the caller's
    /// static or owned string).
    pub(crate) desc: [AtomicU8; METRIC_DESC_LEN],
}

/// Per-instance statistics block.
///
/// Exactly one process owns (writes) a block while the instance is
/// alive; the parent's reads go through the seqlock-style protocol in
/// [`crate::counter`]. Cache-line aligned so neighboring instances do
/// not false-share.
#[repr(C, align(128))]
pub struct InstanceBlock {
    /// Monotonic bogo-ops counter. Non-decreasing while `run_ok`
    /// holds.
    pub(crate) counter: AtomicU64,
    /// Per-instance op ceiling. `u64::MAX` when unbounded; cleared to
    /// 0 by the deadline controller so the continue predicate goes
    /// false.
    pub(crate) max_ops: AtomicU64,
    /// 0 only inside the bracketed counter-update window.
    pub(crate) ready: AtomicU32,
    /// Counter contents are valid for reporting.
    pub(crate) run_ok: AtomicU32,
    /// Set by the OOM supervisor when the worker was kernel-killed and
    /// respawned; tells the parent a signal death here is expected.
    pub(crate) force_killed: AtomicU32,
    /// Last self-reported lifecycle state (`InstanceState` as u32).
    pub(crate) state: AtomicU32,
    /// Spinlock word for counters declared multi-writer.
    pub(crate) lock: AtomicU32,
    _pad: AtomicU32,
    /// Redundant checksummed copy, parent-maintained.
    pub(crate) check: ChecksumSlot,
    /// Named metric slots, merged at report time.
    pub(crate) metrics: [MetricSlot; METRIC_SLOTS],
}

impl InstanceBlock {
    /// Reset a block to its pre-run state. Called once per instance by
    /// the parent before forking; also used by tests on standalone
    /// blocks.
    pub fn reset(&self, max_ops: u64) {
        self.counter.store(0, Ordering::Relaxed);
        self.max_ops.store(max_ops, Ordering::Relaxed);
        self.ready.store(1, Ordering::Release);
        self.run_ok.store(0, Ordering::Relaxed);
        self.force_killed.store(0, Ordering::Relaxed);
        self.state.store(0, Ordering::Relaxed);
        self.lock.store(0, Ordering::Relaxed);
        self.check.valid.store(0, Ordering::Relaxed);
    }

    /// Allocate a zeroed standalone block (tests and single-process
    /// harnesses; real blocks live inside the mapping).
    pub fn new_boxed() -> Box<Self> {
        // SAFETY: every field is an atomic integer (or an array of
        // them), all of which are valid when zero-initialized.
        let block: Box<Self> = unsafe { Box::new_zeroed().assume_init() };
        block.reset(u64::MAX);
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, size_of};

    #[test]
    fn test_layout_sizes() {
        // The handler walks blocks by pointer arithmetic; the layout
        // must be what the offset math assumes.
        assert_eq!(size_of::<RegionHeader>() % align_of::<InstanceBlock>(), 0);
        assert_eq!(size_of::<MetricSlot>(), 16 + METRIC_DESC_LEN);
        assert_eq!(align_of::<InstanceBlock>(), 128);
        assert_eq!(size_of::<InstanceBlock>() % 128, 0);
    }

    #[test]
    fn test_header_init() {
        let header: Box<RegionHeader> =
            // SAFETY: all fields are atomics, valid when zeroed.
            unsafe { Box::new_zeroed().assume_init() };
        assert!(!header.is_valid());
        header.init(4);
        assert!(header.is_valid());
        assert_eq!(header.instance_count(), 4);
        assert!(header.is_running());
        header.halt();
        assert!(!header.is_running());
        // Level-triggered: stays flipped.
        assert!(!header.is_running());
    }

    #[test]
    fn test_block_reset() {
        let block = InstanceBlock::new_boxed();
        block.counter.store(99, Ordering::Relaxed);
        block.run_ok.store(1, Ordering::Relaxed);
        block.reset(1000);
        assert_eq!(block.counter.load(Ordering::Relaxed), 0);
        assert_eq!(block.max_ops.load(Ordering::Relaxed), 1000);
        assert_eq!(block.ready.load(Ordering::Relaxed), 1);
        assert_eq!(block.run_ok.load(Ordering::Relaxed), 0);
    }
}
