//! Bogo-ops counters.
//!
//! Each instance owns one monotonic counter in its shared-memory
//! block. The owner is the only writer on the hot path, so no lock is
//! needed — but updates are bracketed by a ready flag so a concurrent
//! reader (the parent's checksum snapshots) can tell a settled value
//! from one mid-update:
//!
//! ```text
//! ready := 0        (release)
//! counter := v + n  (release)
//! ready := 1        (release)
//! ```
//!
//! A reader that observes `ready == 1` before and after loading the
//! counter got a consistent value. Counters explicitly declared
//! multi-writer go through [`BogoCounter::add_locked`] instead, which
//! takes the block's spinlock.

use crate::shm::{InstanceBlock, RegionHeader};
use std::sync::atomic::Ordering;

/// Spin attempts for a consistent read before giving up for this tick.
const READ_RETRIES: usize = 64;

/// CAS attempts when acquiring the multi-writer lock.
const LOCK_RETRIES: usize = 1024;

/// A consistent snapshot of one counter block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// The bogo-ops counter value.
    pub counter: u64,
    /// Counter contents valid for reporting.
    pub run_ok: bool,
    /// Worker was kernel-killed and respawned by the supervisor.
    pub force_killed: bool,
}

/// Handle to one instance's bogo-ops counter.
///
/// Cheap to construct; holds only references into the shared region.
#[derive(Clone, Copy)]
pub struct BogoCounter<'a> {
    header: &'a RegionHeader,
    block: &'a InstanceBlock,
}

impl<'a> BogoCounter<'a> {
    /// Build a counter handle over an instance block.
    pub fn new(header: &'a RegionHeader, block: &'a InstanceBlock) -> Self {
        Self { header, block }
    }

    /// Add `n` to the counter using the bracketed single-writer
    /// protocol. Only the owning instance may call this.
    #[inline]
    pub fn increment(&self, n: u64) {
        let b = self.block;
        b.ready.store(0, Ordering::Release);
        let v = b.counter.load(Ordering::Relaxed);
        b.counter.store(v.saturating_add(n), Ordering::Release);
        b.ready.store(1, Ordering::Release);
    }

    /// Raw counter value. Safe for the owner at any time; safe for the
    /// parent only once the instance is inactive (use
    /// [`read_consistent`](Self::read_consistent) otherwise).
    #[inline]
    pub fn get(&self) -> u64 {
        self.block.counter.load(Ordering::Relaxed)
    }

    /// Add `n` under the block's writer lock, for counters shared by
    /// more than one writer.
    ///
    /// Returns `false` without touching the counter when the lock
    /// cannot be acquired within the spin budget; the caller falls
    /// back to the continue predicate and retries on its next loop.
    pub fn add_locked(&self, n: u64) -> bool {
        let lock = &self.block.lock;
        let mut acquired = false;
        for _ in 0..LOCK_RETRIES {
            if lock
                .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                acquired = true;
                break;
            }
            std::hint::spin_loop();
        }
        if !acquired {
            return false;
        }
        self.increment(n);
        lock.store(0, Ordering::Release);
        true
    }

    /// The continue predicate: run still live and counter below the
    /// op ceiling. Relaxed reads — eventual consistency is fine, and
    /// overshooting by one work unit is tolerated.
    #[inline]
    pub fn keep_going(&self) -> bool {
        self.header.is_running()
            && self.block.counter.load(Ordering::Relaxed)
                < self.block.max_ops.load(Ordering::Relaxed)
    }

    /// Mark the counter contents valid for reporting (entering RUN).
    pub fn set_run_ok(&self) {
        self.block.run_ok.store(1, Ordering::Release);
    }

    /// Mark the counter contents invalid (workload failure).
    pub fn clear_run_ok(&self) {
        self.block.run_ok.store(0, Ordering::Release);
    }

    /// Whether the counter contents are valid for reporting.
    pub fn run_ok(&self) -> bool {
        self.block.run_ok.load(Ordering::Acquire) != 0
    }

    /// Record that the worker was kernel-killed and respawned.
    pub fn set_force_killed(&self) {
        self.block.force_killed.store(1, Ordering::Release);
    }

    /// Whether the worker was kernel-killed and respawned.
    pub fn force_killed(&self) -> bool {
        self.block.force_killed.load(Ordering::Acquire) != 0
    }

    /// Consistent multi-field snapshot for a concurrent reader.
    ///
    /// Returns `None` when the writer held the update window open for
    /// the whole retry budget; the caller skips this tick and keeps
    /// its previous snapshot.
    pub fn read_consistent(&self) -> Option<CounterSnapshot> {
        read_consistent(self.block)
    }
}

/// Seqlock-style consistent read of a counter block.
pub(crate) fn read_consistent(block: &InstanceBlock) -> Option<CounterSnapshot> {
    for _ in 0..READ_RETRIES {
        if block.ready.load(Ordering::Acquire) == 0 {
            std::hint::spin_loop();
            continue;
        }
        let counter = block.counter.load(Ordering::Acquire);
        let run_ok = block.run_ok.load(Ordering::Relaxed) != 0;
        let force_killed = block.force_killed.load(Ordering::Relaxed) != 0;
        // Re-check: window still closed and value unmoved.
        if block.ready.load(Ordering::Acquire) == 1
            && block.counter.load(Ordering::Relaxed) == counter
        {
            return Some(CounterSnapshot {
                counter,
                run_ok,
                force_killed,
            });
        }
    }
    None
}
