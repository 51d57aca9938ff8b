//! Synchronized-start barrier.
//!
//! Stressors that opt into synchronized start must not begin timed
//! work until every participating instance is ready, or the first
//! forks get a head start and skew the throughput numbers. Each
//! participant bumps a rendezvous counter in the shared header and
//! spins — atomic ops plus bounded backoff, no kernel wait primitive —
//! until the last arriver resets the counter and flips the release
//! flag, letting everyone through together. Skew is bounded by
//! scheduler latency.

use crate::shm::RegionHeader;
use std::sync::atomic::Ordering;

/// Spins before the wait loop starts yielding the CPU.
const SPIN_BUDGET: u32 = 10_000;

/// Handle to the rendezvous barrier in the region header.
#[derive(Clone, Copy)]
pub struct StartBarrier<'a> {
    header: &'a RegionHeader,
}

impl<'a> StartBarrier<'a> {
    /// Build a barrier handle over the region header.
    pub fn new(header: &'a RegionHeader) -> Self {
        Self { header }
    }

    /// Set the number of participants. Called by the parent before
    /// any instance is forked.
    pub fn set_participants(&self, n: u32) {
        self.header.barrier.participants.store(n, Ordering::Release);
    }

    /// Number of participants configured for this run.
    pub fn participants(&self) -> u32 {
        self.header.barrier.participants.load(Ordering::Relaxed)
    }

    /// Rendezvous with the other participants.
    ///
    /// The last arriver resets the rendezvous counter and flips the
    /// release flag (level-triggered for the rest of the run); everyone
    /// else spins on it. Every spin iteration re-checks the global
    /// continue flag so a deadline that fires before all instances
    /// arrive cannot deadlock the survivors.
    ///
    /// Returns `true` when released, `false` when the run was halted
    /// while waiting.
    pub fn wait(&self) -> bool {
        let b = &self.header.barrier;
        let participants = b.participants.load(Ordering::Acquire);
        if participants <= 1 {
            b.release.store(1, Ordering::Release);
            return self.header.is_running();
        }

        let arrived = b.arrived.fetch_add(1, Ordering::AcqRel) + 1;
        if arrived >= participants {
            b.arrived.store(0, Ordering::Relaxed);
            b.release.store(1, Ordering::Release);
            return true;
        }

        let mut spins: u32 = 0;
        while b.release.load(Ordering::Acquire) == 0 {
            if !self.header.is_running() {
                return false;
            }
            spins = spins.wrapping_add(1);
            if spins < SPIN_BUDGET {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        true
    }

    /// Whether the barrier has released (diagnostics).
    pub fn released(&self) -> bool {
        self.header.barrier.release.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::RegionHeader;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn test_header(instances: u32) -> Arc<RegionHeader> {
        // SAFETY: all header fields are atomics, valid zeroed.
        let header: Box<RegionHeader> = unsafe { Box::new_zeroed().assume_init() };
        header.init(instances);
        Arc::from(header)
    }

    #[test]
    fn test_single_participant_passes_through() {
        let header = test_header(1);
        let barrier = StartBarrier::new(&header);
        barrier.set_participants(1);
        assert!(barrier.wait());
        assert!(barrier.released());
    }

    #[test]
    fn test_no_release_before_all_arrive() {
        let header = test_header(4);
        StartBarrier::new(&header).set_participants(4);

        let arrivals = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let header = Arc::clone(&header);
            let arrivals = Arc::clone(&arrivals);
            handles.push(std::thread::spawn(move || {
                let barrier = StartBarrier::new(&header);
                arrivals.fetch_add(1, Ordering::SeqCst);
                let released = barrier.wait();
                // By the time anyone is released, every sibling has
                // arrived.
                let seen = arrivals.load(Ordering::SeqCst);
                (released, seen, Instant::now())
            }));
        }

        for handle in handles {
            let (released, seen, _) = handle.join().unwrap();
            assert!(released);
            assert_eq!(seen, 4);
        }
    }

    #[test]
    fn test_halt_unblocks_waiters() {
        let header = test_header(3);
        StartBarrier::new(&header).set_participants(3);

        // Only 2 of 3 participants ever arrive.
        let mut handles = Vec::new();
        for _ in 0..2 {
            let header = Arc::clone(&header);
            handles.push(std::thread::spawn(move || StartBarrier::new(&header).wait()));
        }

        std::thread::sleep(std::time::Duration::from_millis(20));
        header.halt();

        for handle in handles {
            assert!(!handle.join().unwrap(), "halted waiters must not hang");
        }
    }

    #[test]
    fn test_release_is_level_triggered() {
        let header = test_header(2);
        let barrier = StartBarrier::new(&header);
        barrier.set_participants(2);

        let h2 = Arc::clone(&header);
        let t = std::thread::spawn(move || StartBarrier::new(&h2).wait());
        assert!(barrier.wait());
        assert!(t.join().unwrap());

        // A straggler arriving after release passes immediately.
        assert!(barrier.released());
    }
}
