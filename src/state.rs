//! Per-instance lifecycle state machine.
//!
//! Every worker instance moves through a fixed sequence of states,
//! recorded in its shared-memory block so the parent can tell how far
//! a crashed or killed child progressed. Transitions are forward-only
//! with one exception: `Stop` is reachable from any active state on
//! external request. The last three states are observed and recorded
//! by the parent, never self-reported by the child.

/// Lifecycle state of a worker instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InstanceState {
    /// Process forked, nothing run yet.
    Start = 0,
    /// Workload setup in progress.
    Init = 1,
    /// Timed work loop executing.
    Run = 2,
    /// Spinning at the synchronized-start barrier.
    SyncWait = 3,
    /// Workload teardown in progress.
    Deinit = 4,
    /// Work finished or externally stopped; about to exit.
    Stop = 5,
    /// Parent observed the process exit.
    Exit = 6,
    /// Parent is waiting to reap the process.
    Wait = 7,
    /// Process reaped; slot is dead.
    Zombie = 8,
}

impl InstanceState {
    /// Decode a state from its shared-memory representation.
    ///
    /// Unknown values (corrupted block) decode to `None`.
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => InstanceState::Start,
            1 => InstanceState::Init,
            2 => InstanceState::Run,
            3 => InstanceState::SyncWait,
            4 => InstanceState::Deinit,
            5 => InstanceState::Stop,
            6 => InstanceState::Exit,
            7 => InstanceState::Wait,
            8 => InstanceState::Zombie,
            _ => return None,
        })
    }

    /// Whether a transition from `self` to `next` is allowed.
    ///
    /// The machine is forward-monotonic. `Stop` is additionally
    /// reachable from every active state so an external stop request
    /// can interrupt setup, the run loop, the barrier wait, or
    /// teardown. `Exit`/`Wait`/`Zombie` are parent-observed.
    pub fn can_transition(self, next: Self) -> bool {
        use InstanceState::*;
        match (self, next) {
            (Start, Init) => true,
            (Init, Run) | (Init, SyncWait) => true,
            (SyncWait, Run) => true,
            (Run, Deinit) => true,
            (Deinit, Stop) => true,
            // External stop from any active state.
            (Init, Stop) | (Run, Stop) | (SyncWait, Stop) => true,
            // Parent-observed tail.
            (Stop, Exit) => true,
            (Exit, Wait) => true,
            (Wait, Zombie) => true,
            _ => false,
        }
    }

    /// Whether the instance self-reports this state (vs. the parent
    /// recording it from the outside).
    pub fn is_self_reported(self) -> bool {
        !matches!(
            self,
            InstanceState::Exit | InstanceState::Wait | InstanceState::Zombie
        )
    }

    /// Whether a child that last reported this state had finished its
    /// countable work (reached teardown or beyond). Used to
    /// distinguish a clean stop from a crash mid-run.
    pub fn completed_work(self) -> bool {
        matches!(
            self,
            InstanceState::Deinit
                | InstanceState::Stop
                | InstanceState::Exit
                | InstanceState::Wait
                | InstanceState::Zombie
        )
    }
}

impl crate::shm::InstanceBlock {
    /// Record a self-reported state in the shared block.
    ///
    /// Purely observational: no scheduling effect. An out-of-order
    /// report is still recorded (the block must reflect what the child
    /// last claimed) but traced for diagnostics.
    pub fn set_state(&self, next: InstanceState) {
        if let Some(prev) = self.last_state() {
            if prev != next && !prev.can_transition(next) {
                tracing::trace!(%prev, %next, "out-of-order state report");
            }
        }
        self.state.store(next as u32, std::sync::atomic::Ordering::Release);
    }

    /// The last state recorded in the block, or `None` if the word is
    /// corrupted.
    pub fn last_state(&self) -> Option<InstanceState> {
        InstanceState::from_u32(self.state.load(std::sync::atomic::Ordering::Acquire))
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Start => "start",
            InstanceState::Init => "init",
            InstanceState::Run => "run",
            InstanceState::SyncWait => "sync-wait",
            InstanceState::Deinit => "deinit",
            InstanceState::Stop => "stop",
            InstanceState::Exit => "exit",
            InstanceState::Wait => "wait",
            InstanceState::Zombie => "zombie",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u32_roundtrip() {
        for raw in 0..=8u32 {
            let state = InstanceState::from_u32(raw).unwrap();
            assert_eq!(state as u32, raw);
        }
        assert_eq!(InstanceState::from_u32(9), None);
        assert_eq!(InstanceState::from_u32(u32::MAX), None);
    }

    #[test]
    fn test_forward_path() {
        use InstanceState::*;
        let path = [Start, Init, Run, Deinit, Stop, Exit, Wait, Zombie];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition(pair[1]),
                "{} -> {} should be allowed",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_sync_wait_path() {
        use InstanceState::*;
        assert!(Init.can_transition(SyncWait));
        assert!(SyncWait.can_transition(Run));
        assert!(!SyncWait.can_transition(Deinit));
    }

    #[test]
    fn test_stop_reachable_from_active_states() {
        use InstanceState::*;
        for from in [Init, Run, SyncWait, Deinit] {
            assert!(from.can_transition(Stop), "{from} -> stop");
        }
        assert!(!Start.can_transition(Stop));
        assert!(!Zombie.can_transition(Stop));
    }

    #[test]
    fn test_no_backward_transitions() {
        use InstanceState::*;
        assert!(!Run.can_transition(Init));
        assert!(!Deinit.can_transition(Run));
        assert!(!Zombie.can_transition(Start));
        assert!(!Stop.can_transition(Run));
    }

    #[test]
    fn test_self_reported_split() {
        use InstanceState::*;
        for s in [Start, Init, Run, SyncWait, Deinit, Stop] {
            assert!(s.is_self_reported());
        }
        for s in [Exit, Wait, Zombie] {
            assert!(!s.is_self_reported());
        }
    }

    #[test]
    fn test_block_state_roundtrip() {
        let block = crate::shm::InstanceBlock::new_boxed();
        assert_eq!(block.last_state(), Some(InstanceState::Start));
        block.set_state(InstanceState::Init);
        block.set_state(InstanceState::Run);
        assert_eq!(block.last_state(), Some(InstanceState::Run));
        // Out-of-order reports are still recorded.
        block.set_state(InstanceState::Init);
        assert_eq!(block.last_state(), Some(InstanceState::Init));
    }

    #[test]
    fn test_completed_work() {
        use InstanceState::*;
        assert!(!Run.completed_work());
        assert!(!SyncWait.completed_work());
        assert!(Deinit.completed_work());
        assert!(Stop.completed_work());
    }
}
