//! OOM-resilient child supervisor.
//!
//! Memory stressors are expected to trip the kernel's OOM killer. To
//! keep the run alive, an oomable workload does not run directly in
//! the instance process: the instance forks one more time, raises the
//! child's OOM score so the kernel prefers it over the supervisor,
//! and waits. When the child dies in a way the [`OomPolicy`] classes
//! as an OOM kill and the run is still live, the supervisor marks the
//! counter `force_killed` and forks a replacement that inherits the
//! same counter slice — progress up to the last committed increment
//! survives, only the in-flight unit is lost. A thrashing kill loop
//! is bounded only by the run deadline.

use crate::error::{Error, Result};
use crate::status::ExitCode;
use crate::workload::{RunArgs, Workload};
use rustix::process::{Pid, WaitOptions};
use std::time::Duration;

/// How a waited-on process left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with the given code.
    Exited(u8),
    /// Terminated by the given signal.
    Signaled(i32),
}

/// Injectable OOM-kill detection predicate.
///
/// Which signal/exit-code combination means "the kernel OOM-killed
/// this process" is platform policy, not a universal constant, so the
/// heuristic is a replaceable function rather than hard-coded logic.
pub type OomDetector = fn(ExitReason) -> bool;

/// Default heuristic: Linux's OOM killer delivers SIGKILL.
pub fn default_oom_detector(reason: ExitReason) -> bool {
    matches!(reason, ExitReason::Signaled(sig) if sig == libc::SIGKILL)
}

/// Policy knobs for the OOM supervisor.
#[derive(Clone, Copy, Debug)]
pub struct OomPolicy {
    /// Predicate classifying a wait status as an OOM kill.
    pub detector: OomDetector,
    /// `oom_score_adj` written for the supervised child (higher is
    /// more killable; the parent keeps its own score).
    pub score_adj: i16,
    /// Fork attempts before giving up with a resource error.
    pub max_fork_retries: u32,
    /// Initial delay between fork retries; doubles per attempt.
    pub fork_retry_delay: Duration,
}

impl Default for OomPolicy {
    fn default() -> Self {
        Self {
            detector: default_oom_detector,
            score_adj: 1000,
            max_fork_retries: 8,
            fork_retry_delay: Duration::from_millis(50),
        }
    }
}

impl OomPolicy {
    /// Delay before the nth fork retry (exponential, capped at 1s).
    pub fn delay_for_retry(&self, attempt: u32) -> Duration {
        let delay = self.fork_retry_delay.as_secs_f64() * 2f64.powi(attempt as i32);
        Duration::from_secs_f64(delay.min(1.0))
    }
}

/// Run a workload in a forked, OOM-killable child, respawning it
/// transparently after kernel OOM kills.
///
/// Returns the child's exit code unchanged on clean exit or run
/// completion. Never returns in the child.
///
/// # Errors
///
/// [`Error::Resource`] when fork keeps failing past the retry bound.
pub fn supervise(
    workload: &mut Box<dyn Workload>,
    args: &mut RunArgs<'_>,
    policy: &OomPolicy,
) -> Result<ExitCode> {
    loop {
        let pid = fork_with_retry(policy)?;

        let Some(pid) = pid else {
            // Child: become the expendable worker.
            raise_oom_score(policy.score_adj);
            let code = run_workload(workload, args);
            // SAFETY: terminating the forked child without running
            // the parent's destructors or flushing its buffers.
            unsafe { libc::_exit(code.as_raw() as libc::c_int) };
        };

        match wait_for(pid)? {
            ExitReason::Exited(code) => return Ok(ExitCode::from_raw(code)),
            reason @ ExitReason::Signaled(sig) => {
                if !(policy.detector)(reason) {
                    tracing::debug!(signal = sig, "supervised worker died, not an oom kill");
                    return Ok(ExitCode::Signaled);
                }
                // Kernel reclaimed the worker. Progress up to the
                // last committed increment is preserved in the shared
                // counter slice.
                args.counter().set_force_killed();
                if !args.keep_going() {
                    return Ok(ExitCode::Success);
                }
                tracing::warn!(
                    stressor = args.name(),
                    instance = args.index(),
                    bogo_ops = args.counter().get(),
                    "worker oom-killed, respawning"
                );
                crate::observability::record_oom_respawn(args.name());
            }
        }
    }
}

/// Run a workload, converting panics into a failure exit code.
pub(crate) fn run_workload(workload: &mut Box<dyn Workload>, args: &mut RunArgs<'_>) -> ExitCode {
    let result =
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| workload.run(args)));
    match result {
        Ok(code) => code,
        Err(_) => {
            tracing::error!(stressor = args.name(), "workload panicked");
            ExitCode::GenericFailure
        }
    }
}

/// Fork, retrying with backoff on transient failure.
///
/// Returns `Some(pid)` in the parent, `None` in the child.
pub(crate) fn fork_with_retry(policy: &OomPolicy) -> Result<Option<Pid>> {
    let mut attempt = 0;
    loop {
        // SAFETY: plain fork; the child only touches async-safe state
        // before exec-free work or `_exit`.
        let pid = unsafe { libc::fork() };
        match pid {
            0 => return Ok(None),
            p if p > 0 => return Ok(Pid::from_raw(p)),
            _ => {
                let err = std::io::Error::last_os_error();
                if attempt >= policy.max_fork_retries {
                    return Err(Error::Resource(format!(
                        "fork failed after {attempt} retries: {err}"
                    )));
                }
                let delay = policy.delay_for_retry(attempt);
                tracing::debug!(%err, attempt, ?delay, "fork failed, retrying");
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Make this process preferentially OOM-killable.
///
/// Best effort: containers commonly deny the write, and the
/// supervisor still works — the kernel just spreads its kills less
/// predictably.
fn raise_oom_score(score_adj: i16) {
    if let Err(err) = std::fs::write("/proc/self/oom_score_adj", score_adj.to_string()) {
        tracing::debug!(%err, "could not raise oom_score_adj");
    }
}

/// Blocking wait for one child, retrying on EINTR.
pub(crate) fn wait_for(pid: Pid) -> Result<ExitReason> {
    loop {
        match rustix::process::waitpid(Some(pid), WaitOptions::empty()) {
            Ok(Some(status)) => {
                if let Some(reason) = decode(status) {
                    return Ok(reason);
                }
                // Stopped/continued: keep waiting.
            }
            Ok(None) => continue,
            Err(rustix::io::Errno::INTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Non-blocking reap of one child, retrying on EINTR at the next
/// poll tick instead of here.
pub(crate) fn try_reap(pid: Pid) -> Result<Option<ExitReason>> {
    match rustix::process::waitpid(Some(pid), WaitOptions::NOHANG) {
        Ok(Some(status)) => Ok(decode(status)),
        Ok(None) => Ok(None),
        Err(rustix::io::Errno::INTR) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn decode(status: rustix::process::WaitStatus) -> Option<ExitReason> {
    if let Some(code) = status.exit_status() {
        return Some(ExitReason::Exited(code as u8));
    }
    if let Some(sig) = status.terminating_signal() {
        return Some(ExitReason::Signaled(sig as i32));
    }
    None
}
