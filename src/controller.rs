//! Deadline and cancellation control.
//!
//! A bounded run arms a wall-clock alarm before any instance enters
//! its timed loop. The SIGALRM handler does the minimum a handler may
//! do: two kinds of atomic store through a pointer armed ahead of
//! time — flip the region's continue flag and zero every instance's
//! op ceiling — so the continue predicate goes false for every worker
//! on its next poll. The flip is level-triggered: it stays down, and
//! instances that start late still observe it. Everything else
//! (SIGTERM, SIGKILL, reaping) happens in ordinary polling code,
//! never in the handler.

use crate::error::Result;
use crate::shm::{InstanceBlock, RegionHeader, SharedRegion};
use rustix::process::{Pid, Signal};
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

/// Region header the SIGALRM handler acts on.
///
/// A signal handler cannot take arguments, so this is the one piece
/// of process-global state in the crate. Armed by
/// [`DeadlineController::arm`], cleared on disarm/drop — always
/// before the region is unmapped.
static ALARM_REGION: AtomicPtr<RegionHeader> = AtomicPtr::new(ptr::null_mut());

/// SIGALRM handler: flag flips only, all of them async-signal-safe.
extern "C" fn on_alarm(_sig: libc::c_int) {
    let header = ALARM_REGION.load(Ordering::Acquire);
    if header.is_null() {
        return;
    }
    // SAFETY: the pointer targets the live shared mapping; the
    // controller disarms (nulls it) before the mapping goes away.
    let header = unsafe { &*header };
    header.halt();

    let count = header.instance_count() as usize;
    // SAFETY: `count` InstanceBlocks follow the header in the same
    // mapping; see the region layout.
    let blocks = unsafe {
        (header as *const RegionHeader)
            .cast::<u8>()
            .add(size_of::<RegionHeader>())
            .cast::<InstanceBlock>()
    };
    for i in 0..count {
        // SAFETY: in-bounds per the layout, and the store is atomic.
        let block = unsafe { &*blocks.add(i) };
        block.max_ops.store(0, Ordering::Release);
    }
}

/// Flip the continue flag and clear the op ceilings from ordinary
/// code: the manual counterpart of the alarm handler, for explicit
/// external interrupts.
pub fn stop(region: &SharedRegion) {
    region.header().halt();
    for i in 0..region.instances() {
        region.instance(i).max_ops.store(0, Ordering::Release);
    }
    tracing::debug!("run stop requested");
}

/// Wall-clock deadline controller for one run.
///
/// Owns the SIGALRM disposition while armed; disarms on drop so a
/// dead run can never fire into an unmapped region.
#[derive(Default)]
pub struct DeadlineController {
    armed: bool,
}

impl DeadlineController {
    /// New, unarmed controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the alarm for `duration` over `region`.
    ///
    /// Must be called before any instance enters its timed loop. The
    /// handler is installed without SA_RESTART so the parent's
    /// blocking waits return with EINTR and observe the flip.
    pub fn arm(&mut self, region: &SharedRegion, duration: Duration) -> Result<()> {
        ALARM_REGION.store(region.header_ptr().cast_mut(), Ordering::Release);

        // SAFETY: installing a handler that performs only atomic
        // stores; sigaction itself is async-signal-safe to configure
        // from ordinary code.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_alarm as usize;
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = 0;
            if libc::sigaction(libc::SIGALRM, &action, ptr::null_mut()) != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        set_alarm(duration)?;
        self.armed = true;
        tracing::debug!(?duration, "deadline armed");
        Ok(())
    }

    /// Cancel the alarm and detach the handler from the region.
    pub fn disarm(&mut self) {
        if !self.armed {
            return;
        }
        // SAFETY: zeroed itimerval cancels the timer.
        unsafe {
            let clear: libc::itimerval = std::mem::zeroed();
            libc::setitimer(libc::ITIMER_REAL, &clear, ptr::null_mut());
        }
        ALARM_REGION.store(ptr::null_mut(), Ordering::Release);
        self.armed = false;
    }

    /// Whether the alarm is currently armed.
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

impl Drop for DeadlineController {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn set_alarm(duration: Duration) -> Result<()> {
    let timer = libc::itimerval {
        it_interval: libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        },
        it_value: libc::timeval {
            tv_sec: duration.as_secs() as libc::time_t,
            tv_usec: duration.subsec_micros() as libc::suseconds_t,
        },
    };
    // SAFETY: plain timer arm with a stack-local itimerval.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, ptr::null_mut()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// Ask an instance to exit cooperatively-adjacent: SIGTERM.
pub(crate) fn send_term(pid: Pid) {
    let _ = rustix::process::kill_process(pid, Signal::Term);
}

/// Final escalation: SIGKILL.
pub(crate) fn send_kill(pid: Pid) {
    let _ = rustix::process::kill_process(pid, Signal::Kill);
}
