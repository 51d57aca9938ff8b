//! Run orchestration: fork, poll, reap, report.
//!
//! The parent is single-threaded control logic. It allocates the
//! shared region, arms the deadline, forks every instance, then sits
//! in a bounded poll loop — reaping with WNOHANG, refreshing checksum
//! snapshots, and escalating stragglers once the run is halted. After
//! the last reap it verifies the counters and assembles the report.

use crate::checksum;
use crate::config::RunConfig;
use crate::controller::{self, DeadlineController};
use crate::error::Result;
use crate::metrics::{merge_metrics, AggregatedMetric, Metric, MetricsHandle};
use crate::shm::SharedRegion;
use crate::state::InstanceState;
use crate::status::{ExitCode, RunStatus};
use crate::supervisor::{self, ExitReason};
use crate::workload::{Catalog, RunArgs, StressorDescriptor};
use rustix::process::Pid;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parent-side bookkeeping for one forked worker.
struct Instance {
    global_index: usize,
    stressor: usize,
    pid: Option<Pid>,
    outcome: Option<Outcome>,
    reaped_at: Option<Instant>,
}

/// How an instance ended, and whether the run had already been halted
/// when the parent observed it.
#[derive(Clone, Copy, Debug)]
struct Outcome {
    reason: ExitReason,
    halted: bool,
}

/// Per-stressor results after all instances are reaped.
#[derive(Clone, Debug)]
pub struct StressorSummary {
    /// Stressor name.
    pub name: String,
    /// Instances that ran.
    pub instances: usize,
    /// Total bogo-ops across instances.
    pub bogo_ops: u64,
    /// Wall-clock time from fork to last reap.
    pub elapsed: Duration,
    /// Throughput over `elapsed`.
    pub ops_per_sec: f64,
    /// Metrics merged across instances.
    pub metrics: Vec<AggregatedMetric>,
    /// Outcome of this stressor.
    pub status: RunStatus,
}

/// Results of a completed run.
#[derive(Clone, Debug)]
pub struct RunReport {
    /// Per-stressor summaries, in configuration order.
    pub stressors: Vec<StressorSummary>,
    /// Overall status: worst across stressors, with corruption
    /// dominating.
    pub status: RunStatus,
    /// Wall-clock duration of the whole run.
    pub elapsed: Duration,
}

impl RunReport {
    /// The process exit code the run maps to.
    pub fn exit_code(&self) -> ExitCode {
        match self.status {
            RunStatus::Passed | RunStatus::Skipped => ExitCode::Success,
            RunStatus::Failed => ExitCode::NotSuccess,
            RunStatus::BadMetrics => ExitCode::MetricsUntrustworthy,
        }
    }

    /// Total bogo-ops across all stressors.
    pub fn total_bogo_ops(&self) -> u64 {
        self.stressors.iter().map(|s| s.bogo_ops).sum()
    }
}

/// Handle for stopping a run from outside the executing thread.
///
/// Performs the same level-triggered flag flip as the deadline alarm.
/// Holds only a weak reference: stopping after the run finished is a
/// no-op.
#[derive(Clone)]
pub struct StopHandle {
    region: std::sync::Weak<SharedRegion>,
}

impl StopHandle {
    /// Request the run stop. In-flight work units may finish; no new
    /// countable unit begins after the flip.
    pub fn stop(&self) {
        if let Some(region) = self.region.upgrade() {
            controller::stop(&region);
        }
    }
}

/// One configured execution: a stressor set, instance counts, and a
/// deadline.
///
/// The shared region is allocated (and sealed) at construction so it
/// exists before any fork; [`execute`](Self::execute) forks the
/// workers and blocks until the run completes.
pub struct Run {
    config: RunConfig,
    catalog: Catalog,
    region: Arc<SharedRegion>,
}

impl Run {
    /// Validate the configuration and allocate the shared region.
    pub fn new(config: RunConfig) -> Result<Self> {
        config.validate()?;
        let region = SharedRegion::allocate(config.total_instances())?;
        region.freeze()?;
        Ok(Self {
            config,
            catalog: Catalog::builtin(),
            region: Arc::new(region),
        })
    }

    /// Replace the built-in catalog.
    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// A handle that can stop this run from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            region: Arc::downgrade(&self.region),
        }
    }

    /// Fork the workers, run to completion, and report.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownStressor`] before anything is forked;
    /// [`Error::Resource`] if forking fails past the retry bound (the
    /// already-forked instances are killed and reaped first).
    pub fn execute(self) -> Result<RunReport> {
        crate::observability::init_metrics();
        let Run {
            config,
            catalog,
            region,
        } = self;

        // Resolve every name up front; no string lookups after this.
        let mut resolved: Vec<StressorDescriptor> = Vec::with_capacity(config.stressors.len());
        for spec in &config.stressors {
            resolved.push(catalog.resolve(&spec.name)?.clone());
        }

        // Barrier membership is fixed before the first fork.
        let participants: usize = config
            .stressors
            .iter()
            .zip(&resolved)
            .filter(|(_, desc)| desc.sync_start())
            .map(|(spec, _)| spec.instances)
            .sum();
        crate::barrier::StartBarrier::new(region.header()).set_participants(participants as u32);

        // Per-instance op ceilings.
        let mut global = 0usize;
        for spec in &config.stressors {
            for _ in 0..spec.instances {
                region
                    .instance(global)
                    .reset(spec.max_ops.unwrap_or(u64::MAX));
                global += 1;
            }
        }

        let started = Instant::now();
        let deadline = config.duration.map(|d| started + d);
        let mut alarm = DeadlineController::new();
        if let Some(duration) = config.duration {
            alarm.arm(&region, duration)?;
        }

        // Fork every instance.
        let mut instances: Vec<Instance> = Vec::with_capacity(config.total_instances());
        let mut global = 0usize;
        for (sidx, (spec, desc)) in config.stressors.iter().zip(&resolved).enumerate() {
            for local in 0..spec.instances {
                match supervisor::fork_with_retry(&config.oom_policy) {
                    Ok(Some(pid)) => {
                        tracing::debug!(
                            stressor = %spec.name,
                            instance = global,
                            pid = pid.as_raw_nonzero().get(),
                            "instance forked"
                        );
                        instances.push(Instance {
                            global_index: global,
                            stressor: sidx,
                            pid: Some(pid),
                            outcome: None,
                            reaped_at: None,
                        });
                    }
                    Ok(None) => {
                        child_main(&region, desc, spec.instances, global, local, deadline, &config)
                    }
                    Err(err) => {
                        tracing::error!(%err, stressor = %spec.name, "aborting run");
                        alarm.disarm();
                        controller::stop(&region);
                        kill_and_reap(&mut instances);
                        return Err(err);
                    }
                }
                global += 1;
            }
        }

        poll_until_reaped(&region, &mut instances, &config)?;
        alarm.disarm();

        let elapsed = started.elapsed();
        let report = build_report(&region, &config, &instances, started, elapsed);
        crate::observability::record_run_completed(&report.status.to_string());
        tracing::debug!(status = %report.status, ?elapsed, "run complete");

        // Deterministic release: every instance is reaped. If a
        // StopHandle is mid-upgrade the mapping lives until it lets
        // go.
        if let Ok(region) = Arc::try_unwrap(region) {
            region.unmap();
        }
        Ok(report)
    }
}

/// Worker-side entry: runs the instance lifecycle and never returns.
fn child_main(
    region: &SharedRegion,
    desc: &StressorDescriptor,
    total: usize,
    global_index: usize,
    local_index: usize,
    deadline: Option<Instant>,
    config: &RunConfig,
) -> ! {
    let header = region.header();
    let block = region.instance(global_index);
    block.set_state(InstanceState::Init);

    let mut workload = desc.instantiate();
    let mut args = RunArgs::new(desc.name(), local_index, total, deadline, header, block);

    if desc.sync_start() {
        block.set_state(InstanceState::SyncWait);
        if !args.barrier().wait() {
            // Halted before release: clean stop, nothing counted.
            block.set_state(InstanceState::Stop);
            // SAFETY: child exit without running parent destructors.
            unsafe { libc::_exit(ExitCode::Success.as_raw() as libc::c_int) };
        }
    }

    block.set_state(InstanceState::Run);
    args.counter().set_run_ok();

    let code = if desc.oomable() {
        match supervisor::supervise(&mut workload, &mut args, &config.oom_policy) {
            Ok(code) => code,
            Err(err) => {
                tracing::error!(%err, "supervisor gave up");
                ExitCode::NoResource
            }
        }
    } else {
        supervisor::run_workload(&mut workload, &mut args)
    };

    block.set_state(InstanceState::Deinit);
    block.set_state(InstanceState::Stop);
    // SAFETY: child exit without running parent destructors.
    unsafe { libc::_exit(code.as_raw() as libc::c_int) };
}

/// Parent poll loop: WNOHANG reap + checksum snapshots + escalation.
fn poll_until_reaped(
    region: &SharedRegion,
    instances: &mut [Instance],
    config: &RunConfig,
) -> Result<()> {
    let mut halted_at: Option<Instant> = None;
    let mut termed = false;
    let mut killed = false;

    loop {
        let mut alive = 0usize;
        for inst in instances.iter_mut() {
            let Some(pid) = inst.pid else { continue };
            match supervisor::try_reap(pid)? {
                Some(reason) => reap_bookkeeping(region, inst, reason),
                None => {
                    alive += 1;
                    checksum::snapshot(region.instance(inst.global_index));
                }
            }
        }
        if alive == 0 {
            return Ok(());
        }

        if !region.header().is_running() {
            let halted = *halted_at.get_or_insert_with(Instant::now);
            let since = halted.elapsed();
            if !termed && since >= config.grace {
                tracing::warn!(alive, "grace expired, escalating to SIGTERM");
                for inst in instances.iter() {
                    if let Some(pid) = inst.pid {
                        controller::send_term(pid);
                    }
                }
                termed = true;
            } else if termed && !killed && since >= config.grace * 2 {
                tracing::warn!(alive, "instances survived SIGTERM, escalating to SIGKILL");
                for inst in instances.iter() {
                    if let Some(pid) = inst.pid {
                        controller::send_kill(pid);
                    }
                }
                killed = true;
            } else if killed && since >= config.grace * 3 {
                // Nothing survives SIGKILL; reap blockingly and be
                // done.
                for inst in instances.iter_mut() {
                    if let Some(pid) = inst.pid {
                        region
                            .instance(inst.global_index)
                            .set_state(InstanceState::Wait);
                        let reason = supervisor::wait_for(pid)?;
                        reap_bookkeeping(region, inst, reason);
                    }
                }
                return Ok(());
            }
        }

        std::thread::sleep(config.poll_interval);
    }
}

/// Record a reaped instance and advance its parent-observed states.
fn reap_bookkeeping(region: &SharedRegion, inst: &mut Instance, reason: ExitReason) {
    let block = region.instance(inst.global_index);
    block.set_state(InstanceState::Exit);
    block.set_state(InstanceState::Wait);
    inst.outcome = Some(Outcome {
        reason,
        halted: !region.header().is_running(),
    });
    inst.reaped_at = Some(Instant::now());
    inst.pid = None;
    block.set_state(InstanceState::Zombie);
    // Final snapshot now that the writer is gone; report-time
    // verification recomputes the hash against this record.
    checksum::snapshot_quiesced(block);
    tracing::debug!(
        instance = inst.global_index,
        ?reason,
        last_state = ?block.last_state(),
        "instance reaped"
    );
}

/// Abort path: SIGKILL and reap whatever was already forked.
fn kill_and_reap(instances: &mut [Instance]) {
    for inst in instances.iter() {
        if let Some(pid) = inst.pid {
            controller::send_kill(pid);
        }
    }
    for inst in instances.iter_mut() {
        if let Some(pid) = inst.pid.take() {
            let _ = supervisor::wait_for(pid);
        }
    }
}

/// Classify one instance's outcome.
///
/// A signal death is failure only when it was neither an expected
/// post-halt kill (deadline escalation) nor an OOM kill the
/// supervisor already recovered (`force_killed`).
fn classify(outcome: Option<&Outcome>, force_killed: bool) -> InstanceVerdict {
    match outcome {
        Some(Outcome {
            reason: ExitReason::Exited(code),
            ..
        }) => match ExitCode::from_raw(*code) {
            ExitCode::Success => InstanceVerdict::Ok,
            ExitCode::NotImplemented => InstanceVerdict::Skipped,
            _ => InstanceVerdict::Failed,
        },
        Some(Outcome {
            reason: ExitReason::Signaled(_),
            halted,
        }) => {
            if force_killed || *halted {
                InstanceVerdict::Ok
            } else {
                InstanceVerdict::Failed
            }
        }
        None => InstanceVerdict::Failed,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InstanceVerdict {
    Ok,
    Skipped,
    Failed,
}

/// Assemble the report: final snapshots, checksum verification,
/// metric merging, status folding.
fn build_report(
    region: &SharedRegion,
    config: &RunConfig,
    instances: &[Instance],
    run_start: Instant,
    elapsed: Duration,
) -> RunReport {
    let mut summaries = Vec::with_capacity(config.stressors.len());

    for (sidx, spec) in config.stressors.iter().enumerate() {
        let mut bogo_ops = 0u64;
        let mut failed = 0usize;
        let mut skipped = 0usize;
        let mut corrupted = false;
        let mut count = 0usize;
        let mut per_instance: Vec<Vec<Metric>> = Vec::new();
        let mut last_reap: Option<Instant> = None;

        for inst in instances.iter().filter(|i| i.stressor == sidx) {
            count += 1;
            let block = region.instance(inst.global_index);
            if checksum::verify(block, inst.global_index).is_err() {
                tracing::warn!(
                    stressor = %spec.name,
                    instance = inst.global_index,
                    "counter checksum mismatch"
                );
                corrupted = true;
            }

            // Raw read is safe: the instance is reaped.
            let counter = block.counter.load(Ordering::Acquire);
            bogo_ops += counter;
            crate::observability::record_bogo_ops(&spec.name, counter);
            per_instance.push(MetricsHandle::new(block).read_all());

            let force_killed = block.force_killed.load(Ordering::Acquire) != 0;
            match classify(inst.outcome.as_ref(), force_killed) {
                InstanceVerdict::Ok => {}
                InstanceVerdict::Skipped => skipped += 1,
                InstanceVerdict::Failed => {
                    crate::observability::record_instance_failed(&spec.name);
                    failed += 1;
                }
            }
            last_reap = last_reap.max(inst.reaped_at);
        }

        let status = if corrupted {
            RunStatus::BadMetrics
        } else if failed > 0 {
            RunStatus::Failed
        } else if count > 0 && skipped == count {
            RunStatus::Skipped
        } else {
            RunStatus::Passed
        };

        let stressor_elapsed = last_reap
            .map(|t| t.duration_since(run_start))
            .unwrap_or(elapsed);
        let secs = stressor_elapsed.as_secs_f64();
        let ops_per_sec = if secs > 0.0 { bogo_ops as f64 / secs } else { 0.0 };

        summaries.push(StressorSummary {
            name: spec.name.clone(),
            instances: count,
            bogo_ops,
            elapsed: stressor_elapsed,
            ops_per_sec,
            metrics: merge_metrics(&per_instance),
            status,
        });
    }

    let status = overall_status(&summaries);
    RunReport {
        stressors: summaries,
        status,
        elapsed,
    }
}

/// Fold per-stressor statuses into the run status. Corruption
/// dominates, then failure; all-skipped runs report Skipped.
fn overall_status(summaries: &[StressorSummary]) -> RunStatus {
    if summaries
        .iter()
        .any(|s| s.status == RunStatus::BadMetrics)
    {
        return RunStatus::BadMetrics;
    }
    if summaries.iter().any(|s| s.status == RunStatus::Failed) {
        return RunStatus::Failed;
    }
    if !summaries.is_empty() && summaries.iter().all(|s| s.status == RunStatus::Skipped) {
        return RunStatus::Skipped;
    }
    RunStatus::Passed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StressorSpec;
    use crate::error::Error;

    fn summary(name: &str, status: RunStatus) -> StressorSummary {
        StressorSummary {
            name: name.into(),
            instances: 1,
            bogo_ops: 0,
            elapsed: Duration::from_secs(1),
            ops_per_sec: 0.0,
            metrics: Vec::new(),
            status,
        }
    }

    #[test]
    fn test_overall_status_folding() {
        assert_eq!(
            overall_status(&[summary("a", RunStatus::Passed)]),
            RunStatus::Passed
        );
        assert_eq!(
            overall_status(&[
                summary("a", RunStatus::Passed),
                summary("b", RunStatus::Failed)
            ]),
            RunStatus::Failed
        );
        assert_eq!(
            overall_status(&[
                summary("a", RunStatus::Failed),
                summary("b", RunStatus::BadMetrics)
            ]),
            RunStatus::BadMetrics
        );
        assert_eq!(
            overall_status(&[
                summary("a", RunStatus::Skipped),
                summary("b", RunStatus::Skipped)
            ]),
            RunStatus::Skipped
        );
        assert_eq!(
            overall_status(&[
                summary("a", RunStatus::Skipped),
                summary("b", RunStatus::Passed)
            ]),
            RunStatus::Passed
        );
    }

    #[test]
    fn test_exit_code_distinguishes_bad_metrics_from_failed() {
        let failed = RunReport {
            stressors: vec![summary("a", RunStatus::Failed)],
            status: RunStatus::Failed,
            elapsed: Duration::from_secs(1),
        };
        let bad = RunReport {
            stressors: vec![summary("a", RunStatus::BadMetrics)],
            status: RunStatus::BadMetrics,
            elapsed: Duration::from_secs(1),
        };
        assert_eq!(failed.exit_code(), ExitCode::NotSuccess);
        assert_eq!(bad.exit_code(), ExitCode::MetricsUntrustworthy);
        assert_ne!(failed.exit_code(), bad.exit_code());
    }

    #[test]
    fn test_classify_outcomes() {
        let exited_ok = Outcome {
            reason: ExitReason::Exited(0),
            halted: false,
        };
        let exited_notimpl = Outcome {
            reason: ExitReason::Exited(4),
            halted: false,
        };
        let exited_fail = Outcome {
            reason: ExitReason::Exited(1),
            halted: false,
        };
        let killed_midrun = Outcome {
            reason: ExitReason::Signaled(libc::SIGKILL),
            halted: false,
        };
        let killed_after_halt = Outcome {
            reason: ExitReason::Signaled(libc::SIGKILL),
            halted: true,
        };

        assert_eq!(classify(Some(&exited_ok), false), InstanceVerdict::Ok);
        assert_eq!(
            classify(Some(&exited_notimpl), false),
            InstanceVerdict::Skipped
        );
        assert_eq!(classify(Some(&exited_fail), false), InstanceVerdict::Failed);
        // Scenario: SIGKILL mid-run, force_killed unset -> failure.
        assert_eq!(
            classify(Some(&killed_midrun), false),
            InstanceVerdict::Failed
        );
        // Same kill with the supervisor's force_killed mark -> ok.
        assert_eq!(classify(Some(&killed_midrun), true), InstanceVerdict::Ok);
        // Escalation kill after the deadline -> ok.
        assert_eq!(
            classify(Some(&killed_after_halt), false),
            InstanceVerdict::Ok
        );
        assert_eq!(classify(None, false), InstanceVerdict::Failed);
    }

    #[test]
    fn test_corrupted_record_yields_bad_metrics_report() {
        let region = SharedRegion::allocate(1).unwrap();
        let block = region.instance(0);
        block.reset(u64::MAX);
        block.counter.store(250, Ordering::Relaxed);
        checksum::snapshot_quiesced(block);
        // Corrupt the redundant record after the final snapshot.
        block.check.crc.store(
            block.check.crc.load(Ordering::Relaxed) ^ 0xdead_beef,
            Ordering::Relaxed,
        );

        let config = RunConfig::new().with_stressor(StressorSpec::new("cpu", 1));
        let instances = vec![Instance {
            global_index: 0,
            stressor: 0,
            pid: None,
            outcome: Some(Outcome {
                reason: ExitReason::Exited(0),
                halted: false,
            }),
            reaped_at: Some(Instant::now()),
        }];

        let report = build_report(
            &region,
            &config,
            &instances,
            Instant::now(),
            Duration::from_secs(1),
        );
        assert_eq!(report.status, RunStatus::BadMetrics);
        assert_eq!(report.exit_code(), ExitCode::MetricsUntrustworthy);
        // Throughput is still reported, just flagged.
        assert_eq!(report.stressors[0].bogo_ops, 250);
    }

    #[test]
    fn test_run_new_rejects_bad_config() {
        assert!(Run::new(RunConfig::new()).is_err());
    }

    #[test]
    fn test_execute_rejects_unknown_stressor_before_forking() {
        let config = RunConfig::new().with_stressor(StressorSpec::new("no-such", 1));
        let run = Run::new(config).unwrap();
        assert!(matches!(
            run.execute(),
            Err(Error::UnknownStressor(name)) if name == "no-such"
        ));
    }
}
