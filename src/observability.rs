//! Telemetry via metrics-rs.
//!
//! The run already reports bogo-ops through [`crate::run::RunReport`];
//! these counters additionally feed whatever exporter the embedding
//! application installed, so CI dashboards can watch long soak runs
//! live.

use metrics::Unit;
use std::sync::atomic::{AtomicBool, Ordering};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const BOGO_OPS: &str = "torsion_bogo_ops_total";
const OOM_RESPAWNS: &str = "torsion_oom_respawns_total";
const INSTANCES_FAILED: &str = "torsion_instances_failed_total";
const RUNS_COMPLETED: &str = "torsion_runs_completed_total";

/// Initialize metric descriptions.
///
/// Call once at application startup. Safe to call multiple times
/// (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        BOGO_OPS,
        Unit::Count,
        "Total bogo-ops counted across reaped instances"
    );
    metrics::describe_counter!(
        OOM_RESPAWNS,
        Unit::Count,
        "Workers respawned after a kernel OOM kill"
    );
    metrics::describe_counter!(
        INSTANCES_FAILED,
        Unit::Count,
        "Worker instances that ended in failure"
    );
    metrics::describe_counter!(RUNS_COMPLETED, Unit::Count, "Completed runs by status");
}

/// Record bogo-ops for a reaped instance.
#[inline]
pub fn record_bogo_ops(stressor: &str, ops: u64) {
    metrics::counter!(BOGO_OPS, "stressor" => stressor.to_string()).increment(ops);
}

/// Record a worker respawn after an OOM kill.
#[inline]
pub fn record_oom_respawn(stressor: &str) {
    metrics::counter!(OOM_RESPAWNS, "stressor" => stressor.to_string()).increment(1);
}

/// Record a failed instance.
#[inline]
pub fn record_instance_failed(stressor: &str) {
    metrics::counter!(INSTANCES_FAILED, "stressor" => stressor.to_string()).increment(1);
}

/// Record a completed run with its final status.
#[inline]
pub fn record_run_completed(status: &str) {
    metrics::counter!(RUNS_COMPLETED, "status" => status.to_string()).increment(1);
}
