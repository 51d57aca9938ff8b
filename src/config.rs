//! Run configuration.

use crate::error::{Error, Result};
use crate::supervisor::OomPolicy;
use std::time::Duration;

/// One stressor selection: which workload, how many instances, and an
/// optional bogo-op ceiling.
#[derive(Clone, Debug)]
pub struct StressorSpec {
    /// Catalog name of the workload.
    pub name: String,
    /// Number of worker processes to fork.
    pub instances: usize,
    /// Stop this stressor once each instance reaches this many
    /// bogo-ops. `None` means bounded by the run deadline only.
    pub max_ops: Option<u64>,
}

impl StressorSpec {
    /// Select `instances` workers of the named stressor.
    pub fn new(name: impl Into<String>, instances: usize) -> Self {
        Self {
            name: name.into(),
            instances,
            max_ops: None,
        }
    }

    /// Bound each instance to `max_ops` bogo-ops.
    pub fn with_max_ops(mut self, max_ops: u64) -> Self {
        self.max_ops = Some(max_ops);
        self
    }
}

/// Configuration for one run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Selected stressors with per-stressor instance counts.
    pub stressors: Vec<StressorSpec>,
    /// Wall-clock deadline; `None` runs until op ceilings or an
    /// external stop.
    pub duration: Option<Duration>,
    /// Grace period per escalation step once the run is halted
    /// (voluntary exit, then SIGTERM, then SIGKILL).
    pub grace: Duration,
    /// Parent poll-loop tick (reap + checksum snapshot cadence).
    pub poll_interval: Duration,
    /// OOM supervisor policy for oomable stressors.
    pub oom_policy: OomPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            stressors: Vec::new(),
            duration: None,
            grace: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            oom_policy: OomPolicy::default(),
        }
    }
}

impl RunConfig {
    /// Empty configuration; add stressors with
    /// [`with_stressor`](Self::with_stressor).
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stressor selection.
    pub fn with_stressor(mut self, spec: StressorSpec) -> Self {
        self.stressors.push(spec);
        self
    }

    /// Bound the run by wall-clock time.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Override the escalation grace period.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Override the parent poll interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Override the OOM supervisor policy.
    pub fn with_oom_policy(mut self, policy: OomPolicy) -> Self {
        self.oom_policy = policy;
        self
    }

    /// Total instance count across all stressors.
    pub fn total_instances(&self) -> usize {
        self.stressors.iter().map(|s| s.instances).sum()
    }

    /// Check the configuration for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.stressors.is_empty() {
            return Err(Error::Config("no stressors selected".into()));
        }
        for spec in &self.stressors {
            if spec.instances == 0 {
                return Err(Error::Config(format!(
                    "stressor '{}' selected with zero instances",
                    spec.name
                )));
            }
            if spec.max_ops == Some(0) {
                return Err(Error::Config(format!(
                    "stressor '{}' has a zero op ceiling",
                    spec.name
                )));
            }
        }
        if self.duration == Some(Duration::ZERO) {
            return Err(Error::Config("zero duration".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("zero poll interval".into()));
        }
        Ok(())
    }
}
