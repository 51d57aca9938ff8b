//! # Torsion
//!
//! A fork-based workload-generation and OS-robustness stress-testing
//! core.
//!
//! For each selected workload ("stressor"), Torsion forks a
//! configurable number of worker processes that hammer an OS facility
//! until a deadline or bogo-op ceiling is reached, then reports
//! per-workload throughput with corruption-detecting redundancy.
//!
//! ## Architecture
//!
//! - **Shared region**: one memfd-backed mapping, created before any
//!   fork, holding per-instance counters, checksum records, and
//!   metric slots — statically partitioned by instance, no hot-path
//!   locks
//! - **Workers**: independently scheduled OS processes moving through
//!   a fixed lifecycle state machine
//! - **Sync start**: a shared-memory spin barrier so timed work
//!   starts simultaneously
//! - **OOM resilience**: oomable workloads run in an expendable
//!   grandchild that is respawned transparently after kernel kills
//! - **Deadline**: a SIGALRM flip of a level-triggered continue flag,
//!   with SIGTERM/SIGKILL escalation for stragglers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use torsion::prelude::*;
//! use std::time::Duration;
//!
//! let config = RunConfig::new()
//!     .with_stressor(StressorSpec::new("cpu", 4))
//!     .with_duration(Duration::from_secs(10));
//!
//! let report = Run::new(config)?.execute()?;
//! println!("{} bogo-ops, status {}", report.total_bogo_ops(), report.status);
//! std::process::exit(report.exit_code().as_raw() as i32);
//! # Ok::<(), torsion::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod checksum;
pub mod config;
pub mod controller;
pub mod counter;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod run;
pub mod shm;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod workload;
pub mod workloads;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{RunConfig, StressorSpec};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::AggregationKind;
    pub use crate::run::{Run, RunReport, StopHandle, StressorSummary};
    pub use crate::state::InstanceState;
    pub use crate::status::{ExitCode, RunStatus};
    pub use crate::workload::{Catalog, RunArgs, StressClass, StressorDescriptor, Workload};
}

pub use error::{Error, Result};
