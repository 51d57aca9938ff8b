//! Workload contract and stressor catalog.
//!
//! A workload is the code a worker instance repeats until told to
//! stop. It sees the core only through [`RunArgs`]: the continue
//! predicate, the bogo-ops counter, the metric slots, and an
//! observational state setter. Workloads are registered in a
//! [`Catalog`] under a stable name and resolved once at configuration
//! time — never looked up by string on the hot path.

use crate::barrier::StartBarrier;
use crate::counter::BogoCounter;
use crate::metrics::MetricsHandle;
use crate::shm::{InstanceBlock, RegionHeader};
use crate::state::InstanceState;
use crate::status::ExitCode;
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Broad classification of what a stressor exercises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StressClass {
    /// CPU compute.
    Cpu,
    /// Memory subsystem.
    Memory,
    /// Virtual memory / paging.
    Vm,
    /// Scheduler behavior.
    Scheduler,
    /// Filesystem and I/O.
    Io,
    /// General OS interfaces.
    Os,
}

/// Everything a workload may touch while running.
///
/// Carries the instance's identity, its slice of the shared region,
/// and the run deadline. Cheap to pass around; all accessors are
/// non-blocking and safe at high frequency.
pub struct RunArgs<'a> {
    name: &'a str,
    index: usize,
    total: usize,
    page_size: usize,
    deadline: Option<Instant>,
    header: &'a RegionHeader,
    block: &'a InstanceBlock,
}

impl<'a> RunArgs<'a> {
    pub(crate) fn new(
        name: &'a str,
        index: usize,
        total: usize,
        deadline: Option<Instant>,
        header: &'a RegionHeader,
        block: &'a InstanceBlock,
    ) -> Self {
        Self {
            name,
            index,
            total,
            page_size: rustix::param::page_size(),
            deadline,
            header,
            block,
        }
    }

    /// Stressor name this instance runs.
    pub fn name(&self) -> &str {
        self.name
    }

    /// This instance's index within its stressor (0..N-1).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Total instance count for this stressor.
    pub fn instances(&self) -> usize {
        self.total
    }

    /// System page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Wall-clock deadline for the run, if bounded.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The instance's bogo-ops counter.
    pub fn counter(&self) -> BogoCounter<'a> {
        BogoCounter::new(self.header, self.block)
    }

    /// The instance's metric slots.
    pub fn metrics(&self) -> MetricsHandle<'a> {
        MetricsHandle::new(self.block)
    }

    /// The continue predicate. Poll this at workload-chosen
    /// granularity; once it returns `false` no new countable work
    /// unit may begin (in-flight units may finish).
    #[inline]
    pub fn keep_going(&self) -> bool {
        self.counter().keep_going()
    }

    /// Count `n` completed bogo-ops.
    #[inline]
    pub fn inc(&self, n: u64) {
        self.counter().increment(n);
    }

    /// Record a lifecycle state for diagnostics. Observational only.
    pub fn set_state(&self, state: InstanceState) {
        self.block.set_state(state);
    }

    pub(crate) fn barrier(&self) -> StartBarrier<'a> {
        StartBarrier::new(self.header)
    }
}

/// A stress workload: one self-contained function exercising some OS
/// facility in a loop.
///
/// Implementations poll [`RunArgs::keep_going`] and count completed
/// units with [`RunArgs::inc`]. The return value is the instance's
/// exit code.
pub trait Workload: Send {
    /// Run the workload until the continue predicate goes false.
    fn run(&mut self, args: &mut RunArgs<'_>) -> ExitCode;
}

impl<F> Workload for F
where
    F: FnMut(&mut RunArgs<'_>) -> ExitCode + Send,
{
    fn run(&mut self, args: &mut RunArgs<'_>) -> ExitCode {
        self(args)
    }
}

type WorkloadFactory = Arc<dyn Fn() -> Box<dyn Workload> + Send + Sync>;

/// Immutable catalog entry describing one stressor.
#[derive(Clone)]
pub struct StressorDescriptor {
    name: String,
    classes: Vec<StressClass>,
    sync_start: bool,
    oomable: bool,
    factory: WorkloadFactory,
}

impl StressorDescriptor {
    /// Describe a stressor with the given entry factory.
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Workload> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            classes: Vec::new(),
            sync_start: false,
            oomable: false,
            factory: Arc::new(factory),
        }
    }

    /// Tag the stressor with classes.
    pub fn with_classes(mut self, classes: &[StressClass]) -> Self {
        self.classes = classes.to_vec();
        self
    }

    /// Opt into the synchronized-start barrier.
    pub fn with_sync_start(mut self, sync_start: bool) -> Self {
        self.sync_start = sync_start;
        self
    }

    /// Run the workload under the OOM-resilient supervisor.
    pub fn with_oomable(mut self, oomable: bool) -> Self {
        self.oomable = oomable;
        self
    }

    /// Stressor name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Class tags.
    pub fn classes(&self) -> &[StressClass] {
        &self.classes
    }

    /// Whether instances rendezvous before timed work.
    pub fn sync_start(&self) -> bool {
        self.sync_start
    }

    /// Whether instances run under the OOM supervisor.
    pub fn oomable(&self) -> bool {
        self.oomable
    }

    /// Instantiate a fresh workload.
    pub(crate) fn instantiate(&self) -> Box<dyn Workload> {
        (self.factory)()
    }
}

impl std::fmt::Debug for StressorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StressorDescriptor")
            .field("name", &self.name)
            .field("classes", &self.classes)
            .field("sync_start", &self.sync_start)
            .field("oomable", &self.oomable)
            .finish_non_exhaustive()
    }
}

/// Name-indexed registry of stressor descriptors.
///
/// Built once at startup; [`resolve`](Self::resolve) happens at
/// configuration time so running instances never do string lookups.
#[derive(Clone, Default)]
pub struct Catalog {
    entries: HashMap<String, StressorDescriptor>,
}

impl Catalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog of built-in workloads.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        crate::workloads::register_builtins(&mut catalog);
        catalog
    }

    /// Register a descriptor, replacing any previous entry with the
    /// same name.
    pub fn register(&mut self, descriptor: StressorDescriptor) {
        if self
            .entries
            .insert(descriptor.name().to_string(), descriptor)
            .is_some()
        {
            tracing::debug!("catalog entry replaced");
        }
    }

    /// Look up a stressor by name.
    pub fn resolve(&self, name: &str) -> Result<&StressorDescriptor> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownStressor(name.to_string()))
    }

    /// Whether a stressor is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
