//! Built-in demonstration workloads.
//!
//! The interesting stress workloads live out of tree; these few exist
//! so the core can be exercised end-to-end — by the test suite and by
//! embedders smoke-testing a deployment — using only the public
//! workload contract.

use crate::metrics::AggregationKind;
use crate::status::ExitCode;
use crate::workload::{Catalog, RunArgs, StressClass, StressorDescriptor, Workload};
use std::hint::black_box;

/// Inner arithmetic rounds per bogo-op.
const CPU_ROUNDS: u32 = 16_384;

/// Floating-point churn: square roots in a tight loop.
struct CpuWorkload;

impl Workload for CpuWorkload {
    fn run(&mut self, args: &mut RunArgs<'_>) -> ExitCode {
        let mut x = 0.5f64;
        while args.keep_going() {
            for i in 0..CPU_ROUNDS {
                x = black_box((x + i as f64).sqrt());
            }
            args.inc(1);
        }
        args.metrics().set(
            0,
            "sqrt rounds per bogo-op",
            CPU_ROUNDS as f64,
            AggregationKind::Maximum,
        );
        ExitCode::Success
    }
}

/// Scheduler churn: one voluntary context switch per bogo-op.
struct YieldWorkload;

impl Workload for YieldWorkload {
    fn run(&mut self, args: &mut RunArgs<'_>) -> ExitCode {
        while args.keep_going() {
            std::thread::yield_now();
            args.inc(1);
        }
        args.metrics().set(
            0,
            "voluntary context switches",
            args.counter().get() as f64,
            AggregationKind::Sum,
        );
        ExitCode::Success
    }
}

/// Busy spin with the pause hint; the cheapest possible bogo-op,
/// useful for measuring the core's own overhead.
struct SpinWorkload;

impl Workload for SpinWorkload {
    fn run(&mut self, args: &mut RunArgs<'_>) -> ExitCode {
        while args.keep_going() {
            for _ in 0..CPU_ROUNDS {
                std::hint::spin_loop();
            }
            args.inc(1);
        }
        ExitCode::Success
    }
}

/// Register the built-in workloads.
pub(crate) fn register_builtins(catalog: &mut Catalog) {
    catalog.register(
        StressorDescriptor::new("cpu", || Box::new(CpuWorkload))
            .with_classes(&[StressClass::Cpu])
            .with_sync_start(true),
    );
    catalog.register(
        StressorDescriptor::new("yield", || Box::new(YieldWorkload))
            .with_classes(&[StressClass::Scheduler]),
    );
    catalog.register(
        StressorDescriptor::new("spin", || Box::new(SpinWorkload))
            .with_classes(&[StressClass::Cpu])
            .with_sync_start(true),
    );
}
