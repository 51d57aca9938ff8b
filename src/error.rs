//! Error types for Torsion.

use thiserror::Error;

/// Result type alias using Torsion's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Torsion operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A resource could not be obtained (mapping, fork, allocation).
    ///
    /// Fatal to the affected instance; aborts the run if it happens
    /// before any instance starts.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// A workload reported failure.
    ///
    /// Marks that stressor as failed; sibling stressors continue.
    #[error("workload '{name}' failed with code {code}")]
    Workload {
        /// Name of the failing stressor.
        name: String,
        /// Exit code the workload returned.
        code: u8,
    },

    /// A counter block failed its redundant checksum verification.
    ///
    /// The run's throughput numbers are still reported, flagged as
    /// untrustworthy.
    #[error("counter corruption detected in instance {instance}")]
    Corruption {
        /// Index of the corrupted instance block.
        instance: usize,
    },

    /// An unknown stressor name was requested.
    #[error("unknown stressor: {0}")]
    UnknownStressor(String),

    /// Invalid run configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}

impl Error {
    /// The process exit code this error maps to when it aborts a run.
    pub fn exit_code(&self) -> crate::status::ExitCode {
        use crate::status::ExitCode;
        match self {
            Error::Resource(_) => ExitCode::NoResource,
            Error::Workload { code, .. } => ExitCode::from_raw(*code),
            Error::Corruption { .. } => ExitCode::MetricsUntrustworthy,
            Error::UnknownStressor(_) => ExitCode::NotImplemented,
            Error::Config(_) | Error::Io(_) | Error::System(_) => ExitCode::GenericFailure,
        }
    }
}
