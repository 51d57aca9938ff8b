//! Run status and process exit codes.
//!
//! Exit codes are part of the external contract: the CLI layer (out of
//! tree) maps them straight to the process exit status, and CI
//! pipelines key off them.

/// Final status of a stressor or of the whole run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunStatus {
    /// All instances completed and counters verified.
    Passed,
    /// At least one instance reported failure or died unexpectedly.
    Failed,
    /// The stressor declined to run (unsupported on this system).
    Skipped,
    /// Throughput numbers are reported but failed checksum
    /// verification and must not be trusted.
    BadMetrics,
}

impl RunStatus {
    /// Whether this status allows the run to count as successful.
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Skipped)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
            RunStatus::BadMetrics => "bad-metrics",
        };
        f.write_str(s)
    }
}

/// Process exit codes emitted by workers and by the run as a whole.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExitCode {
    /// Clean completion.
    #[default]
    Success = 0,
    /// Unspecified failure.
    GenericFailure = 1,
    /// A stressor ran but did not meet its success criteria.
    NotSuccess = 2,
    /// A required resource (memory, fork slot, mapping) was missing.
    NoResource = 3,
    /// The requested stressor is not implemented on this platform.
    NotImplemented = 4,
    /// A worker was terminated by an unexpected signal.
    Signaled = 5,
    /// A worker left via a raw process exit outside the run protocol.
    BySysExit = 6,
    /// Counter checksum verification failed; metrics untrustworthy.
    MetricsUntrustworthy = 7,
}

impl ExitCode {
    /// Decode an exit code from a raw wait status value.
    ///
    /// Unknown values collapse to [`ExitCode::GenericFailure`].
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ExitCode::Success,
            1 => ExitCode::GenericFailure,
            2 => ExitCode::NotSuccess,
            3 => ExitCode::NoResource,
            4 => ExitCode::NotImplemented,
            5 => ExitCode::Signaled,
            6 => ExitCode::BySysExit,
            7 => ExitCode::MetricsUntrustworthy,
            _ => ExitCode::GenericFailure,
        }
    }

    /// The raw value passed to `_exit`.
    pub fn as_raw(self) -> u8 {
        self as u8
    }

    /// Whether the code indicates success.
    pub fn is_success(self) -> bool {
        self == ExitCode::Success
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", *self as u8)
    }
}
