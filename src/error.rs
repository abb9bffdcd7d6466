//! Error types for the supervisor core.
//!
//! Follows the canonical-struct pattern used throughout the `airssys-osl`
//! collaborator framework: one `thiserror`-derived enum, named variants with
//! context fields, and `category()`/`is_*()` helpers for callers that want to
//! branch on error class without matching the full enum.

// Layer 1: Standard library imports
// (none)

// Layer 2: Third-party crate imports
use thiserror::Error;

// Layer 3: Internal module imports
// (none)

/// Result type alias for supervisor core operations.
pub type ForemanResult<T> = Result<T, ForemanError>;

/// Errors raised by the master control loop and its collaborators.
#[derive(Error, Debug)]
pub enum ForemanError {
    /// The self-pipe could not be created or configured at startup.
    #[error("failed to initialize self-pipe: {reason}")]
    SelfPipeInit { reason: String },

    /// A signal handler could not be installed at startup.
    #[error("failed to install handler for signal {signal}: {reason}")]
    SignalInstall { signal: i32, reason: String },

    /// A fork() call failed at the OS level.
    #[error("fork failed for queue-group '{queue_group}': {reason}")]
    ForkFailed { queue_group: String, reason: String },

    /// The queue-group string named a worker kind that was never registered.
    #[error("unknown worker kind '{kind}' in queue-group '{queue_group}'")]
    UnknownWorkerKind { kind: String, queue_group: String },

    /// waitpid()/kill() failed for a reason other than "no such process".
    #[error("process operation '{operation}' failed for pid {pid}: {reason}")]
    ProcessError {
        operation: String,
        pid: i32,
        reason: String,
    },

    /// The configuration collaborator failed to produce a `Configuration`.
    #[error("configuration load failed: {reason}")]
    ConfigLoad { reason: String },
}

impl ForemanError {
    pub fn self_pipe_init(reason: impl Into<String>) -> Self {
        Self::SelfPipeInit {
            reason: reason.into(),
        }
    }

    pub fn signal_install(signal: i32, reason: impl Into<String>) -> Self {
        Self::SignalInstall {
            signal,
            reason: reason.into(),
        }
    }

    pub fn fork_failed(queue_group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ForkFailed {
            queue_group: queue_group.into(),
            reason: reason.into(),
        }
    }

    pub fn unknown_worker_kind(kind: impl Into<String>, queue_group: impl Into<String>) -> Self {
        Self::UnknownWorkerKind {
            kind: kind.into(),
            queue_group: queue_group.into(),
        }
    }

    pub fn process_error(operation: impl Into<String>, pid: i32, reason: impl Into<String>) -> Self {
        Self::ProcessError {
            operation: operation.into(),
            pid,
            reason: reason.into(),
        }
    }

    pub fn config_load(reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            reason: reason.into(),
        }
    }

    /// Returns true if this error is fatal to the master process (§7).
    ///
    /// Only self-pipe initialization and signal handler installation failures
    /// are fatal; everything else is recoverable by the control loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SelfPipeInit { .. } | Self::SignalInstall { .. })
    }

    /// Returns true if the spawn that produced this error should simply be
    /// skipped rather than retried outside the backoff governor's cadence.
    pub fn is_spawn_skip(&self) -> bool {
        matches!(self, Self::UnknownWorkerKind { .. } | Self::ForkFailed { .. })
    }

    /// Short category tag for logging and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            Self::SelfPipeInit { .. } => "self_pipe",
            Self::SignalInstall { .. } => "signal_install",
            Self::ForkFailed { .. } => "fork",
            Self::UnknownWorkerKind { .. } => "worker_kind",
            Self::ProcessError { .. } => "process",
            Self::ConfigLoad { .. } => "config",
        }
    }
}
