//! Custom error types for the harness.
//!
//! This module defines the primary error type, `HarnessError`, shared by every
//! layer of the crate. Using the `thiserror` crate, it keeps expected hardware
//! flakiness and contract violations in one place while letting callers tell
//! them apart.
//!
//! ## Error Hierarchy
//!
//! - **Recoverable** failures describe the bench misbehaving: a port is not
//!   reachable (`ConnectionUnavailable`), a call exceeded its bound
//!   (`CommandTimeout`), a settings batch only partially applied
//!   (`PartialConfigurationFailure`), or the sampling worker never saw the
//!   start signal (`SynchronizationTimeout`). The sequencer routes these
//!   through the step's fault policy.
//! - **Terminal** failures end a run: a critical step failed (`StepFailure`)
//!   or the operator asked to stop (`CancellationRequested`).
//! - **Contract violations** are programming errors, such as starting a second
//!   collection session (`SessionActive`) or a malformed scenario
//!   (`InvalidScenario`). They are never downgraded by a fault policy.
//! - **Ambient** errors wrap configuration, I/O and export problems.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::experiment::RunStatus;

/// Convenience alias for results using the harness error type.
pub type HarnessResult<T> = std::result::Result<T, HarnessError>;

/// Collaborator port that produced a connectivity error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    /// Programmable power supply / monitor
    Power,
    /// Device-control channel
    Device,
    /// Data-acquisition hardware
    Acquisition,
    /// Result persistence
    ResultSink,
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Port::Power => write!(f, "power control"),
            Port::Device => write!(f, "device control"),
            Port::Acquisition => write!(f, "acquisition"),
            Port::ResultSink => write!(f, "result sink"),
        }
    }
}

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum HarnessError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{port} unavailable: {message}")]
    ConnectionUnavailable { port: Port, message: String },

    #[error("{operation} timed out after {timeout:?}")]
    CommandTimeout { operation: String, timeout: Duration },

    #[error("Partial configuration: {applied}/{total} settings applied")]
    PartialConfigurationFailure { applied: usize, total: usize },

    #[error("Start signal not received within {deadline:?}")]
    SynchronizationTimeout { deadline: Duration },

    #[error("Step '{step}' failed: {reason}")]
    StepFailure { step: String, reason: String },

    #[error("Cancellation requested")]
    CancellationRequested,

    #[error("Scenario not found: {0}")]
    ScenarioNotFound(String),

    #[error("Invalid scenario '{key}': {reason}")]
    InvalidScenario { key: String, reason: String },

    #[error("A collection session is already active")]
    SessionActive,

    #[error("Engine busy: cannot start while {0}")]
    EngineBusy(RunStatus),

    #[error("Export failed: {0}")]
    Export(String),
}

impl From<figment::Error> for HarnessError {
    fn from(value: figment::Error) -> Self {
        HarnessError::Config(Box::new(value))
    }
}

#[cfg(feature = "storage_csv")]
impl From<csv::Error> for HarnessError {
    fn from(value: csv::Error) -> Self {
        HarnessError::Export(value.to_string())
    }
}

impl HarnessError {
    /// Whether the error describes expected bench flakiness.
    ///
    /// Recoverable errors are handed to the step's fault policy; everything
    /// else ends the run regardless of policy.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            HarnessError::ConnectionUnavailable { .. }
                | HarnessError::CommandTimeout { .. }
                | HarnessError::PartialConfigurationFailure { .. }
                | HarnessError::SynchronizationTimeout { .. }
                | HarnessError::Export(_)
                | HarnessError::Io(_)
        )
    }

    /// Whether the error is a cooperative stop rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, HarnessError::CancellationRequested)
    }

    /// Shorthand for a port connectivity error.
    pub fn unavailable(port: Port, message: impl Into<String>) -> Self {
        HarnessError::ConnectionUnavailable {
            port,
            message: message.into(),
        }
    }
}
