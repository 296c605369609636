//! Error types for avd-pilot
//!
//! Every orchestrator operation fails with a [`LifecycleError`] that records
//! which step failed, the device's lifecycle state at that moment, and the
//! component error unchanged.

use std::fmt;
use std::time::Duration;

use avd_pilot_emulator_bridge::{AvdError, InstallError, LaunchError, ProcessError, ReadinessError};
use thiserror::Error;

use crate::config::ConfigError;
use crate::lifecycle::LifecycleState;

/// Orchestrator step that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Boot,
    WaitReady,
    Install,
    Launch,
    Shutdown,
}

impl Operation {
    pub fn phase(self) -> Phase {
        match self {
            Operation::Install | Operation::Launch => Phase::Deploy,
            Operation::Create | Operation::Boot | Operation::WaitReady | Operation::Shutdown => {
                Phase::Provision
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Boot => "boot",
            Operation::WaitReady => "wait-until-ready",
            Operation::Install => "install",
            Operation::Launch => "launch",
            Operation::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provisioning (create, boot, wait) or deployment (install, launch)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Provision,
    Deploy,
}

/// What went wrong
#[derive(Error, Debug)]
pub enum FailureKind {
    #[error(transparent)]
    Process(ProcessError),

    /// `avdmanager` could not create the AVD
    #[error(transparent)]
    Create(AvdError),

    #[error("{serial} did not finish booting within {waited:?} ({polls} polls)")]
    BootTimeout {
        serial: String,
        waited: Duration,
        polls: u32,
    },

    #[error(transparent)]
    DeviceUnresponsive(ReadinessError),

    #[error(transparent)]
    Install(InstallError),

    #[error(transparent)]
    Launch(LaunchError),

    #[error(transparent)]
    Configuration(ConfigError),

    #[error("{} requires state {}, device is {}", .operation, display_states(.expected), .actual)]
    StatePrecondition {
        operation: Operation,
        expected: &'static [LifecycleState],
        actual: LifecycleState,
    },

    #[error("operation was cancelled")]
    Cancelled,
}

fn display_states(states: &[LifecycleState]) -> String {
    states
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Error returned by every orchestrator operation
#[derive(Error, Debug)]
#[error("{operation} failed in state {state}: {kind}")]
pub struct LifecycleError {
    pub operation: Operation,
    /// Lifecycle state at the time of failure
    pub state: LifecycleState,
    /// Last resting state the device reached before the failure
    pub last_good: Option<LifecycleState>,
    #[source]
    pub kind: FailureKind,
}

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

impl LifecycleError {
    pub fn new(operation: Operation, state: LifecycleState, kind: FailureKind) -> Self {
        Self {
            operation,
            state,
            last_good: None,
            kind,
        }
    }

    pub fn with_last_good(mut self, state: Option<LifecycleState>) -> Self {
        self.last_good = state;
        self
    }

    pub fn precondition(
        operation: Operation,
        expected: &'static [LifecycleState],
        actual: LifecycleState,
    ) -> Self {
        Self::new(
            operation,
            actual,
            FailureKind::StatePrecondition {
                operation,
                expected,
                actual,
            },
        )
    }

    /// Taxonomy name of the failure
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            FailureKind::Process(_) | FailureKind::Create(_) => "ProcessError",
            FailureKind::BootTimeout { .. } => "BootTimeoutError",
            FailureKind::DeviceUnresponsive(_) => "DeviceUnresponsiveError",
            FailureKind::Install(_) => "InstallError",
            FailureKind::Launch(_) => "LaunchError",
            FailureKind::Configuration(_) => "ConfigurationError",
            FailureKind::StatePrecondition { .. } => "StatePreconditionError",
            FailureKind::Cancelled => "Cancelled",
        }
    }

    pub fn phase(&self) -> Phase {
        self.operation.phase()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.kind, FailureKind::Cancelled)
    }

    /// Retrying the whole provision or deploy call may succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::BootTimeout { .. }
                | FailureKind::DeviceUnresponsive(_)
                | FailureKind::Cancelled
        )
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        let detail = match &self.kind {
            FailureKind::Process(ProcessError::NotFound { program }) => format!(
                "{} not found. Set ANDROID_SDK_ROOT or pass --sdk.",
                program.display()
            ),
            FailureKind::Process(ProcessError::Exited { code, output_tail, .. }) => {
                let mut message = format!("emulator exited unexpectedly (code {:?})", code);
                for line in &output_tail[output_tail.len().saturating_sub(10)..] {
                    message.push_str("\n    ");
                    message.push_str(line);
                }
                message
            }
            FailureKind::BootTimeout { serial, waited, .. } => format!(
                "{} did not finish booting within {:?}. \
                 Consider raising timeouts.boot_max_wait_secs.",
                serial, waited
            ),
            FailureKind::Install(e) => e.to_string(),
            FailureKind::Launch(e) => e.to_string(),
            other => other.to_string(),
        };
        match self.last_good {
            Some(last_good) if last_good != self.state => format!(
                "{} during {} (state {}, last good {}): {}",
                self.kind_name(),
                self.operation,
                self.state,
                last_good,
                detail
            ),
            _ => format!(
                "{} during {} (state {}): {}",
                self.kind_name(),
                self.operation,
                self.state,
                detail
            ),
        }
    }
}
