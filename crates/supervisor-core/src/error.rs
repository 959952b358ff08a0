//! Error types for the service supervisor.
//!
//! `SupervisorError` covers failures of individual OS process operations.
//! `StartError` and `StopError` are the synchronous outcomes of the public
//! start/stop requests; failures discovered after a service is up are only
//! reported through status events.

use crate::monitor::LifecycleState;
use std::time::Duration;
use thiserror::Error;

/// Error type for process-level operations.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to signal process {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Other(String),
}

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, SupervisorError>;

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

/// Reasons a `start_service` request is refused or fails.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("Too many services registered ({count}); stop the running services first")]
    TooManyServices { count: usize },

    #[error("Service `{running}` is already running; stop it before starting another")]
    DifferentServiceRunning { running: String },

    #[error("`{command}` is already running under service `{service}`")]
    AlreadyRunning { service: String, command: String },

    #[error(
        "Service `{service}` is {state} and cannot accept new processes{}",
        render_rollback(.rollback_errors)
    )]
    ServiceStopping {
        service: String,
        state: LifecycleState,
        rollback_errors: Vec<String>,
    },

    #[error("No command lines given")]
    NoCommands,

    #[error("Failed to start `{command}`: {detail}{}", render_rollback(.rollback_errors))]
    SpawnFailed {
        command: String,
        detail: String,
        rollback_errors: Vec<String>,
    },

    #[error("`{command}` exited during startup{}", render_rollback(.rollback_errors))]
    EarlyExit {
        command: String,
        rollback_errors: Vec<String>,
    },
}

impl StartError {
    /// Errors collected while undoing a partial start, if any.
    pub fn rollback_errors(&self) -> &[String] {
        match self {
            StartError::SpawnFailed {
                rollback_errors, ..
            }
            | StartError::EarlyExit {
                rollback_errors, ..
            }
            | StartError::ServiceStopping {
                rollback_errors, ..
            } => rollback_errors,
            _ => &[],
        }
    }
}

fn render_rollback(errors: &[String]) -> String {
    if errors.is_empty() {
        String::new()
    } else {
        format!("; rollback errors: {}", errors.join("; "))
    }
}

/// Reasons a `stop_service` request is refused.
#[derive(Debug, Error)]
pub enum StopError {
    #[error(
        "Service was started too recently; try again in {} seconds",
        remaining_secs(.remaining)
    )]
    TooSoon { remaining: Duration },

    #[error("Service `{service}` failed to stop earlier; acknowledge the failure to clear it")]
    TeardownFailed { service: String },
}

impl StopError {
    /// Whole seconds left in the debounce window, rounded up.
    pub fn remaining_secs(&self) -> Option<u64> {
        match self {
            StopError::TooSoon { remaining } => Some(remaining_secs(remaining)),
            StopError::TeardownFailed { .. } => None,
        }
    }
}

fn remaining_secs(remaining: &Duration) -> u64 {
    let secs = remaining.as_secs();
    if remaining.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}
