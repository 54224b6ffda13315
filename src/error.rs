use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessState;

/// Main error type for the toolfleet supervisor
#[derive(Debug, Error)]
pub enum FleetError {
    // Registry errors
    #[error("Process not found: {0}")]
    NotFound(String),

    #[error("Duplicate process id: {0}")]
    DuplicateId(String),

    #[error("Invalid state transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ProcessState,
        to: ProcessState,
    },

    // Lifecycle errors
    #[error("Process {0} is already running")]
    AlreadyRunning(String),

    #[error("Failed to spawn process {0}: {1}")]
    SpawnFailure(String, String),

    #[error("Restart limit exceeded for process {0}")]
    RestartLimitExceeded(String),

    #[error("Failed to stop process {0}: {1}")]
    StopError(String, String),

    #[error("Signal error: {0}")]
    SignalError(String),

    // Health errors
    #[error("Health probe for {0} exceeded {1:?}")]
    HealthCheckTimeout(String, Duration),

    // Polling errors
    #[error("Poll timed out after {0:?}")]
    PollTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transient unavailability: {0}")]
    TransientUnavailable(String),

    #[error("Fatal request error: {0}")]
    FatalRequest(String),

    // Configuration errors
    #[error("Invalid launch spec: {0}")]
    InvalidSpec(String),

    // IO errors (automatically converted from std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for toolfleet operations
pub type Result<T> = std::result::Result<T, FleetError>;
