//! Error types for loopback bridge operations

use crate::scsi::HostStatus;
use thiserror::Error;

/// Loopback bridge errors
#[derive(Debug, Error)]
pub enum LoopbackError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate name: {0}")]
    DuplicateName(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Session {0} is unregistering (bad target)")]
    SessionUnavailable(u32),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl LoopbackError {
    /// Host status the initiator sees when a command submission fails
    pub fn host_status(&self) -> HostStatus {
        match self {
            LoopbackError::SessionUnavailable(_) => HostStatus::BadTarget,
            LoopbackError::SubmissionFailed(_) | LoopbackError::ResourceExhausted(_) => {
                HostStatus::Busy
            }
            _ => HostStatus::Error,
        }
    }
}

/// Result type for loopback operations
pub type LoopbackResult<T> = Result<T, LoopbackError>;
