use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Transfer fault: {0}")]
    Transfer(String),

    #[error("Execution fault: {0}")]
    Execution(String),

    #[error("Timeout fault: transform exceeded {0:?}")]
    Timeout(std::time::Duration),

    #[error("Sandbox fault: {0}")]
    Sandbox(String),

    #[error("Dispatch fault: {0}")]
    Dispatch(String),

    #[error("Metrics fault: {0}")]
    Metrics(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Invalid datum transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

/// Kind of fault attached to an errored datum for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Transfer,
    Execution,
    Timeout,
    Sandbox,
    Cancelled,
    Internal,
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FaultKind::Transfer => write!(f, "transfer"),
            FaultKind::Execution => write!(f, "execution"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::Sandbox => write!(f, "sandbox"),
            FaultKind::Cancelled => write!(f, "cancelled"),
            FaultKind::Internal => write!(f, "internal"),
        }
    }
}

impl WorkerError {
    /// Classify a per-datum error. Everything that is not one of the datum
    /// stage faults is reported as internal.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            WorkerError::Transfer(_) => FaultKind::Transfer,
            WorkerError::Execution(_) => FaultKind::Execution,
            WorkerError::Timeout(_) => FaultKind::Timeout,
            WorkerError::Sandbox(_) => FaultKind::Sandbox,
            WorkerError::Cancelled => FaultKind::Cancelled,
            _ => FaultKind::Internal,
        }
    }

    /// Whether the retry policy may re-queue the datum after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, WorkerError::Cancelled)
    }
}
