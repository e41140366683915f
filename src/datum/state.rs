use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::descriptor::{DatumDescriptor, Fingerprint};
use crate::error::{FaultKind, Result, WorkerError};

/// Lifecycle state of a datum.
///
/// ```text
/// queued -> running -> finished
///              |-----> errored
///              '-----> retrying -> queued
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatumState {
    Queued,
    Running,
    Finished,
    Errored,
    Retrying,
}

impl DatumState {
    pub const ALL: [DatumState; 5] = [
        DatumState::Queued,
        DatumState::Running,
        DatumState::Finished,
        DatumState::Errored,
        DatumState::Retrying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatumState::Queued => "queued",
            DatumState::Running => "running",
            DatumState::Finished => "finished",
            DatumState::Errored => "errored",
            DatumState::Retrying => "retrying",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DatumState::Finished | DatumState::Errored)
    }

    pub fn can_transition_to(&self, next: DatumState) -> bool {
        matches!(
            (self, next),
            (DatumState::Queued, DatumState::Running)
                | (DatumState::Running, DatumState::Finished)
                | (DatumState::Running, DatumState::Errored)
                | (DatumState::Running, DatumState::Retrying)
                | (DatumState::Retrying, DatumState::Queued)
        )
    }
}

impl std::fmt::Display for DatumState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumFailure {
    pub kind: FaultKind,
    pub message: String,
    pub attempt: u32,
}

impl DatumFailure {
    pub fn from_error(err: &WorkerError, attempt: u32) -> Self {
        Self {
            kind: err.fault_kind(),
            message: err.to_string(),
            attempt,
        }
    }
}

/// Per-datum bookkeeping kept on the job record.
#[derive(Debug, Clone, Serialize)]
pub struct DatumRecord {
    pub fingerprint: Fingerprint,
    pub descriptor: DatumDescriptor,
    pub state: DatumState,
    /// Every state the datum has been in, oldest first
    pub history: Vec<DatumState>,
    /// Number of times the datum entered `running`
    pub attempts: u32,
    /// Wall time spent in `running` across all attempts
    pub elapsed: Duration,
    pub download_bytes: u64,
    pub upload_bytes: u64,
    /// Most recent failure, kept for diagnostics even if a later attempt succeeds
    pub failure: Option<DatumFailure>,
    /// Store key of the committed output manifest
    pub output: Option<String>,
    /// Output was reused from an earlier job of the same pipeline version
    pub reused: bool,
}

impl DatumRecord {
    pub fn new(descriptor: DatumDescriptor) -> Self {
        Self {
            fingerprint: descriptor.fingerprint(),
            descriptor,
            state: DatumState::Queued,
            history: vec![DatumState::Queued],
            attempts: 0,
            elapsed: Duration::ZERO,
            download_bytes: 0,
            upload_bytes: 0,
            failure: None,
            output: None,
            reused: false,
        }
    }

    /// Move to `next`, rejecting any edge outside the lifecycle graph.
    pub fn transition(&mut self, next: DatumState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(WorkerError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == DatumState::Running {
            self.attempts += 1;
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    /// Retries consumed so far; the first attempt is not a retry.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}
