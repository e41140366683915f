use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::Pipeline;
use crate::datum::{DatumDescriptor, DatumFailure, DatumRecord, DatumState, Fingerprint};
use crate::error::{Result, WorkerError};
use crate::metrics::MetricsRecorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Success,
    Failure,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Success => write!(f, "success"),
            JobState::Failure => write!(f, "failure"),
            JobState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Number of datums currently in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatumCounts {
    pub queued: u64,
    pub running: u64,
    pub finished: u64,
    pub errored: u64,
    pub retrying: u64,
}

impl DatumCounts {
    pub fn get(&self, state: DatumState) -> u64 {
        match state {
            DatumState::Queued => self.queued,
            DatumState::Running => self.running,
            DatumState::Finished => self.finished,
            DatumState::Errored => self.errored,
            DatumState::Retrying => self.retrying,
        }
    }

    fn slot(&mut self, state: DatumState) -> &mut u64 {
        match state {
            DatumState::Queued => &mut self.queued,
            DatumState::Running => &mut self.running,
            DatumState::Finished => &mut self.finished,
            DatumState::Errored => &mut self.errored,
            DatumState::Retrying => &mut self.retrying,
        }
    }

    fn moved(&mut self, from: DatumState, to: DatumState) {
        let from = self.slot(from);
        *from = from.saturating_sub(1);
        *self.slot(to) += 1;
    }

    pub fn total(&self) -> u64 {
        self.queued + self.running + self.finished + self.errored + self.retrying
    }

    pub fn terminal(&self) -> u64 {
        self.finished + self.errored
    }
}

/// An errored datum as reported to operators.
#[derive(Debug, Clone, Serialize)]
pub struct FailedDatum {
    pub fingerprint: Fingerprint,
    pub descriptor: DatumDescriptor,
    pub attempts: u32,
    pub failure: Option<DatumFailure>,
}

/// Point-in-time view of a job returned by the control interface.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub id: Uuid,
    pub pipeline: String,
    pub pipeline_version: u64,
    pub input_version: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_datums: u64,
    pub counts: DatumCounts,
    pub failure_ratio: Option<f64>,
    pub error: Option<String>,
    pub failed_datums: Vec<FailedDatum>,
}

/// One run of a pipeline over one input version.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub pipeline: Pipeline,
    pub input_version: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub datums: Vec<DatumRecord>,
    pub counts: DatumCounts,
    pub failure_ratio: Option<f64>,
    /// Job-level failure such as an unavailable datum source
    pub error: Option<String>,
    fingerprints: HashSet<Fingerprint>,
}

impl Job {
    pub fn new(pipeline: Pipeline, input_version: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), pipeline, input_version)
    }

    pub fn with_id(id: Uuid, pipeline: Pipeline, input_version: impl Into<String>) -> Self {
        Self {
            id,
            pipeline,
            input_version: input_version.into(),
            state: JobState::Running,
            created_at: Utc::now(),
            finished_at: None,
            datums: Vec::new(),
            counts: DatumCounts::default(),
            failure_ratio: None,
            error: None,
            fingerprints: HashSet::new(),
        }
    }

    /// Label value used for this job in metrics.
    pub fn label(&self) -> String {
        self.id.to_string()
    }

    /// Register an enumerated datum as `queued` and return its index.
    /// Fingerprints are unique within a job.
    pub fn add_datum(
        &mut self,
        descriptor: DatumDescriptor,
        metrics: &dyn MetricsRecorder,
    ) -> Result<usize> {
        let record = DatumRecord::new(descriptor);
        if !self.fingerprints.insert(record.fingerprint.clone()) {
            return Err(WorkerError::Dispatch(format!(
                "duplicate datum fingerprint {}",
                record.fingerprint
            )));
        }
        self.datums.push(record);
        self.counts.queued += 1;
        metrics.datum_transition(&self.pipeline.name, &self.label(), DatumState::Queued);
        Ok(self.datums.len() - 1)
    }

    /// Advance one datum, keeping the per-state counts and the metrics in step.
    pub fn transition_datum(
        &mut self,
        index: usize,
        next: DatumState,
        metrics: &dyn MetricsRecorder,
    ) -> Result<()> {
        let job_label = self.label();
        let record = self
            .datums
            .get_mut(index)
            .ok_or_else(|| WorkerError::Internal(format!("no datum at index {}", index)))?;
        let from = record.state;
        record.transition(next)?;
        self.counts.moved(from, next);
        metrics.datum_transition(&self.pipeline.name, &job_label, next);
        tracing::debug!(
            job_id = %self.id,
            datum = record.fingerprint.short(),
            from = %from,
            to = %next,
            "Datum transition"
        );
        Ok(())
    }

    pub fn datum(&self, index: usize) -> Option<&DatumRecord> {
        self.datums.get(index)
    }

    pub fn datum_mut(&mut self, index: usize) -> Option<&mut DatumRecord> {
        self.datums.get_mut(index)
    }

    /// Every datum has reached `finished` or `errored`.
    pub fn all_datums_terminal(&self) -> bool {
        self.counts.terminal() == self.datums.len() as u64
    }

    pub fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            pipeline: self.pipeline.name.clone(),
            pipeline_version: self.pipeline.version,
            input_version: self.input_version.clone(),
            state: self.state,
            created_at: self.created_at,
            finished_at: self.finished_at,
            total_datums: self.datums.len() as u64,
            counts: self.counts,
            failure_ratio: self.failure_ratio,
            error: self.error.clone(),
            failed_datums: self
                .datums
                .iter()
                .filter(|d| d.state == DatumState::Errored)
                .map(|d| FailedDatum {
                    fingerprint: d.fingerprint.clone(),
                    descriptor: d.descriptor.clone(),
                    attempts: d.attempts,
                    failure: d.failure.clone(),
                })
                .collect(),
        }
    }
}
