//! Job control surface: start, cancel and query jobs on this worker.
//!
//! Every job runs on its own task under a child of the controller's root
//! cancellation token, so cancelling the root (process shutdown) cancels
//! every job while [`JobController::cancel`] affects only one.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::datum::DatumDescriptor;
use crate::error::{Result, WorkerError};
use crate::metrics::MetricsRecorder;
use crate::scheduler::{
    DatumSource, Dispatcher, Job, JobState, JobStatus, Pipeline, StaticSource,
};
use crate::store::ObjectStore;

/// A job as submitted over the control interface.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    pub pipeline: Pipeline,
    pub input_version: String,
    /// Datums enumerated up front
    #[serde(default)]
    pub datums: Vec<DatumDescriptor>,
}

struct JobHandle {
    job: Arc<RwLock<Job>>,
    cancel: CancellationToken,
    done: watch::Receiver<JobState>,
}

#[derive(Clone)]
pub struct JobController {
    dispatcher: Dispatcher,
    jobs: Arc<RwLock<HashMap<Uuid, JobHandle>>>,
    root: CancellationToken,
}

impl JobController {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn MetricsRecorder>,
        config: &WorkerConfig,
        root: CancellationToken,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(store, metrics, config),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            root,
        }
    }

    /// Start a job from a submitted manifest.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        let source = Arc::new(StaticSource::new(request.datums));
        self.start(request.pipeline, request.input_version, source)
            .await
    }

    /// Start a job of `pipeline` over `input_version` and return its id.
    /// Dispatch runs in the background; use [`query`](Self::query) or
    /// [`wait`](Self::wait) to follow it.
    pub async fn start(
        &self,
        pipeline: Pipeline,
        input_version: impl Into<String>,
        source: Arc<dyn DatumSource>,
    ) -> Result<Uuid> {
        self.start_job(Job::new(pipeline, input_version), source)
            .await
    }

    /// Start a job with a caller-chosen id.
    ///
    /// # Errors
    ///
    /// [`WorkerError::JobExists`] if a job with this id is already tracked,
    /// [`WorkerError::Config`] if the pipeline has no name, its failure
    /// tolerance is not a ratio, or the worker is shutting down.
    pub async fn start_job(&self, job: Job, source: Arc<dyn DatumSource>) -> Result<Uuid> {
        if job.pipeline.name.trim().is_empty() {
            return Err(WorkerError::Config("pipeline name is empty".to_string()));
        }
        job.pipeline.tolerance.validate()?;
        if self.root.is_cancelled() {
            return Err(WorkerError::Config("worker is shutting down".to_string()));
        }

        let id = job.id;
        let pipeline = job.pipeline.name.clone();
        let job = Arc::new(RwLock::new(job));
        let cancel = self.root.child_token();
        let (done_tx, done_rx) = watch::channel(JobState::Running);

        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&id) {
                return Err(WorkerError::JobExists(id.to_string()));
            }
            jobs.insert(
                id,
                JobHandle {
                    job: job.clone(),
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        tracing::info!(job_id = %id, pipeline = %pipeline, "Job started");

        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let state = match dispatcher.run(job.clone(), source, cancel).await {
                Ok(state) => state,
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Job dispatch failed");
                    job.read().await.state
                }
            };
            tracing::info!(job_id = %id, state = %state, "Job finished");
            let _ = done_tx.send(state);
        });

        Ok(id)
    }

    /// Cancel a running job. Cancelling a finished job is a no-op.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let jobs = self.jobs.read().await;
        let handle = jobs.get(&id).ok_or(WorkerError::JobNotFound(id.to_string()))?;
        if !handle.cancel.is_cancelled() {
            tracing::info!(job_id = %id, "Cancelling job");
            handle.cancel.cancel();
        }
        Ok(())
    }

    /// Aggregate state and per-state datum counts of a job.
    pub async fn query(&self, id: Uuid) -> Result<JobStatus> {
        let job = {
            let jobs = self.jobs.read().await;
            jobs.get(&id).ok_or(WorkerError::JobNotFound(id.to_string()))?.job.clone()
        };
        let status = job.read().await.status();
        Ok(status)
    }

    /// Status of every tracked job, oldest first.
    pub async fn list(&self) -> Vec<JobStatus> {
        let handles: Vec<_> = {
            let jobs = self.jobs.read().await;
            jobs.values().map(|h| h.job.clone()).collect()
        };
        let mut statuses = Vec::with_capacity(handles.len());
        for job in handles {
            statuses.push(job.read().await.status());
        }
        statuses.sort_by_key(|s| s.created_at);
        statuses
    }

    /// Wait until the job leaves `running` and return its final state.
    pub async fn wait(&self, id: Uuid) -> Result<JobState> {
        let mut done = {
            let jobs = self.jobs.read().await;
            jobs.get(&id).ok_or(WorkerError::JobNotFound(id.to_string()))?.done.clone()
        };
        let state = *done
            .wait_for(|state| state.is_terminal())
            .await
            .map_err(|_| WorkerError::Internal(format!("job {} task vanished", id)))?;
        Ok(state)
    }

    /// Forget finished jobs and return how many were dropped.
    pub async fn prune_finished(&self) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, h| !h.done.borrow().is_terminal());
        before - jobs.len()
    }

    /// Cancel every job and wait for all of them to settle.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let ids: Vec<Uuid> = self.jobs.read().await.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.wait(id).await {
                tracing::warn!(job_id = %id, error = %e, "Job did not settle during shutdown");
            }
        }
    }
}
