use std::sync::Arc;
use std::time::Instant;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::job::{Job, JobState};
use super::outcome;
use super::queue::{Claim, DatumQueue, QueuedDatum};
use super::source::DatumSource;
use crate::config::WorkerConfig;
use crate::datum::{DatumFailure, DatumState, RetryPolicy};
use crate::error::{FaultKind, Result, WorkerError};
use crate::metrics::MetricsRecorder;
use crate::store::ObjectStore;
use crate::worker::{Attempt, AttemptReport, DatumRunner};

/// Runs a job's datums over a fixed pool of worker slots.
///
/// Slots pull from a shared [`DatumQueue`] until every datum has settled
/// or the job is cancelled. Datum faults are absorbed here: a failed attempt
/// is retried with backoff while the budget lasts, then recorded as
/// `errored`. Only an unusable datum source fails the dispatch itself.
#[derive(Clone)]
pub struct Dispatcher {
    runner: DatumRunner,
    retry: RetryPolicy,
    concurrency: usize,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        metrics: Arc<dyn MetricsRecorder>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            runner: DatumRunner::new(store, config),
            retry: RetryPolicy::new(config.retry.clone()),
            concurrency: config.concurrency.max(1),
            metrics,
        }
    }

    /// Enumerate and process every datum of `job`, then settle the job state.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Dispatch`] if the datum source fails or yields
    /// duplicate datums. The job is marked failed before returning.
    pub async fn run(
        &self,
        job: Arc<RwLock<Job>>,
        source: Arc<dyn DatumSource>,
        cancel: CancellationToken,
    ) -> Result<JobState> {
        let job_id = job.read().await.id;

        let enumerated = tokio::select! {
            res = source.enumerate() => res,
            _ = cancel.cancelled() => {
                job.write().await.finish(JobState::Cancelled);
                tracing::info!(job_id = %job_id, "Job cancelled before dispatch");
                return Ok(JobState::Cancelled);
            }
        };

        let queue = Arc::new(DatumQueue::new());
        let setup = match enumerated {
            Ok(descriptors) => {
                let mut job = job.write().await;
                descriptors.into_iter().try_for_each(|descriptor| {
                    let index = job.add_datum(descriptor, self.metrics.as_ref())?;
                    queue.push(QueuedDatum::new(index));
                    Ok::<(), WorkerError>(())
                })
            }
            Err(e) => Err(match e {
                WorkerError::Dispatch(_) => e,
                other => WorkerError::Dispatch(other.to_string()),
            }),
        };
        if let Err(e) = setup {
            tracing::error!(job_id = %job_id, error = %e, "Datum enumeration failed");
            let mut job = job.write().await;
            job.error = Some(e.to_string());
            job.finish(JobState::Failure);
            return Err(e);
        }

        let total = queue.outstanding();
        let slots_needed = self.concurrency.min(total);
        tracing::info!(job_id = %job_id, datums = total, slots = slots_needed, "Dispatching job");

        let mut slots = JoinSet::new();
        for slot in 0..slots_needed {
            let dispatcher = self.clone();
            let job = job.clone();
            let queue = queue.clone();
            let cancel = cancel.clone();
            slots.spawn(async move { dispatcher.slot_loop(slot, job, queue, cancel).await });
        }

        let mut slot_panicked = false;
        while let Some(res) = slots.join_next().await {
            if let Err(e) = res {
                tracing::error!(job_id = %job_id, error = %e, "Worker slot failed");
                slot_panicked = true;
            }
        }

        let mut job = job.write().await;
        if cancel.is_cancelled() {
            // Datums waiting out a retry backoff were never restarted.
            let backing_off: Vec<usize> = job
                .datums
                .iter()
                .enumerate()
                .filter(|(_, d)| d.state == DatumState::Retrying)
                .map(|(i, _)| i)
                .collect();
            for index in backing_off {
                let requeued =
                    job.transition_datum(index, DatumState::Queued, self.metrics.as_ref());
                if let Err(e) = requeued {
                    tracing::warn!(job_id = %job_id, index, error = %e, "Failed to requeue datum");
                }
            }
        }
        let interrupted = job.datums.iter().any(|d| {
            d.failure
                .as_ref()
                .is_some_and(|f| f.kind == FaultKind::Cancelled)
        });
        let state = if cancel.is_cancelled() && (interrupted || !job.all_datums_terminal()) {
            JobState::Cancelled
        } else if job.all_datums_terminal() {
            let verdict = outcome::evaluate(&job.counts, &job.pipeline.tolerance);
            job.failure_ratio = Some(verdict.failure_ratio);
            verdict.state
        } else {
            if slot_panicked {
                job.error = Some("worker slot failed with datums in flight".to_string());
            }
            JobState::Failure
        };
        job.finish(state);

        tracing::info!(
            job_id = %job_id,
            state = %state,
            finished = job.counts.finished,
            errored = job.counts.errored,
            queued = job.counts.queued,
            "Job settled"
        );
        Ok(state)
    }

    async fn slot_loop(
        self,
        slot: usize,
        job: Arc<RwLock<Job>>,
        queue: Arc<DatumQueue>,
        cancel: CancellationToken,
    ) {
        loop {
            let changed = queue.changed();
            if cancel.is_cancelled() {
                queue.close();
                break;
            }

            match queue.claim() {
                Claim::Datum(item) => self.process(slot, &job, &queue, item, &cancel).await,
                Claim::RetryAt(at) => {
                    tokio::select! {
                        _ = changed => {}
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Claim::Wait => {
                    tokio::select! {
                        _ = changed => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                Claim::Drained => break,
            }
        }
        tracing::trace!(slot, "Worker slot exiting");
    }

    async fn process(
        &self,
        slot: usize,
        job: &RwLock<Job>,
        queue: &DatumQueue,
        item: QueuedDatum,
        cancel: &CancellationToken,
    ) {
        let metrics = self.metrics.as_ref();

        let (pipeline, job_label, fingerprint, descriptor) = {
            let mut job = job.write().await;
            // Checked under the job lock so no datum starts once the job
            // has been observed as cancelled.
            if cancel.is_cancelled() {
                queue.close();
                return;
            }
            let current = job.datum(item.index).map(|d| d.state);
            let started = match current {
                Some(DatumState::Retrying) => job
                    .transition_datum(item.index, DatumState::Queued, metrics)
                    .and_then(|_| job.transition_datum(item.index, DatumState::Running, metrics)),
                _ => job.transition_datum(item.index, DatumState::Running, metrics),
            };
            if let Err(e) = started {
                tracing::error!(slot, index = item.index, error = %e, "Cannot start datum");
                queue.settle();
                return;
            }
            let Some(record) = job.datum(item.index) else {
                queue.settle();
                return;
            };
            (
                job.pipeline.clone(),
                job.label(),
                record.fingerprint.clone(),
                record.descriptor.clone(),
            )
        };

        let attempt_number = item.attempts + 1;
        let attempt = Attempt {
            pipeline: &pipeline,
            job_id: &job_label,
            fingerprint: &fingerprint,
            descriptor: &descriptor,
            number: attempt_number,
        };
        let start = Instant::now();
        let report = self.runner.run(&attempt, cancel).await;
        let elapsed = start.elapsed();

        if let Some(d) = report.download {
            metrics.datum_download(&pipeline.name, &job_label, d.elapsed, d.bytes);
        }
        if let Some(u) = report.upload {
            metrics.datum_upload(&pipeline.name, &job_label, u.elapsed, u.bytes);
        }

        let mut job = job.write().await;
        if let Some(record) = job.datum_mut(item.index) {
            record.elapsed += elapsed;
            record.download_bytes += report.download.map_or(0, |d| d.bytes);
            record.upload_bytes += report.upload.map_or(0, |u| u.bytes);
        }

        let AttemptReport {
            exec_elapsed,
            reused,
            result,
            ..
        } = report;

        let next = match result {
            Ok(receipt) => {
                if let Some(record) = job.datum_mut(item.index) {
                    record.output = Some(receipt.manifest_key);
                    record.reused = reused;
                }
                DatumState::Finished
            }
            Err(err) => {
                let retries_used = item.attempts;
                let retry = !cancel.is_cancelled() && self.retry.should_retry(&err, retries_used);
                tracing::warn!(
                    slot,
                    job_id = %job_label,
                    datum = fingerprint.short(),
                    attempt = attempt_number,
                    fault = %err.fault_kind(),
                    error = %err,
                    retry,
                    "Datum attempt failed"
                );
                if let Some(record) = job.datum_mut(item.index) {
                    record.failure = Some(DatumFailure::from_error(&err, attempt_number));
                }
                if retry {
                    DatumState::Retrying
                } else {
                    DatumState::Errored
                }
            }
        };

        if let Some(exec) = exec_elapsed {
            metrics.datum_proc_time(&pipeline.name, &job_label, next, exec);
        }

        if let Err(e) = job.transition_datum(item.index, next, metrics) {
            tracing::error!(slot, index = item.index, error = %e, "Cannot settle datum");
            queue.settle();
            return;
        }

        if next == DatumState::Retrying {
            let delay = self.retry.backoff_with_jitter(attempt_number);
            queue.push_back(QueuedDatum {
                index: item.index,
                attempts: attempt_number,
                not_before: Some(Instant::now() + delay),
            });
        } else {
            queue.settle();
        }
    }
}
