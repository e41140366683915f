use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use super::committer::{CommitReceipt, OutputCommitter};
use super::fetcher::{DatumFetcher, TransferStats};
use super::sandbox::{ExecutionRequest, Sandbox};
use crate::config::WorkerConfig;
use crate::datum::{DatumDescriptor, Fingerprint};
use crate::error::{Result, WorkerError};
use crate::scheduler::Pipeline;
use crate::store::{keys, ObjectStore};

/// Identity of one attempt at one datum.
#[derive(Debug, Clone)]
pub struct Attempt<'a> {
    pub pipeline: &'a Pipeline,
    pub job_id: &'a str,
    pub fingerprint: &'a Fingerprint,
    pub descriptor: &'a DatumDescriptor,
    pub number: u32,
}

/// What happened during an attempt, including the stages that completed
/// before a failure.
#[derive(Debug)]
pub struct AttemptReport {
    pub download: Option<TransferStats>,
    pub exec_elapsed: Option<Duration>,
    pub upload: Option<TransferStats>,
    pub reused: bool,
    pub result: Result<CommitReceipt>,
}

impl AttemptReport {
    fn failed(err: WorkerError) -> Self {
        Self {
            download: None,
            exec_elapsed: None,
            upload: None,
            reused: false,
            result: Err(err),
        }
    }
}

/// Runs the fetch, execute and commit stages for a datum inside a
/// per-attempt scratch directory.
#[derive(Clone)]
pub struct DatumRunner {
    fetcher: DatumFetcher,
    sandbox: Sandbox,
    committer: OutputCommitter,
    scratch_root: PathBuf,
    datum_timeout: Duration,
}

impl DatumRunner {
    pub fn new(store: Arc<dyn ObjectStore>, config: &WorkerConfig) -> Self {
        Self {
            fetcher: DatumFetcher::new(store.clone(), config.transfer_timeout),
            sandbox: Sandbox::new(config.sandbox.clone()),
            committer: OutputCommitter::new(store, config.transfer_timeout),
            scratch_root: config.scratch_root.clone(),
            datum_timeout: config.datum_timeout,
        }
    }

    pub async fn run(&self, attempt: &Attempt<'_>, cancel: &CancellationToken) -> AttemptReport {
        let reuse_key = attempt.pipeline.reuse_outputs.then(|| {
            keys::reuse(
                &attempt.pipeline.name,
                attempt.pipeline.version,
                attempt.fingerprint,
            )
        });

        if cancel.is_cancelled() {
            return AttemptReport::failed(WorkerError::Cancelled);
        }

        if let Some(ref key) = reuse_key {
            match self
                .committer
                .reuse(attempt.job_id, attempt.fingerprint, key)
                .await
            {
                Ok(Some(receipt)) => {
                    tracing::debug!(
                        job_id = attempt.job_id,
                        datum = attempt.fingerprint.short(),
                        "Reusing committed output"
                    );
                    return AttemptReport {
                        download: None,
                        exec_elapsed: None,
                        upload: None,
                        reused: true,
                        result: Ok(receipt),
                    };
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    job_id = attempt.job_id,
                    datum = attempt.fingerprint.short(),
                    error = %e,
                    "Reuse lookup failed, processing datum"
                ),
            }
        }

        let scratch = self
            .scratch_root
            .join(attempt.job_id)
            .join(format!("{}-{}", attempt.fingerprint, attempt.number));
        if let Err(e) = tokio::fs::create_dir_all(&scratch).await {
            return AttemptReport::failed(WorkerError::Sandbox(format!(
                "creating scratch {}: {}",
                scratch.display(),
                e
            )));
        }

        let report = self
            .run_stages(attempt, &scratch, reuse_key.as_deref(), cancel)
            .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove scratch directory");
        }
        report
    }

    async fn run_stages(
        &self,
        attempt: &Attempt<'_>,
        scratch: &std::path::Path,
        reuse_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> AttemptReport {
        let input_dir = scratch.join("in");
        let output_dir = scratch.join("out");
        let mut report = AttemptReport::failed(WorkerError::Cancelled);

        let fetched = tokio::select! {
            res = self.fetcher.fetch(attempt.descriptor, &input_dir) => res,
            _ = cancel.cancelled() => Err(WorkerError::Cancelled),
        };
        match fetched {
            Ok(stats) => report.download = Some(stats),
            Err(e) => {
                report.result = Err(e);
                return report;
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            report.result = Err(WorkerError::Sandbox(format!(
                "creating output directory: {}",
                e
            )));
            return report;
        }

        let datum = attempt.fingerprint.to_string();
        let request = ExecutionRequest {
            transform: &attempt.pipeline.transform,
            pipeline: &attempt.pipeline.name,
            job_id: attempt.job_id,
            datum: &datum,
            input_dir: &input_dir,
            output_dir: &output_dir,
            timeout: self.datum_timeout,
        };
        let exec_start = Instant::now();
        let executed = self.sandbox.run(&request, cancel).await;
        report.exec_elapsed = Some(exec_start.elapsed());
        if let Err(e) = executed {
            report.result = Err(e);
            return report;
        }

        // Output of an aborted job is discarded, never uploaded.
        if cancel.is_cancelled() {
            report.result = Err(WorkerError::Cancelled);
            return report;
        }

        // The committer checks the token between uploads itself; racing the
        // manifest write against cancellation could drop a complete commit.
        let committed = self
            .committer
            .commit(attempt.job_id, attempt.fingerprint, &output_dir, reuse_key, cancel)
            .await;
        match committed {
            Ok(receipt) => {
                report.upload = Some(receipt.stats);
                report.result = Ok(receipt);
            }
            Err(e) => report.result = Err(e),
        }
        report
    }
}
