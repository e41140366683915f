
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use datum_worker::config::{RetryConfig, WorkerConfig};
use datum_worker::datum::{DatumDescriptor, DatumState};
use datum_worker::error::{FaultKind, Result, WorkerError};
use datum_worker::metrics::PrometheusRecorder;
use datum_worker::scheduler::{
    DatumSource, Dispatcher, FailureTolerance, Job, JobState, StaticSource, TransformSpec,
};
use datum_worker::store::MemoryStore;
use test_harness::{assert_eventually, pipeline, FlakyStore, TestWorker, COPY};

#[tokio::test]
async fn test_all_datums_succeed() {
    let worker = TestWorker::new();
    let datums = worker.seed_many(5).await;

    let status = worker.run(pipeline("copy", COPY), datums).await;

    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.total_datums, 5);
    assert_eq!(status.counts.finished, 5);
    assert_eq!(status.counts.errored, 0);
    assert_eq!(status.failure_ratio, Some(0.0));

    let job = status.id.to_string();
    assert_eq!(worker.metrics.datum_count("copy", &job, DatumState::Finished), 5);
    assert_eq!(worker.metrics.datum_count("copy", &job, DatumState::Errored), 0);
    assert_eq!(worker.committed(status.id).await.len(), 5);
}

#[tokio::test]
async fn test_timed_out_datum_is_retried_then_errored() {
    let worker = TestWorker::with_config(|c| {
        c.with_datum_timeout(Duration::from_millis(300))
            .with_retry(RetryConfig::immediate(1))
    });
    let mut datums = worker.seed_many(3).await;
    datums.push(worker.seed("slow", "zzz").await);
    let cmd = format!("if [ -f slow ]; then sleep 30; fi; {}", COPY);

    let status = worker.run(pipeline("slow", &cmd), datums).await;

    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.counts.errored, 1);
    assert_eq!(status.counts.finished, 3);
    assert_eq!(status.failed_datums.len(), 1);

    let failed = &status.failed_datums[0];
    assert_eq!(failed.attempts, 2);
    assert_eq!(failed.descriptor.inputs[0].name, "slow");
    let failure = failed.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FaultKind::Timeout);
    assert_eq!(failure.attempt, 2);

    let job = status.id.to_string();
    assert_eq!(worker.metrics.datum_count("slow", &job, DatumState::Retrying), 1);
    assert_eq!(worker.metrics.datum_count("slow", &job, DatumState::Errored), 1);
    assert_eq!(worker.committed(status.id).await.len(), 3);
}

#[tokio::test]
async fn test_cancel_stops_dispatch() {
    let worker = TestWorker::new();
    let datums = worker.seed_many(6).await;
    let id = worker.start(pipeline("stuck", "sleep 30"), datums).await;

    let controller = worker.controller.clone();
    assert_eventually(
        || {
            let controller = controller.clone();
            async move { controller.query(id).await.unwrap().counts.running == 2 }
        },
        Duration::from_secs(10),
        "two datums should be running",
    )
    .await;

    worker.controller.cancel(id).await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(10), worker.controller.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, JobState::Cancelled);

    let status = worker.controller.query(id).await.unwrap();
    assert_eq!(status.counts.queued, 4);
    assert_eq!(status.counts.running, 0);
    assert_eq!(status.counts.errored, 2);
    for failed in &status.failed_datums {
        assert_eq!(failed.attempts, 1);
        assert_eq!(failed.failure.as_ref().unwrap().kind, FaultKind::Cancelled);
    }

    let job = id.to_string();
    assert_eq!(worker.metrics.datum_count("stuck", &job, DatumState::Running), 2);
    assert!(worker.committed(id).await.is_empty());
}

#[tokio::test]
async fn test_cancel_during_retry_backoff_requeues_datum() {
    let worker = TestWorker::with_config(|c| {
        c.with_retry(RetryConfig {
            max_retries: 3,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        })
    });
    let datums = worker.seed_many(1).await;
    let id = worker.start(pipeline("flaky", "exit 1"), datums).await;

    let controller = worker.controller.clone();
    assert_eventually(
        || {
            let controller = controller.clone();
            async move { controller.query(id).await.unwrap().counts.retrying == 1 }
        },
        Duration::from_secs(10),
        "datum should be waiting out its backoff",
    )
    .await;

    worker.controller.cancel(id).await.unwrap();
    let state = tokio::time::timeout(Duration::from_secs(10), worker.controller.wait(id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state, JobState::Cancelled);

    let status = worker.controller.query(id).await.unwrap();
    assert_eq!(status.counts.retrying, 0);
    assert_eq!(status.counts.queued, 1);
    assert_eq!(status.counts.running, 0);
    assert_eq!(status.counts.errored, 0);

    let job = id.to_string();
    assert_eq!(worker.metrics.datum_count("flaky", &job, DatumState::Queued), 2);
}

#[tokio::test]
async fn test_metrics_match_internal_counts() {
    let worker = TestWorker::new();
    let mut datums = worker.seed_many(8).await;
    datums.push(worker.seed("bad-1", "x").await);
    datums.push(worker.seed("bad-2", "y").await);
    let cmd = format!("if ls bad-* >/dev/null 2>&1; then exit 1; fi; {}", COPY);
    let p = pipeline("mixed", &cmd).with_tolerance(FailureTolerance::fraction(0.25));

    let status = worker.run(p, datums).await;

    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.counts.finished, 8);
    assert_eq!(status.counts.errored, 2);
    assert_eq!(status.failure_ratio, Some(0.2));

    let job = status.id.to_string();
    let m = &worker.metrics;
    assert_eq!(m.datum_count("mixed", &job, DatumState::Queued), 10);
    assert_eq!(m.datum_count("mixed", &job, DatumState::Running), 10);
    assert_eq!(m.datum_count("mixed", &job, DatumState::Finished), 8);
    assert_eq!(m.datum_count("mixed", &job, DatumState::Errored), 2);
    assert_eq!(m.proc_time_samples("mixed", &job, DatumState::Finished), 8);
    assert_eq!(m.proc_time_samples("mixed", &job, DatumState::Errored), 2);
    assert!(m.download_bytes("mixed", &job) > 0.0);
    assert!(m.upload_bytes("mixed", &job) > 0.0);
}

#[tokio::test]
async fn test_zero_tolerance_fails_on_single_error() {
    let worker = TestWorker::new();
    let mut datums = worker.seed_many(4).await;
    datums.push(worker.seed("bad", "x").await);
    let cmd = format!("if [ -f bad ]; then exit 1; fi; {}", COPY);

    let status = worker.run(pipeline("strict", &cmd), datums).await;

    assert_eq!(status.state, JobState::Failure);
    assert_eq!(status.counts.finished + status.counts.errored, 5);
    let failure = status.failed_datums[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, FaultKind::Execution);
}

#[tokio::test]
async fn test_transfer_fault_is_retried() {
    let store = MemoryStore::new();
    let backend = Arc::new(FlakyStore::new(store.clone(), 1));
    let worker = TestWorker::with_store(backend, store, |c| {
        c.with_concurrency(1).with_retry(RetryConfig::immediate(2))
    });
    let datums = worker.seed_many(1).await;

    let status = worker.run(pipeline("flaky", COPY), datums).await;

    assert_eq!(status.state, JobState::Success);
    let job = status.id.to_string();
    assert_eq!(worker.metrics.datum_count("flaky", &job, DatumState::Retrying), 1);
    assert_eq!(worker.metrics.datum_count("flaky", &job, DatumState::Finished), 1);
}

#[tokio::test]
async fn test_missing_reference_errors_datum() {
    let worker = TestWorker::new();
    let datums = vec![DatumDescriptor::single("gone.txt", "0".repeat(64))];

    let status = worker.run(pipeline("missing", COPY), datums).await;

    assert_eq!(status.state, JobState::Failure);
    let failure = status.failed_datums[0].failure.as_ref().unwrap();
    assert_eq!(failure.kind, FaultKind::Transfer);
}

#[tokio::test]
async fn test_empty_job_succeeds() {
    let worker = TestWorker::new();
    let status = worker.run(pipeline("empty", COPY), Vec::new()).await;
    assert_eq!(status.state, JobState::Success);
    assert_eq!(status.total_datums, 0);
}

struct BrokenSource;

#[async_trait]
impl DatumSource for BrokenSource {
    async fn enumerate(&self) -> Result<Vec<DatumDescriptor>> {
        Err(WorkerError::Transfer("listing unavailable".to_string()))
    }
}

#[tokio::test]
async fn test_unavailable_source_fails_job() {
    let worker = TestWorker::new();
    let id = worker
        .controller
        .start(pipeline("broken", COPY), "v1", Arc::new(BrokenSource))
        .await
        .unwrap();

    assert_eq!(worker.controller.wait(id).await.unwrap(), JobState::Failure);
    let status = worker.controller.query(id).await.unwrap();
    assert!(status.error.unwrap().contains("listing unavailable"));
    assert_eq!(status.total_datums, 0);
}

#[tokio::test]
async fn test_duplicate_datums_fail_dispatch() {
    let worker = TestWorker::new();
    let datum = worker.seed("a.txt", "a").await;

    let status = worker
        .run(pipeline("dupes", COPY), vec![datum.clone(), datum])
        .await;

    assert_eq!(status.state, JobState::Failure);
    assert!(status.error.unwrap().contains("duplicate"));
}

/// Runs a job through the dispatcher directly so datum records can be
/// inspected.
async fn dispatch(
    store: &MemoryStore,
    metrics: &PrometheusRecorder,
    config: &WorkerConfig,
    job: Job,
    datums: Vec<DatumDescriptor>,
) -> Arc<RwLock<Job>> {
    let dispatcher = Dispatcher::new(Arc::new(store.clone()), Arc::new(metrics.clone()), config);
    let job = Arc::new(RwLock::new(job));
    dispatcher
        .run(
            job.clone(),
            Arc::new(StaticSource::new(datums)),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    job
}

#[tokio::test]
async fn test_retry_history_is_monotonic() {
    let worker = TestWorker::new();
    let marks = tempfile::TempDir::new().unwrap();
    let scratch = tempfile::TempDir::new().unwrap();
    let config = test_harness::test_config(&scratch).with_retry(RetryConfig::immediate(2));

    let mut transform = TransformSpec::new(format!(
        "if [ ! -f \"$MARKS/$DATUM_ID\" ]; then touch \"$MARKS/$DATUM_ID\"; exit 1; fi; {}",
        COPY
    ));
    transform
        .env
        .insert("MARKS".to_string(), marks.path().display().to_string());
    let p = datum_worker::scheduler::Pipeline::new("flaky-once", transform);
    let datums = worker.seed_many(3).await;

    let job = dispatch(&worker.store, &worker.metrics, &config, Job::new(p, "v1"), datums).await;
    let job = job.read().await;

    assert_eq!(job.state, JobState::Success);
    for record in &job.datums {
        assert_eq!(
            record.history,
            vec![
                DatumState::Queued,
                DatumState::Running,
                DatumState::Retrying,
                DatumState::Queued,
                DatumState::Running,
                DatumState::Finished,
            ]
        );
        assert!(record
            .history
            .windows(2)
            .all(|w| w[0].can_transition_to(w[1])));
        assert_eq!(record.attempts, 2);
        assert_eq!(record.retries(), 1);
        assert_eq!(
            record.failure.as_ref().map(|f| f.kind),
            Some(FaultKind::Execution)
        );
    }
}

#[tokio::test]
async fn test_unchanged_datums_reuse_output() {
    let worker = TestWorker::new();
    let scratch = tempfile::TempDir::new().unwrap();
    let config = test_harness::test_config(&scratch);
    let p = pipeline("reuse", COPY);
    let datums = worker.seed_many(3).await;

    let first = dispatch(
        &worker.store,
        &worker.metrics,
        &config,
        Job::new(p.clone(), "v1"),
        datums.clone(),
    )
    .await;
    assert!(first.read().await.datums.iter().all(|d| !d.reused));

    let second = dispatch(
        &worker.store,
        &worker.metrics,
        &config,
        Job::new(p.clone(), "v2"),
        datums.clone(),
    )
    .await;
    let second = second.read().await;
    assert_eq!(second.state, JobState::Success);
    assert!(second.datums.iter().all(|d| d.reused && d.output.is_some()));
    assert_eq!(worker.committed(second.id).await.len(), 3);
    assert_eq!(
        worker
            .metrics
            .proc_time_samples("reuse", &second.label(), DatumState::Finished),
        0
    );

    let third = dispatch(
        &worker.store,
        &worker.metrics,
        &config,
        Job::new(p.reregister(TransformSpec::new(COPY)), "v2"),
        datums,
    )
    .await;
    assert!(third.read().await.datums.iter().all(|d| !d.reused));
}

#[tokio::test]
async fn test_root_cancellation_cancels_every_job() {
    let worker = TestWorker::new();
    let a = worker
        .start(pipeline("a", "sleep 30"), worker.seed_many(2).await)
        .await;
    let b = worker
        .start(pipeline("b", "sleep 30"), worker.seed_many(2).await)
        .await;

    tokio::time::timeout(Duration::from_secs(10), worker.controller.shutdown())
        .await
        .unwrap();

    assert_eq!(worker.controller.wait(a).await.unwrap(), JobState::Cancelled);
    assert_eq!(worker.controller.wait(b).await.unwrap(), JobState::Cancelled);
}
