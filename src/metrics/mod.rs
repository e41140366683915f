//! Datum processing metrics.
//!
//! Recording is fire-and-forget: every method returns `()`, and a failure
//! inside a recorder is logged and dropped so that instrumentation can never
//! fail or stall a datum.
//!
//! # Exposed series
//!
//! | Metric | Labels | Type |
//! |---|---|---|
//! | `pachyderm_worker_datum_count` | pipeline, job, state | counter |
//! | `pachyderm_worker_datum_proc_time` | pipeline, job, state | histogram |
//! | `pachyderm_worker_datum_download_time` | pipeline, job | histogram |
//! | `pachyderm_worker_datum_upload_time` | pipeline, job | histogram |
//! | `pachyderm_worker_datum_download_size` | pipeline, job | histogram |
//! | `pachyderm_worker_datum_upload_size` | pipeline, job | histogram |
//!
//! All histograms share exponential buckets starting at 1.0 and doubling 20
//! times, so the largest bucket covers 2^20 seconds (about 12 days).

mod prometheus_recorder;

pub use prometheus_recorder::PrometheusRecorder;

use std::time::Duration;

use crate::datum::DatumState;

pub const NAMESPACE: &str = "pachyderm";
pub const SUBSYSTEM: &str = "worker";
pub const BUCKET_START: f64 = 1.0;
pub const BUCKET_FACTOR: f64 = 2.0;
pub const BUCKET_COUNT: usize = 20;

/// Sink for datum lifecycle measurements.
pub trait MetricsRecorder: Send + Sync {
    /// A datum of `job` entered `state`.
    fn datum_transition(&self, pipeline: &str, job: &str, state: DatumState);

    /// Time spent running user code for an attempt that ended in `state`.
    fn datum_proc_time(&self, pipeline: &str, job: &str, state: DatumState, elapsed: Duration);

    fn datum_download(&self, pipeline: &str, job: &str, elapsed: Duration, bytes: u64);

    fn datum_upload(&self, pipeline: &str, job: &str, elapsed: Duration, bytes: u64);
}

/// Recorder that drops every measurement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn datum_transition(&self, _pipeline: &str, _job: &str, _state: DatumState) {}

    fn datum_proc_time(&self, _: &str, _: &str, _: DatumState, _: Duration) {}

    fn datum_download(&self, _: &str, _: &str, _: Duration, _: u64) {}

    fn datum_upload(&self, _: &str, _: &str, _: Duration, _: u64) {}
}
