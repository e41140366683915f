use std::time::Duration;

use prometheus::{
    exponential_buckets, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};

use super::{MetricsRecorder, BUCKET_COUNT, BUCKET_FACTOR, BUCKET_START, NAMESPACE, SUBSYSTEM};
use crate::datum::DatumState;
use crate::error::{Result, WorkerError};

/// Recorder backed by a private Prometheus registry.
///
/// The registry is owned by the recorder instead of the process-global default
/// so that tests and multiple workers in one process never share counters.
#[derive(Clone)]
pub struct PrometheusRecorder {
    registry: Registry,
    datum_count: CounterVec,
    proc_time: HistogramVec,
    download_time: HistogramVec,
    upload_time: HistogramVec,
    download_size: HistogramVec,
    upload_size: HistogramVec,
}

fn metrics_err(e: prometheus::Error) -> WorkerError {
    WorkerError::Metrics(e.to_string())
}

fn histogram(name: &str, help: &str, labels: &[&str]) -> Result<HistogramVec> {
    let buckets =
        exponential_buckets(BUCKET_START, BUCKET_FACTOR, BUCKET_COUNT).map_err(metrics_err)?;
    let opts = HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .buckets(buckets);
    HistogramVec::new(opts, labels).map_err(metrics_err)
}

impl PrometheusRecorder {
    pub fn new() -> Result<Self> {
        let datum_count = CounterVec::new(
            Opts::new(
                "datum_count",
                "Number of datums processed by pipeline ID and state (queued|running|finished|errored|retrying)",
            )
            .namespace(NAMESPACE)
            .subsystem(SUBSYSTEM),
            &["pipeline", "job", "state"],
        )
        .map_err(metrics_err)?;

        // Both finished and errored attempts have processing times.
        let proc_time = histogram(
            "datum_proc_time",
            "Time running user code",
            &["pipeline", "job", "state"],
        )?;
        let download_time = histogram(
            "datum_download_time",
            "Time to download input data",
            &["pipeline", "job"],
        )?;
        let upload_time = histogram(
            "datum_upload_time",
            "Time to upload output data",
            &["pipeline", "job"],
        )?;
        let download_size = histogram(
            "datum_download_size",
            "Size of downloaded input data",
            &["pipeline", "job"],
        )?;
        let upload_size = histogram(
            "datum_upload_size",
            "Size of uploaded output data",
            &["pipeline", "job"],
        )?;

        let registry = Registry::new();
        registry
            .register(Box::new(datum_count.clone()))
            .map_err(metrics_err)?;
        for h in [
            &proc_time,
            &download_time,
            &upload_time,
            &download_size,
            &upload_size,
        ] {
            registry.register(Box::new(h.clone())).map_err(metrics_err)?;
        }

        Ok(Self {
            registry,
            datum_count,
            proc_time,
            download_time,
            upload_time,
            download_size,
            upload_size,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every series in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(metrics_err)?;
        String::from_utf8(buf).map_err(|e| WorkerError::Metrics(e.to_string()))
    }

    /// Content type to serve [`encode`](Self::encode) output with.
    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Current value of the datum counter for one label set.
    pub fn datum_count(&self, pipeline: &str, job: &str, state: DatumState) -> u64 {
        self.datum_count
            .get_metric_with_label_values(&[pipeline, job, state.as_str()])
            .map(|c| c.get() as u64)
            .unwrap_or(0)
    }

    /// Number of observations in the processing time histogram for one label set.
    pub fn proc_time_samples(&self, pipeline: &str, job: &str, state: DatumState) -> u64 {
        self.proc_time
            .get_metric_with_label_values(&[pipeline, job, state.as_str()])
            .map(|h| h.get_sample_count())
            .unwrap_or(0)
    }

    /// Sum of observed download bytes for one job.
    pub fn download_bytes(&self, pipeline: &str, job: &str) -> f64 {
        self.download_size
            .get_metric_with_label_values(&[pipeline, job])
            .map(|h| h.get_sample_sum())
            .unwrap_or(0.0)
    }

    /// Sum of observed upload bytes for one job.
    pub fn upload_bytes(&self, pipeline: &str, job: &str) -> f64 {
        self.upload_size
            .get_metric_with_label_values(&[pipeline, job])
            .map(|h| h.get_sample_sum())
            .unwrap_or(0.0)
    }
}

fn observe(vec: &HistogramVec, labels: &[&str], value: f64) {
    match vec.get_metric_with_label_values(labels) {
        Ok(h) => h.observe(value),
        Err(e) => tracing::warn!(error = %e, ?labels, "Dropping histogram observation"),
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn datum_transition(&self, pipeline: &str, job: &str, state: DatumState) {
        match self
            .datum_count
            .get_metric_with_label_values(&[pipeline, job, state.as_str()])
        {
            Ok(c) => c.inc(),
            Err(e) => tracing::warn!(error = %e, pipeline, job, %state, "Dropping datum count"),
        }
    }

    fn datum_proc_time(&self, pipeline: &str, job: &str, state: DatumState, elapsed: Duration) {
        observe(
            &self.proc_time,
            &[pipeline, job, state.as_str()],
            elapsed.as_secs_f64(),
        );
    }

    fn datum_download(&self, pipeline: &str, job: &str, elapsed: Duration, bytes: u64) {
        observe(&self.download_time, &[pipeline, job], elapsed.as_secs_f64());
        observe(&self.download_size, &[pipeline, job], bytes as f64);
    }

    fn datum_upload(&self, pipeline: &str, job: &str, elapsed: Duration, bytes: u64) {
        observe(&self.upload_time, &[pipeline, job], elapsed.as_secs_f64());
        observe(&self.upload_size, &[pipeline, job], bytes as f64);
    }
}
