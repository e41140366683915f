use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default port the Prometheus scrape endpoint is served on.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Configuration for running a pipeline transform.
///
/// With no `image` the transform runs as a local child process in its own
/// process group. With an `image` it runs in a Docker container with:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - Memory and CPU limits
/// - The datum scratch directory bind-mounted at `/pfs`
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Shell used to interpret the transform command
    pub shell: String,
    /// Docker image to run the transform in, if any
    pub image: Option<String>,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// Bytes of stdout/stderr kept for diagnostics
    pub max_captured_output: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            image: None,
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
            max_captured_output: 64 * 1024,
        }
    }
}

impl SandboxConfig {
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }
}

/// Retry and backoff policy for failed datums.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Retry policy with no delay between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent worker slots per job
    pub concurrency: usize,
    /// Deadline for a single transform run
    pub datum_timeout: Duration,
    /// Deadline for a single store get/put
    pub transfer_timeout: Duration,
    pub retry: RetryConfig,
    /// Root directory for per-datum scratch space
    pub scratch_root: PathBuf,
    /// Address of the `/metrics` and job control HTTP listener
    pub metrics_addr: SocketAddr,
    pub sandbox: SandboxConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            datum_timeout: Duration::from_secs(3600),
            transfer_timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
            scratch_root: std::env::temp_dir().join("datum-worker"),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT)),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_datum_timeout(mut self, timeout: Duration) -> Self {
        self.datum_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Reject settings the dispatcher cannot run with.
    pub fn validate(&self) -> crate::error::Result<()> {
        use crate::error::WorkerError;

        if self.concurrency == 0 {
            return Err(WorkerError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.datum_timeout.is_zero() {
            return Err(WorkerError::Config(
                "datum timeout must be non-zero".to_string(),
            ));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(WorkerError::Config(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.shell, "sh");
        assert!(cfg.image.is_none());
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn sandbox_config_with_image() {
        let cfg = SandboxConfig::default().with_image("alpine:latest");
        assert_eq!(cfg.image.as_deref(), Some("alpine:latest"));
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.metrics_addr.port(), 9090);
        assert_eq!(cfg.retry.max_retries, 3);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn worker_config_builders() {
        let cfg = WorkerConfig::new("/tmp/scratch")
            .with_concurrency(2)
            .with_datum_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::immediate(1));
        assert_eq!(cfg.scratch_root, PathBuf::from("/tmp/scratch"));
        assert_eq!(cfg.concurrency, 2);
        assert_eq!(cfg.datum_timeout, Duration::from_secs(5));
        assert_eq!(cfg.retry.max_retries, 1);
        assert!(cfg.retry.initial_backoff.is_zero());
    }

    #[test]
    fn worker_config_rejects_zero_concurrency() {
        let cfg = WorkerConfig::default().with_concurrency(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn worker_config_rejects_shrinking_backoff() {
        let mut cfg = WorkerConfig::default();
        cfg.retry.multiplier = 0.5;
        assert!(cfg.validate().is_err());
    }
}
