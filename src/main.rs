use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use datum_worker::api::{self, ApiState};
use datum_worker::config::{RetryConfig, SandboxConfig, WorkerConfig, DEFAULT_METRICS_PORT};
use datum_worker::controller::{JobController, JobRequest};
use datum_worker::metrics::PrometheusRecorder;
use datum_worker::scheduler::{JobState, JobStatus};
use datum_worker::shutdown::install_shutdown_handler;
use datum_worker::store::{LocalStore, MemoryStore, ObjectStore};

#[derive(Parser, Debug)]
#[command(name = "datum-worker")]
#[command(version)]
#[command(about = "Processes pipeline datums and reports job outcomes")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve /metrics and the job control API until SIGTERM/SIGINT
    Serve {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Port for /metrics and the job control API
        #[arg(long, default_value_t = DEFAULT_METRICS_PORT)]
        port: u16,
    },

    /// Run a single job manifest to completion and print its status
    Run {
        #[command(flatten)]
        worker: WorkerArgs,

        /// Path to the job manifest (JSON)
        manifest: PathBuf,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Root of the filesystem object store (in-memory if omitted)
    #[arg(long)]
    store: Option<PathBuf>,

    /// Directory for per-datum scratch space
    #[arg(long)]
    scratch: Option<PathBuf>,

    /// Number of concurrent worker slots per job
    #[arg(long, short = 'c', default_value = "4")]
    concurrency: usize,

    /// Per-datum transform timeout in seconds
    #[arg(long, default_value = "3600")]
    datum_timeout: u64,

    /// Retries per datum before it is marked errored
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Docker image to run transforms in (local processes if omitted)
    #[arg(long)]
    image: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

impl WorkerArgs {
    fn config(&self) -> WorkerConfig {
        let mut config = match &self.scratch {
            Some(dir) => WorkerConfig::new(dir),
            None => WorkerConfig::default(),
        };
        config.concurrency = self.concurrency;
        config.datum_timeout = Duration::from_secs(self.datum_timeout);
        config.retry = RetryConfig {
            max_retries: self.max_retries,
            ..RetryConfig::default()
        };
        config.sandbox = SandboxConfig {
            image: self.image.clone(),
            ..SandboxConfig::default()
        };
        config
    }

    fn store(&self) -> Arc<dyn ObjectStore> {
        match &self.store {
            Some(root) => Arc::new(LocalStore::new(root)),
            None => {
                tracing::warn!("No --store given, using an in-memory store");
                Arc::new(MemoryStore::new())
            }
        }
    }
}

async fn serve(worker: WorkerArgs, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = worker.config();
    config.metrics_addr = SocketAddr::from(([0, 0, 0, 0], port));
    config.validate()?;

    let shutdown = install_shutdown_handler()?;
    let metrics = PrometheusRecorder::new()?;
    let controller = JobController::new(
        worker.store(),
        Arc::new(metrics.clone()),
        &config,
        shutdown.clone(),
    );

    tracing::info!(
        addr = %config.metrics_addr,
        concurrency = config.concurrency,
        scratch = %config.scratch_root.display(),
        "Worker starting"
    );

    let state = ApiState {
        controller: controller.clone(),
        metrics,
    };
    let served = api::run_server(config.metrics_addr, state, shutdown.clone()).await;

    controller.shutdown().await;
    served?;
    tracing::info!("Worker stopped");
    Ok(())
}

async fn run_manifest(
    worker: WorkerArgs,
    manifest: PathBuf,
    output: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = worker.config();
    config.validate()?;

    let raw = tokio::fs::read(&manifest).await?;
    let request: JobRequest = serde_json::from_slice(&raw)?;

    let shutdown = install_shutdown_handler()?;
    let metrics = PrometheusRecorder::new()?;
    let controller = JobController::new(worker.store(), Arc::new(metrics), &config, shutdown);

    let id = controller.submit(request).await?;
    controller.wait(id).await?;
    let status = controller.query(id).await?;

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&status)?),
        OutputFormat::Table => print_status(&status),
    }

    if status.state != JobState::Success {
        std::process::exit(1);
    }
    Ok(())
}

fn print_status(status: &JobStatus) {
    println!("Job ID:     {}", status.id);
    println!("Pipeline:   {} (v{})", status.pipeline, status.pipeline_version);
    println!("Input:      {}", status.input_version);
    println!("State:      {}", status.state);
    println!(
        "Datums:     {} total, {} finished, {} errored, {} queued",
        status.total_datums, status.counts.finished, status.counts.errored, status.counts.queued
    );
    if let Some(ratio) = status.failure_ratio {
        println!("Failed:     {:.1}%", ratio * 100.0);
    }
    if let Some(error) = &status.error {
        println!("Error:      {}", error);
    }
    if !status.failed_datums.is_empty() {
        println!();
        println!("{:<14} {:<9} {:<10} REASON", "DATUM", "ATTEMPTS", "FAULT");
        println!("{}", "-".repeat(60));
        for datum in &status.failed_datums {
            let (kind, message) = match &datum.failure {
                Some(f) => (f.kind.to_string(), f.message.lines().next().unwrap_or("")),
                None => ("-".to_string(), ""),
            };
            println!(
                "{:<14} {:<9} {:<10} {}",
                datum.fingerprint.short(),
                datum.attempts,
                kind,
                message
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve { worker, port } => serve(worker, port).await,
        Commands::Run {
            worker,
            manifest,
            output,
        } => run_manifest(worker, manifest, output).await,
    }
}
