use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::{Result, WorkerError};
use crate::scheduler::TransformSpec;

/// Where the input and output directories appear inside a container.
const CONTAINER_INPUT: &str = "/pfs/in";
const CONTAINER_OUTPUT: &str = "/pfs/out";

/// How long output capture may outlive a killed transform.
const CAPTURE_GRACE: Duration = Duration::from_millis(500);

/// Everything needed to run the transform for one datum attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest<'a> {
    pub transform: &'a TransformSpec,
    pub pipeline: &'a str,
    pub job_id: &'a str,
    pub datum: &'a str,
    pub input_dir: &'a Path,
    pub output_dir: &'a Path,
    pub timeout: Duration,
}

/// Result of a transform run that exited zero.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

enum Exit {
    Status(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

enum Capture {
    Done(String, String),
    Expired,
    Cancelled,
}

/// Runs pipeline transforms as isolated child processes.
///
/// Every run gets its own process group, which is killed once the run ends
/// on any path (exit, timeout, cancellation) so user code cannot leave
/// background processes behind. Container runs are additionally stopped
/// with `docker kill`.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub async fn run(
        &self,
        req: &ExecutionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome> {
        let container = self
            .config
            .image
            .as_ref()
            .map(|_| format!("datum-{}", Uuid::new_v4().simple()));
        let mut cmd = self.build_command(req, container.as_deref());
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        tracing::debug!(
            job_id = req.job_id,
            datum = req.datum,
            cmd = %req.transform.cmd,
            containerized = container.is_some(),
            "Starting transform"
        );

        let start = Instant::now();
        let mut child = cmd
            .spawn()
            .map_err(|e| WorkerError::Sandbox(format!("failed to start transform: {}", e)))?;
        let pid = child.id();

        let cap = self.config.max_captured_output;
        let mut stdout = child.stdout.take().map(|s| tokio::spawn(read_capped(s, cap)));
        let mut stderr = child.stderr.take().map(|s| tokio::spawn(read_capped(s, cap)));

        let exit = tokio::select! {
            status = child.wait() => Exit::Status(status),
            _ = tokio::time::sleep(req.timeout) => Exit::TimedOut,
            _ = cancel.cancelled() => Exit::Cancelled,
        };
        let elapsed = start.elapsed();

        let exited = matches!(exit, Exit::Status(Ok(_)));
        if !exited {
            if let Some(name) = container.as_deref() {
                stop_container(name).await;
            }
        }
        kill_process_group(pid);
        if !exited {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "Transform already exited");
            }
        }

        // Processes that left the group (setsid) can hold the pipes open, so
        // capture is bounded by the run deadline and by cancellation too.
        let capture_deadline = if exited {
            start + req.timeout
        } else {
            Instant::now() + CAPTURE_GRACE
        };
        let capture = tokio::select! {
            biased;
            (out, err) = async {
                tokio::join!(join_capture(&mut stdout), join_capture(&mut stderr))
            } => Capture::Done(out, err),
            _ = cancel.cancelled() => Capture::Cancelled,
            _ = tokio::time::sleep_until(capture_deadline) => Capture::Expired,
        };

        let (stdout, stderr) = match capture {
            Capture::Done(stdout, stderr) => (stdout, stderr),
            abandoned => {
                for reader in [&stdout, &stderr].into_iter().flatten() {
                    reader.abort();
                }
                tracing::warn!(
                    job_id = req.job_id,
                    datum = req.datum,
                    "Transform output still open after the run ended, abandoning capture"
                );
                if matches!(abandoned, Capture::Cancelled) || matches!(exit, Exit::Cancelled) {
                    return Err(WorkerError::Cancelled);
                }
                return Err(WorkerError::Timeout(req.timeout));
            }
        };

        match exit {
            Exit::Status(Ok(status)) if status.success() => {
                tracing::debug!(
                    job_id = req.job_id,
                    datum = req.datum,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Transform finished"
                );
                Ok(ExecutionOutcome {
                    exit_code: status.code(),
                    stdout,
                    stderr,
                    elapsed,
                })
            }
            Exit::Status(Ok(status)) => {
                let detail = if stderr.trim().is_empty() {
                    match status.code() {
                        Some(code) => format!("exit code {}", code),
                        None => "terminated by signal".to_string(),
                    }
                } else {
                    format!("exit code {:?}: {}", status.code(), stderr.trim())
                };
                Err(WorkerError::Execution(detail))
            }
            Exit::Status(Err(e)) => Err(WorkerError::Sandbox(format!(
                "failed waiting for transform: {}",
                e
            ))),
            Exit::TimedOut => Err(WorkerError::Timeout(req.timeout)),
            Exit::Cancelled => Err(WorkerError::Cancelled),
        }
    }

    fn build_command(&self, req: &ExecutionRequest<'_>, container: Option<&str>) -> Command {
        match (&self.config.image, container) {
            (Some(image), Some(name)) => self.docker_command(req, image, name),
            _ => self.local_command(req),
        }
    }

    fn local_command(&self, req: &ExecutionRequest<'_>) -> Command {
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(&req.transform.cmd)
            .current_dir(req.input_dir)
            .envs(&req.transform.env)
            .env("DATUM_INPUT", req.input_dir)
            .env("DATUM_OUTPUT", req.output_dir)
            .env("DATUM_ID", req.datum)
            .env("JOB_ID", req.job_id)
            .env("PIPELINE_NAME", req.pipeline);
        cmd
    }

    fn docker_command(&self, req: &ExecutionRequest<'_>, image: &str, name: &str) -> Command {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            format!("--name={}", name),
        ];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--read-only".to_string());

        args.push(format!("--volume={}:{}:ro", host_path(req.input_dir), CONTAINER_INPUT));
        args.push(format!("--volume={}:{}", host_path(req.output_dir), CONTAINER_OUTPUT));
        args.push(format!("--workdir={}", CONTAINER_INPUT));

        let mut env: Vec<(String, String)> = req
            .transform
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("DATUM_INPUT".into(), CONTAINER_INPUT.into()));
        env.push(("DATUM_OUTPUT".into(), CONTAINER_OUTPUT.into()));
        env.push(("DATUM_ID".into(), req.datum.into()));
        env.push(("JOB_ID".into(), req.job_id.into()));
        env.push(("PIPELINE_NAME".into(), req.pipeline.into()));
        for (k, v) in env {
            args.push(format!("--env={}={}", k, v));
        }

        args.push(image.to_string());
        args.push(self.config.shell.clone());
        args.push("-c".to_string());
        args.push(req.transform.cmd.clone());

        let mut cmd = Command::new("docker");
        cmd.args(&args);
        cmd
    }
}

fn host_path(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path))
        .display()
        .to_string()
}

/// Read a pipe to the end, keeping at most `cap` bytes. The rest is drained so
/// the child never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&kept).into_owned()
}

async fn join_capture(handle: &mut Option<JoinHandle<String>>) -> String {
    match handle.as_mut() {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) takes no pointers; a negative pid targets the process
    // group created for this child. ESRCH just means nothing is left.
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

async fn stop_container(name: &str) {
    let result = Command::new("docker")
        .args(["kill", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    if let Err(e) = result {
        tracing::warn!(container = name, error = %e, "Failed to stop transform container");
    }
}
