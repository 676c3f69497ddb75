use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::CronError;
use crate::scheduler::{ExecutionStatus, JobExecuteInfo, JobExecuteResult};
use crate::store::CoordinationStore;
use crate::worker::lock::JobLock;

/// Output of one shell invocation.
#[derive(Debug)]
struct CommandOutcome {
    status: ExecutionStatus,
    exit_code: Option<i32>,
    output: String,
    error: Option<String>,
}

/// Runs job commands under the job's distributed lock.
///
/// Each execution:
/// - sleeps a random jitter so workers that computed the same fire time do
///   not all race for the lock at once
/// - takes the [`JobLock`]; losing it yields an [`ExecutionStatus::Skipped`]
///   result without running anything
/// - runs `<shell> -c <command>` in its own process group, with stdout and
///   stderr sharing one pipe so output keeps the order it was written in
/// - kills the whole process group when the execution's cancellation token
///   fires
/// - releases the lock on every path
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn CoordinationStore>,
    config: WorkerConfig,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn CoordinationStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Execute in the background and deliver exactly one result to `results`.
    pub fn spawn(
        &self,
        info: JobExecuteInfo,
        results: mpsc::Sender<JobExecuteResult>,
    ) -> JoinHandle<()> {
        let executor = self.clone();
        tokio::spawn(async move {
            let result = executor.execute(info).await;
            let job = result.job_name().to_string();
            if results.send(result).await.is_err() {
                tracing::warn!(job = %job, "Scheduler gone, dropping job result");
            }
        })
    }

    /// Execute a job to completion, cancellation or lock loss.
    pub async fn execute(&self, info: JobExecuteInfo) -> JobExecuteResult {
        let mut start_time = Utc::now();

        self.jitter(&info.cancel).await;
        if info.cancel.is_cancelled() {
            tracing::info!(job = %info.job.name, "Job killed before it started");
            return Self::finish(
                info,
                start_time,
                CommandOutcome {
                    status: ExecutionStatus::Cancelled,
                    exit_code: None,
                    output: String::new(),
                    error: Some("job was killed before it started".to_string()),
                },
            );
        }

        let mut lock = JobLock::new(
            Arc::clone(&self.store),
            info.job.name.clone(),
            self.config.lock_ttl(),
        );

        let outcome = match lock.try_lock().await {
            Ok(()) => {
                // Duration reflects run time, not lock wait
                start_time = Utc::now();
                tracing::info!(
                    job = %info.job.name,
                    worker_id = %self.config.worker_id,
                    command = %info.job.command,
                    "Executing job"
                );
                self.run_command(&info.job.command, &info.cancel).await
            }
            Err(CronError::LockAlreadyHeld(_)) => {
                tracing::debug!(
                    job = %info.job.name,
                    worker_id = %self.config.worker_id,
                    "Job lock held elsewhere, skipping tick"
                );
                CommandOutcome {
                    status: ExecutionStatus::Skipped,
                    exit_code: None,
                    output: String::new(),
                    error: Some(CronError::LockAlreadyHeld(info.job.name.clone()).to_string()),
                }
            }
            Err(e) => {
                tracing::warn!(job = %info.job.name, error = %e, "Failed to acquire job lock");
                CommandOutcome {
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    output: String::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        lock.unlock().await;

        let result = Self::finish(info, start_time, outcome);
        if result.status != ExecutionStatus::Skipped {
            tracing::info!(
                job = %result.info.job.name,
                status = %result.status,
                exit_code = ?result.exit_code,
                duration_ms = (result.end_time - result.start_time).num_milliseconds(),
                "Job finished"
            );
        }
        result
    }

    fn finish(
        info: JobExecuteInfo,
        start_time: chrono::DateTime<Utc>,
        outcome: CommandOutcome,
    ) -> JobExecuteResult {
        JobExecuteResult {
            info,
            status: outcome.status,
            exit_code: outcome.exit_code,
            output: outcome.output,
            error: outcome.error,
            start_time,
            end_time: Utc::now(),
        }
    }

    async fn jitter(&self, cancel: &CancellationToken) {
        let delay = random_jitter(self.config.lock_jitter_max_ms);
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }

    async fn run_command(&self, command: &str, cancel: &CancellationToken) -> CommandOutcome {
        let spawned = combined_output_pipe().and_then(|(reader, writer)| {
            let mut cmd = Command::new(&self.config.shell);
            cmd.arg("-c")
                .arg(command)
                .stdin(Stdio::null())
                .stdout(writer.try_clone()?)
                .stderr(writer)
                .kill_on_drop(true)
                .process_group(0);
            // `cmd` owns the parent's copies of the write end; it must be
            // dropped before reading or the pipe never reaches EOF
            let child = cmd.spawn()?;
            Ok((child, reader))
        });

        let (mut child, reader) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(command, error = %e, "Failed to spawn job process");
                return CommandOutcome {
                    status: ExecutionStatus::Failed,
                    exit_code: None,
                    output: String::new(),
                    error: Some(e.to_string()),
                };
            }
        };

        let wait = async {
            tokio::select! {
                status = child.wait() => (status, false),
                _ = cancel.cancelled() => {
                    kill_process_group(&mut child);
                    (child.wait().await, true)
                }
            }
        };
        let ((status, killed), output) = tokio::join!(wait, read_pipe(reader));
        let output = String::from_utf8_lossy(&output).to_string();

        Self::process_status(status, killed, output)
    }

    fn process_status(
        status: std::io::Result<ExitStatus>,
        killed: bool,
        output: String,
    ) -> CommandOutcome {
        match status {
            Ok(_) if killed => CommandOutcome {
                status: ExecutionStatus::Cancelled,
                exit_code: None,
                output,
                error: Some("job was killed".to_string()),
            },
            Ok(status) if status.success() => CommandOutcome {
                status: ExecutionStatus::Succeeded,
                exit_code: status.code(),
                output,
                error: None,
            },
            Ok(status) => CommandOutcome {
                status: ExecutionStatus::Failed,
                exit_code: status.code(),
                output,
                error: Some(status.to_string()),
            },
            Err(e) => CommandOutcome {
                status: ExecutionStatus::Failed,
                exit_code: None,
                output,
                error: Some(e.to_string()),
            },
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("config", &self.config)
            .finish()
    }
}

/// Random pre-lock delay in `0..=max_ms`.
pub fn random_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

fn kill_process_group(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // The child leads its own group, so this reaches everything it spawned
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::warn!(pid, error = %e, "Failed to kill job process group");
        let _ = child.start_kill();
    }
}

/// One pipe for both output streams of a job. The read end is registered
/// with the runtime; the write end is handed to the child.
fn combined_output_pipe() -> std::io::Result<(pipe::Receiver, std::io::PipeWriter)> {
    let (reader, writer) = std::io::pipe()?;
    let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((reader, writer))
}

async fn read_pipe<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        tracing::warn!(error = %e, "Failed to read job output");
    }
    buf
}
