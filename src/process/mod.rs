//! Timeout-bounded shell command execution.
//!
//! Each command runs as `sh -c <command>` in its own process group so that a
//! timeout can take down everything the shell started, not just the shell.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

/// Fallback execution timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 30000;

/// How long output readers get to finish once the process group is gone
const OUTPUT_GRACE: Duration = Duration::from_secs(1);

/// How a command run ended
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Exited on its own with a status code
    Exited { code: i32 },
    /// Terminated by a signal it did not get from us
    Signaled { signal: i32 },
    /// Killed because the timeout elapsed
    TimedOut,
    /// Could not be started or waited on
    Failed { message: String },
}

/// Outcome plus everything the command printed
#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub outcome: ProcessOutcome,
    pub stdout: String,
    pub stderr: String,
    pub timeout: Duration,
    pub elapsed: Duration,
}

impl ProcessResult {
    /// Exit code 0 and not timed out
    pub fn success(&self) -> bool {
        self.outcome == ProcessOutcome::Exited { code: 0 }
    }

    /// Error text recorded for a failed attempt: the timeout message, else
    /// stderr, else a description of how the process ended
    pub fn failure_message(&self) -> String {
        if self.outcome == ProcessOutcome::TimedOut {
            return format!("timeout after {}ms", self.timeout.as_millis());
        }

        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            return stderr.to_string();
        }

        match &self.outcome {
            ProcessOutcome::Exited { code } => format!("exit code {}", code),
            ProcessOutcome::Signaled { signal } => format!("killed by signal {}", signal),
            ProcessOutcome::Failed { message } => format!("failed to run command: {}", message),
            ProcessOutcome::TimedOut => format!("timeout after {}ms", self.timeout.as_millis()),
        }
    }
}

/// Run `command` through the shell, killing it once `timeout` elapses
pub async fn run_command(command: &str, timeout: Duration) -> ProcessResult {
    let started = Instant::now();
    let deadline = started + timeout;

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ProcessResult {
                outcome: ProcessOutcome::Failed { message: e.to_string() },
                stdout: String::new(),
                stderr: String::new(),
                timeout,
                elapsed: started.elapsed(),
            }
        }
    };

    let pid = child.id();
    let stdout_task = spawn_reader(child.stdout.take());
    let stderr_task = spawn_reader(child.stderr.take());

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = time::sleep_until(deadline) => None,
    };

    let mut outcome = match waited {
        Some(Ok(status)) => outcome_from_status(status),
        Some(Err(e)) => ProcessOutcome::Failed { message: e.to_string() },
        None => {
            debug!("Command exceeded {:?}, killing process group {:?}", timeout, pid);
            kill_group(pid);
            if let Err(e) = child.kill().await {
                debug!("Reaping timed out child failed: {}", e);
            }
            ProcessOutcome::TimedOut
        }
    };

    let drain = async { (collect(stdout_task).await, collect(stderr_task).await) };
    tokio::pin!(drain);

    // The shell may exit while something it started still holds the pipes
    // open; that counts against the same deadline.
    let mut output = None;
    if outcome != ProcessOutcome::TimedOut {
        tokio::select! {
            drained = &mut drain => output = Some(drained),
            _ = time::sleep_until(deadline) => {
                kill_group(pid);
                outcome = ProcessOutcome::TimedOut;
            }
        }
    }

    let (stdout, stderr) = match output {
        Some(drained) => drained,
        None => time::timeout(OUTPUT_GRACE, &mut drain).await.unwrap_or_default(),
    };

    ProcessResult {
        outcome,
        stdout,
        stderr,
        timeout,
        elapsed: started.elapsed(),
    }
}

fn spawn_reader<R>(reader: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            if let Err(e) = reader.read_to_end(&mut buf).await {
                debug!("Reading command output failed: {}", e);
            }
        }
        buf
    })
}

async fn collect(task: JoinHandle<Vec<u8>>) -> String {
    match task.await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            warn!("Output reader task failed: {}", e);
            String::new()
        }
    }
}

fn outcome_from_status(status: ExitStatus) -> ProcessOutcome {
    match (status.code(), status.signal()) {
        (Some(code), _) => ProcessOutcome::Exited { code },
        (None, Some(signal)) => ProcessOutcome::Signaled { signal },
        (None, None) => ProcessOutcome::Failed {
            message: format!("unrecognized exit status {}", status),
        },
    }
}

fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else { return };

    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to kill process group {}: {}", pid, e),
    }
}
