use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::scheduler::task::{Task, TaskStatus};
use crate::worker::output::{read_capped, CapturedOutput, DEFAULT_MAX_OUTPUT_SIZE};
use crate::worker::validator::CommandValidator;

pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Time between SIGTERM and SIGKILL when a task is stopped.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// A reserved execution slot. The slot is released when this is dropped.
#[derive(Debug)]
pub struct Admission {
    _permit: OwnedSemaphorePermit,
}

type RunningMap = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Removes the task from the running set however execution ends.
struct RunningEntry {
    running: RunningMap,
    id: String,
}

impl Drop for RunningEntry {
    fn drop(&mut self) {
        lock(&self.running).remove(&self.id);
    }
}

fn lock(running: &RunningMap) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    running.lock().unwrap_or_else(|e| e.into_inner())
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(Duration),
    Cancelled,
}

/// Runs task commands as child processes under a fixed concurrency limit.
///
/// Each child gets its own process group so that timeouts and cancellation
/// reach anything it spawned. At most one execution per task ID is in flight.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    max_workers: usize,
    slots: Arc<Semaphore>,
    running: RunningMap,
    validator: Option<CommandValidator>,
    max_output_size: usize,
    default_timeout: Duration,
    kill_grace: Duration,
}

impl TaskExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            slots: Arc::new(Semaphore::new(max_workers)),
            running: Arc::new(Mutex::new(HashMap::new())),
            validator: None,
            max_output_size: DEFAULT_MAX_OUTPUT_SIZE,
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            kill_grace: KILL_GRACE,
        }
    }

    /// Reject commands before spawning. A validator with no rules is ignored.
    pub fn with_validator(mut self, validator: CommandValidator) -> Self {
        self.validator = validator.is_enabled().then_some(validator);
        self
    }

    pub fn with_max_output_size(mut self, bytes: usize) -> Self {
        self.max_output_size = bytes;
        self
    }

    /// Timeout for tasks that do not set their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        lock(&self.running).contains_key(id)
    }

    /// Whether a slot is free right now. The answer may be stale by the time
    /// the caller acts on it; use [`try_admit`](Self::try_admit) to reserve.
    pub fn can_accept(&self) -> bool {
        self.slots.available_permits() > 0
    }

    pub fn try_admit(&self) -> Option<Admission> {
        self.slots
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Admission { _permit: permit })
    }

    /// Wait for a free slot, then run the task to completion.
    pub async fn execute(&self, task: &mut Task) -> Result<()> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AgentError::PoolClosed)?;
        self.execute_admitted(Admission { _permit: permit }, task)
            .await
    }

    /// Run the task on an already reserved slot.
    ///
    /// Execution failures are recorded on the task itself; an error is only
    /// returned when the task could not be started at all because another
    /// execution of the same ID is in flight.
    pub async fn execute_admitted(&self, admission: Admission, task: &mut Task) -> Result<()> {
        self.execute_cancellable(admission, task, CancellationToken::new())
            .await
    }

    /// Like [`execute_admitted`](Self::execute_admitted), stopped early when
    /// `token` is cancelled. A token cancelled before the call means nothing
    /// is spawned.
    pub async fn execute_cancellable(
        &self,
        admission: Admission,
        task: &mut Task,
        token: CancellationToken,
    ) -> Result<()> {
        let _entry = {
            let mut running = lock(&self.running);
            if running.contains_key(&task.id) {
                return Err(AgentError::AlreadyRunning(task.id.clone()));
            }
            running.insert(task.id.clone(), token.clone());
            RunningEntry {
                running: self.running.clone(),
                id: task.id.clone(),
            }
        };

        task.started_at = Some(Utc::now());
        task.status = TaskStatus::Running;

        if let Some(validator) = &self.validator {
            if let Err(e) = validator.validate(&task.command, &task.args) {
                let reason = match e {
                    AgentError::CommandRejected(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(task_id = %task.id, command = %task.command, reason = %reason, "Command rejected");
                task.exit_code = -1;
                finish(task, TaskStatus::Failed, format!("command rejected: {reason}"));
                return Ok(());
            }
        }

        if token.is_cancelled() {
            task.exit_code = -1;
            finish(task, TaskStatus::Cancelled, "cancelled".to_string());
            return Ok(());
        }

        tracing::info!(task_id = %task.id, command = %task.command, "Executing task");
        self.run(task, &token).await;
        drop(admission);

        tracing::info!(
            task_id = %task.id,
            status = %task.status,
            exit_code = task.exit_code,
            "Task finished"
        );
        Ok(())
    }

    /// Ask an in-flight execution to stop. Returns false if the ID is not running.
    pub fn cancel(&self, id: &str) -> bool {
        match lock(&self.running).get(id) {
            Some(token) => {
                tracing::info!(task_id = %id, "Cancelling running task");
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn build_command(task: &Task) -> Command {
        let mut cmd = if task.args.is_empty() {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&task.command);
            cmd
        } else {
            let mut cmd = Command::new(&task.command);
            cmd.args(&task.args);
            cmd
        };
        if !task.workdir.is_empty() {
            cmd.current_dir(&task.workdir);
        }
        cmd.envs(&task.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    async fn run(&self, task: &mut Task, token: &CancellationToken) {
        let mut child = match Self::build_command(task).spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to spawn task");
                task.exit_code = -1;
                finish(task, TaskStatus::Failed, format!("failed to start: {e}"));
                return;
            }
        };

        // The group ID is the leader's PID; tokio forgets the PID once reaped.
        let pgid = child.id();
        let limit = self.max_output_size;
        let stdout = tokio::spawn(capture(child.stdout.take(), limit));
        let stderr = tokio::spawn(capture(child.stderr.take(), limit));

        let timeout = if task.timeout == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(task.timeout)
        };
        let deadline = Instant::now() + timeout;

        let mut outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = sleep_until(deadline) => Outcome::TimedOut(timeout),
            _ = token.cancelled() => Outcome::Cancelled,
        };

        let leader_exited = matches!(outcome, Outcome::Exited(_));
        if !leader_exited {
            terminate(&mut child, pgid, self.kill_grace).await;
        }

        let collect = async { tokio::join!(stdout, stderr) };
        tokio::pin!(collect);

        // Background processes can hold the pipes open after the leader exits;
        // the deadline and cancellation still apply to them.
        let drained = if leader_exited {
            tokio::select! {
                output = &mut collect => Some(output),
                _ = sleep_until(deadline) => {
                    tracing::warn!(task_id = %task.id, "Task outlived its timeout through background processes");
                    outcome = Outcome::TimedOut(timeout);
                    None
                }
                _ = token.cancelled() => {
                    outcome = Outcome::Cancelled;
                    None
                }
            }
        } else {
            None
        };
        let (out, err) = match drained {
            Some(output) => output,
            None => {
                if leader_exited {
                    signal_group(pgid, GroupSignal::Kill);
                }
                collect.await
            }
        };
        task.stdout = out.unwrap_or_default().into_string();
        task.stderr = err.unwrap_or_default().into_string();

        match outcome {
            Outcome::Exited(Ok(status)) if status.success() => {
                task.exit_code = 0;
                finish(task, TaskStatus::Completed, String::new());
            }
            Outcome::Exited(Ok(status)) => match status.code() {
                Some(code) => {
                    task.exit_code = code;
                    finish(task, TaskStatus::Failed, format!("exit status {code}"));
                }
                None => {
                    task.exit_code = -1;
                    finish(task, TaskStatus::Failed, describe_signal(status));
                }
            },
            Outcome::Exited(Err(e)) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed waiting for task");
                task.exit_code = -1;
                finish(task, TaskStatus::Failed, e.to_string());
            }
            Outcome::TimedOut(after) => {
                tracing::warn!(task_id = %task.id, timeout_secs = after.as_secs(), "Task timed out");
                task.exit_code = -1;
                finish(
                    task,
                    TaskStatus::Failed,
                    format!("timed out after {}s", after.as_secs()),
                );
            }
            Outcome::Cancelled => {
                task.exit_code = -1;
                finish(task, TaskStatus::Cancelled, "cancelled".to_string());
            }
        }
    }
}

fn finish(task: &mut Task, status: TaskStatus, error: String) {
    task.status = status;
    task.error = error;
    task.ended_at = Some(Utc::now());
}

async fn capture<R: AsyncRead + Unpin>(reader: Option<R>, limit: usize) -> CapturedOutput {
    let Some(reader) = reader else {
        return CapturedOutput::default();
    };
    match read_capped(reader, limit).await {
        Ok(out) => out,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read task output");
            CapturedOutput::default()
        }
    }
}

/// SIGTERM the process group, then SIGKILL whatever is left after `grace`.
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration) {
    if signal_group(pgid, GroupSignal::Terminate)
        && tokio::time::timeout(grace, child.wait()).await.is_ok()
    {
        // Leader exited; kill whatever it left behind in the group.
        signal_group(pgid, GroupSignal::Kill);
        return;
    }
    signal_group(pgid, GroupSignal::Kill);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already gone");
    }
}

enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<u32>, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pgid else {
        return false;
    };
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(pid, signal = %signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<u32>, _signal: GroupSignal) -> bool {
    false
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {sig}"),
        None => status.to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(status: ExitStatus) -> String {
    status.to_string()
}
