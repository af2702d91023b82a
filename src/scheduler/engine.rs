use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{AgentError, Result};
use crate::remote::TaskReporter;
use crate::scheduler::lease::LeaseRenewer;
use crate::scheduler::queue::TaskQueue;
use crate::scheduler::task::{Task, TaskStatus};
use crate::store::TaskStore;
use crate::worker::{Admission, TaskExecutor};

const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_BACKOFF: Duration = Duration::from_millis(50);

/// What [`Scheduler::recover`] did with the records left by a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Pending and still-leased assigned tasks pushed back into the queue.
    pub requeued: usize,
    /// Assigned tasks whose lease ran out while the agent was down.
    pub expired: usize,
    /// Tasks that were running when the agent stopped.
    pub interrupted: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub running: usize,
    pub capacity: usize,
}

enum Dependencies {
    Ready,
    Waiting,
    Failed(String),
}

struct Inner {
    queue: TaskQueue,
    store: Arc<TaskStore>,
    executor: TaskExecutor,
    reporter: Option<Arc<dyn TaskReporter>>,
    lease: Option<LeaseRenewer>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    /// Dispatched tasks that have not finished, with their cancel handles.
    inflight: Mutex<HashMap<String, CancellationToken>>,
}

/// Durable task scheduler.
///
/// Every state change is written to the store before it is acted on, so a
/// restarted agent can rebuild its queue with [`recover`](Self::recover).
/// Cloning is cheap and all clones drive the same scheduler.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        executor: TaskExecutor,
        config: SchedulerConfig,
        reporter: Option<Arc<dyn TaskReporter>>,
    ) -> Self {
        let lease = reporter
            .clone()
            .map(|r| LeaseRenewer::new(r, config.lease_renew_interval()));

        Self {
            inner: Arc::new(Inner {
                queue: TaskQueue::new(),
                store,
                executor,
                reporter,
                lease,
                config,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                dispatcher: Mutex::new(None),
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<TaskStore> {
        &self.inner.store
    }

    /// Recover persisted state, then start the dispatch loop.
    pub async fn start(&self) -> Result<RecoveryReport> {
        let report = self.recover().await?;

        let mut dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if dispatcher.is_some() {
            tracing::warn!("Scheduler already started");
            return Ok(report);
        }
        let this = self.clone();
        *dispatcher = Some(tokio::spawn(async move { this.dispatch_loop().await }));

        tracing::info!(
            workers = self.inner.executor.max_workers(),
            "Scheduler started"
        );
        Ok(report)
    }

    /// Rebuild the queue from the store.
    ///
    /// Pending tasks are re-queued. Assigned tasks are re-queued unless their
    /// lease has expired, in which case they are failed. Tasks left running by a
    /// crash are failed, and remote ones are reported.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let store = &self.inner.store;
        let now = Utc::now();
        let mut report = RecoveryReport::default();

        for task in store.list_by_status(TaskStatus::Pending)? {
            if self.inner.queue.push(task) {
                report.requeued += 1;
            }
        }

        for mut task in store.list_by_status(TaskStatus::Assigned)? {
            if task.lease_expired(now) {
                tracing::warn!(task_id = %task.id, "Lease expired during downtime");
                task.mark_failed("lease expired before the task could run", now);
                store.save(&task)?;
                report.expired += 1;
            } else if self.inner.queue.push(task) {
                report.requeued += 1;
            }
        }

        for mut task in store.list_by_status(TaskStatus::Running)? {
            tracing::warn!(task_id = %task.id, "Task was running when the agent stopped");
            task.mark_failed("agent restarted while task was running", now);
            store.save(&task)?;
            report.interrupted += 1;
            if task.is_remote() {
                self.report_complete(&task).await;
            }
        }

        tracing::info!(
            requeued = report.requeued,
            expired = report.expired,
            interrupted = report.interrupted,
            "Recovery complete"
        );
        Ok(report)
    }

    async fn dispatch_loop(self) {
        let mut ticker = tokio::time::interval(self.inner.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.queue.notified() => {}
                _ = ticker.tick() => {}
            }
            self.dispatch();
        }

        tracing::debug!("Dispatch loop stopped");
    }

    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inner.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start as many queued tasks as there are free slots.
    ///
    /// Holds the in-flight lock for the whole pass, so a concurrent cancel
    /// finds every task either in the queue or in flight.
    fn dispatch(&self) {
        let mut inflight = self.lock_inflight();
        let mut blocked = Vec::new();

        while let Some(admission) = self.inner.executor.try_admit() {
            let Some(mut task) = self.inner.queue.pop() else {
                break;
            };

            if inflight.contains_key(&task.id) {
                tracing::warn!(task_id = %task.id, "Task already in flight, deferring");
                blocked.push(task);
                continue;
            }

            match self.dependencies(&task) {
                Dependencies::Ready => {
                    let token = CancellationToken::new();
                    inflight.insert(task.id.clone(), token.clone());
                    let this = self.clone();
                    self.inner
                        .tracker
                        .spawn(async move { this.run_task(admission, task, token).await });
                }
                Dependencies::Waiting => blocked.push(task),
                Dependencies::Failed(dep) => {
                    tracing::warn!(task_id = %task.id, dependency = %dep, "Dependency failed, failing task");
                    task.mark_failed(format!("dependency {dep} did not complete"), Utc::now());
                    match self.inner.store.save(&task) {
                        Ok(()) if task.is_remote() => {
                            let this = self.clone();
                            self.inner
                                .tracker
                                .spawn(async move { this.report_complete(&task).await });
                        }
                        Ok(()) => {}
                        Err(e) => {
                            tracing::error!(task_id = %task.id, error = %e, "Failed to persist dependency failure")
                        }
                    }
                }
            }
        }

        // Not woken for these: they are retried on the next tick.
        for task in blocked {
            self.inner.queue.push_deferred(task);
        }
    }

    fn dependencies(&self, task: &Task) -> Dependencies {
        for dep in &task.depends_on {
            match self.inner.store.get(dep) {
                Ok(dep_task) => match dep_task.status {
                    TaskStatus::Completed => {}
                    TaskStatus::Failed | TaskStatus::Cancelled => {
                        return Dependencies::Failed(dep.clone())
                    }
                    _ => return Dependencies::Waiting,
                },
                Err(AgentError::TaskNotFound(_)) => return Dependencies::Waiting,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, dependency = %dep, error = %e, "Failed to check dependency");
                    return Dependencies::Waiting;
                }
            }
        }
        Dependencies::Ready
    }

    async fn run_task(&self, admission: Admission, task: Task, token: CancellationToken) {
        let _inflight = InflightEntry {
            inner: &self.inner,
            id: task.id.clone(),
        };

        // The queue entry may be older than the record, e.g. after a resubmit
        // under a new attempt or a cancel that raced a retry timer.
        let mut task = match self.inner.store.get(&task.id) {
            Ok(stored) if matches!(stored.status, TaskStatus::Pending | TaskStatus::Assigned) => {
                stored
            }
            Ok(stored) => {
                tracing::debug!(task_id = %task.id, status = %stored.status, "Skipping task that is no longer runnable");
                return;
            }
            Err(AgentError::TaskNotFound(_)) => {
                tracing::debug!(task_id = %task.id, "Skipping task with no record");
                return;
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to load task, requeueing");
                self.inner.queue.push_deferred(task);
                return;
            }
        };
        if token.is_cancelled() {
            self.mark_cancelled(task).await;
            return;
        }

        let queued = task.clone();
        task.mark_running(Utc::now());

        // Never run without a durable record of it.
        if let Err(e) = self.persist(&task).await {
            tracing::error!(task_id = %task.id, error = %e, "Could not record task start, requeueing");
            self.inner.queue.push_deferred(queued);
            return;
        }

        let lease = match (&self.inner.reporter, &self.inner.lease) {
            (Some(reporter), Some(lease)) if task.is_remote() => {
                if let Err(e) = reporter.report_start(&task.id, &task.attempt_id).await {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to report task start");
                }
                Some(lease.spawn(task.id.clone(), task.attempt_id.clone()))
            }
            _ => None,
        };

        let result = self
            .inner
            .executor
            .execute_cancellable(admission, &mut task, token)
            .await;

        if let Some(lease) = lease {
            lease.stop().await;
        }

        if let Err(e) = result {
            tracing::warn!(task_id = %task.id, error = %e, "Task was not executed");
            return;
        }

        self.finish(task).await;
    }

    async fn finish(&self, mut task: Task) {
        if task.should_retry() {
            let delay = task.retry_delay(self.inner.config.default_retry_delay());
            tracing::info!(
                task_id = %task.id,
                attempt = task.retry_count + 1,
                max_retries = task.max_retries,
                error = %task.error,
                delay_secs = delay.as_secs(),
                "Task failed, scheduling retry"
            );

            task.prepare_retry();
            if self.persist(&task).await.is_err() {
                return;
            }
            self.schedule_retry(task.id, delay);
            return;
        }

        if self.persist(&task).await.is_err() {
            return;
        }
        if task.is_remote() {
            self.report_complete(&task).await;
        }
    }

    /// Re-queue after `delay`. The record is re-read when the timer fires so a
    /// cancellation in the meantime is respected.
    fn schedule_retry(&self, id: String, delay: Duration) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match inner.store.get(&id) {
                Ok(task) if task.status == TaskStatus::Pending => {
                    inner.queue.push(task);
                }
                Ok(task) => {
                    tracing::debug!(task_id = %id, status = %task.status, "Retry no longer pending")
                }
                Err(e) => tracing::warn!(task_id = %id, error = %e, "Dropping retry"),
            }
        });
    }

    /// Report a terminal result. Success, or a lease the server no longer
    /// recognises, marks the record synced.
    async fn report_complete(&self, task: &Task) {
        let Some(reporter) = &self.inner.reporter else {
            return;
        };

        match reporter.report_complete(task).await {
            Ok(()) => {
                tracing::debug!(task_id = %task.id, "Reported task completion");
            }
            Err(e) if e.is_lease_invalid() => {
                tracing::warn!(task_id = %task.id, error = %e, "Server rejected completion, lease no longer held");
            }
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to report completion, will retry in sync");
                return;
            }
        }

        if let Err(e) = self.inner.store.mark_synced(&task.id) {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to mark task synced");
        }
    }

    async fn persist(&self, task: &Task) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.inner.store.save(task) {
                Ok(()) => return Ok(()),
                Err(AgentError::StoreClosed) => {
                    tracing::error!(task_id = %task.id, status = %task.status, "Store closed, task state lost");
                    return Err(AgentError::StoreClosed);
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    tracing::warn!(task_id = %task.id, attempt, error = %e, "Persist failed, retrying");
                    tokio::time::sleep(PERSIST_BACKOFF * attempt).await;
                }
                Err(e) => {
                    tracing::error!(task_id = %task.id, status = %task.status, error = %e, "Failed to persist task");
                    return Err(e);
                }
            }
        }
    }

    /// Accept a task for execution.
    ///
    /// Local tasks (no attempt ID) are normalized to `pending` with a creation
    /// time and, if needed, a generated ID. Remote tasks are stored as received.
    /// Resubmitting a queued ID replaces it; a task that has been dispatched
    /// and not finished is refused with [`AgentError::AlreadyRunning`].
    pub async fn submit(&self, mut task: Task) -> Result<Task> {
        if task.command.trim().is_empty() {
            return Err(AgentError::InvalidTask("command must not be empty".into()));
        }

        if task.is_remote() {
            if task.id.is_empty() {
                return Err(AgentError::InvalidTask(
                    "remote task is missing an ID".into(),
                ));
            }
        } else {
            if task.id.is_empty() {
                task.id = Uuid::new_v4().to_string();
            }
            task.status = TaskStatus::Pending;
            if task.created_at.is_none() {
                task.created_at = Some(Utc::now());
            }
        }

        {
            let inflight = self.lock_inflight();
            if inflight.contains_key(&task.id) {
                return Err(AgentError::AlreadyRunning(task.id));
            }
            self.inner.store.save(&task)?;
            // Replace any queued copy so the queue never runs a superseded record.
            if self.inner.queue.remove(&task.id) {
                tracing::info!(task_id = %task.id, "Replacing queued task");
            }
            self.inner.queue.push(task.clone());
        }

        tracing::info!(
            task_id = %task.id,
            priority = task.priority,
            remote = task.is_remote(),
            "Task submitted"
        );
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.inner.store.get(id)
    }

    /// Cancel a queued, running, or retry-waiting task. Returns false when
    /// there was nothing to cancel.
    pub async fn cancel_task(&self, id: &str) -> Result<bool> {
        let cancelled = {
            let inflight = self.lock_inflight();
            if self.inner.queue.remove(id) {
                tracing::info!(task_id = %id, "Removed task from queue");
                self.record_cancelled(id)?
            } else if self.inner.executor.cancel(id) {
                return Ok(true);
            } else if let Some(token) = inflight.get(id) {
                tracing::info!(task_id = %id, "Cancelling task before it starts");
                token.cancel();
                return Ok(true);
            } else {
                match self.inner.store.get(id) {
                    Ok(task) if task.status == TaskStatus::Pending => {
                        tracing::info!(task_id = %id, "Cancelling task waiting for retry");
                        self.record_cancelled(id)?
                    }
                    Ok(_) | Err(AgentError::TaskNotFound(_)) => return Ok(false),
                    Err(e) => return Err(e),
                }
            }
        };

        if let Some(task) = cancelled.filter(|t| t.is_remote()) {
            self.report_complete(&task).await;
        }
        Ok(true)
    }

    /// Mark the stored record cancelled. `None` when there is no record.
    fn record_cancelled(&self, id: &str) -> Result<Option<Task>> {
        let mut task = match self.inner.store.get(id) {
            Ok(task) => task,
            Err(AgentError::TaskNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        set_cancelled(&mut task);
        self.inner.store.save(&task)?;
        Ok(Some(task))
    }

    async fn mark_cancelled(&self, mut task: Task) {
        set_cancelled(&mut task);
        if self.persist(&task).await.is_ok() && task.is_remote() {
            self.report_complete(&task).await;
        }
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            pending: self.inner.queue.len(),
            running: self.inner.executor.running_count(),
            capacity: self.inner.executor.max_workers(),
        }
    }

    /// Snapshot of queued tasks in dispatch order.
    pub fn queued_tasks(&self) -> Vec<Task> {
        self.inner.queue.list()
    }

    /// Stop dispatching, wait for in-flight runs, then close the store.
    /// Pending retry timers are not awaited.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.inner.shutdown.cancel();

        let dispatcher = self
            .inner
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        if let Err(e) = self.inner.store.close() {
            tracing::error!(error = %e, "Failed to close task store");
        }
        tracing::info!("Scheduler stopped");
    }
}

fn set_cancelled(task: &mut Task) {
    task.status = TaskStatus::Cancelled;
    task.error = "cancelled".to_string();
    task.exit_code = -1;
    task.ended_at = Some(Utc::now());
}

/// Drops the task from the in-flight map when its run ends.
struct InflightEntry<'a> {
    inner: &'a Inner,
    id: String,
}

impl Drop for InflightEntry<'_> {
    fn drop(&mut self) {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
