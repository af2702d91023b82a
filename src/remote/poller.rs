use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, Result};
use crate::remote::ServerClient;
use crate::scheduler::Scheduler;

/// Claims tasks leased to this agent and submits them to the scheduler.
pub struct TaskPoller {
    client: Arc<ServerClient>,
    scheduler: Scheduler,
    interval: Duration,
    batch_size: usize,
}

impl TaskPoller {
    pub fn new(
        client: Arc<ServerClient>,
        scheduler: Scheduler,
        interval: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            client,
            scheduler,
            interval,
            batch_size,
        }
    }

    /// One claim round. Returns how many claimed tasks were submitted.
    ///
    /// A task the agent already holds under the same attempt is skipped
    /// whatever its status, so a re-delivered claim neither resets a running
    /// task nor re-runs a finished one. Finished results reach the server
    /// through the syncer.
    pub async fn poll_once(&self) -> Result<usize> {
        let tasks = self.client.claim_tasks(self.batch_size).await?;
        let mut submitted = 0;

        for task in tasks {
            match self.scheduler.get_task(&task.id) {
                Ok(existing) if existing.attempt_id == task.attempt_id => {
                    tracing::debug!(task_id = %task.id, status = %existing.status, "Claimed attempt already held");
                    continue;
                }
                Ok(_) | Err(AgentError::TaskNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Failed to look up claimed task");
                    continue;
                }
            }

            let task_id = task.id.clone();
            match self.scheduler.submit(task).await {
                Ok(_) => submitted += 1,
                Err(e) => {
                    tracing::warn!(task_id = %task_id, error = %e, "Failed to submit claimed task")
                }
            }
        }

        if submitted > 0 {
            tracing::info!(count = submitted, "Claimed tasks from server");
        }
        Ok(submitted)
    }

    /// Poll every interval until `shutdown` fires. Errors are logged and the
    /// loop carries on.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.poll_once().await {
                tracing::warn!(error = %e, "Task claim failed");
            }
        }

        tracing::debug!("Task poller stopped");
    }
}
