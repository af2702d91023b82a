use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::remote::TaskReporter;
use crate::store::TaskStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Remote results the server accepted.
    pub reported: usize,
    /// Records marked synced without an accepted report: local tasks, and
    /// remote ones whose lease the server no longer recognises.
    pub skipped: usize,
    /// Records left unsynced for the next round.
    pub failed: usize,
}

/// Periodically pushes terminal results that were never acknowledged.
pub struct ResultSyncer {
    store: Arc<TaskStore>,
    reporter: Arc<dyn TaskReporter>,
    interval: Duration,
}

impl ResultSyncer {
    pub fn new(store: Arc<TaskStore>, reporter: Arc<dyn TaskReporter>, interval: Duration) -> Self {
        Self {
            store,
            reporter,
            interval,
        }
    }

    pub async fn sync_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();

        for task in self.store.list_unsynced()? {
            if !task.is_remote() {
                self.store.mark_synced(&task.id)?;
                report.skipped += 1;
                continue;
            }

            match self.reporter.report_complete(&task).await {
                Ok(()) => {
                    self.store.mark_synced(&task.id)?;
                    report.reported += 1;
                }
                Err(e) if e.is_lease_invalid() => {
                    tracing::warn!(task_id = %task.id, error = %e, "Server no longer accepts this result, dropping");
                    self.store.mark_synced(&task.id)?;
                    report.skipped += 1;
                }
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Result sync failed");
                    report.failed += 1;
                }
            }
        }

        if report != SyncReport::default() {
            tracing::info!(
                reported = report.reported,
                skipped = report.skipped,
                failed = report.failed,
                "Result sync complete"
            );
        }
        Ok(report)
    }

    /// Sync immediately, then every interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sync_once().await {
                tracing::warn!(error = %e, "Result sync round failed");
            }
        }

        tracing::debug!("Result syncer stopped");
    }
}
