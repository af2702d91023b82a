use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::remote::TaskReporter;

/// Periodically renews the server lease of a running remote task.
#[derive(Clone)]
pub struct LeaseRenewer {
    reporter: Arc<dyn TaskReporter>,
    interval: Duration,
}

/// Handle to one renewal loop. Renewal continues until [`stop`](Self::stop) is
/// called or the server rejects the lease.
pub struct LeaseGuard {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl LeaseGuard {
    /// Stop renewing and wait for the loop to exit.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Lease renewal loop ended abnormally");
        }
    }
}

impl LeaseRenewer {
    pub fn new(reporter: Arc<dyn TaskReporter>, interval: Duration) -> Self {
        Self { reporter, interval }
    }

    /// Start renewing. The first renewal happens one interval from now.
    pub fn spawn(&self, task_id: String, attempt_id: String) -> LeaseGuard {
        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run(
            self.reporter.clone(),
            self.interval,
            task_id,
            attempt_id,
            token.clone(),
        ));
        LeaseGuard { token, handle }
    }

    async fn run(
        reporter: Arc<dyn TaskReporter>,
        period: Duration,
        task_id: String,
        attempt_id: String,
        token: CancellationToken,
    ) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match reporter.renew_lease(&task_id, &attempt_id).await {
                Ok(()) => tracing::debug!(task_id = %task_id, "Lease renewed"),
                Err(e) if e.is_lease_invalid() => {
                    // Someone else may hold the task now; further renewals are pointless.
                    tracing::warn!(task_id = %task_id, error = %e, "Lease lost, stopping renewal");
                    break;
                }
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Lease renewal failed"),
            }
        }
    }
}
