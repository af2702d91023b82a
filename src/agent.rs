use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::Result;
use crate::remote::{ResultSyncer, ServerClient, TaskPoller, TaskReporter};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::worker::{CommandValidator, TaskExecutor};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Wires the store, executor, scheduler and (when a server is configured) the
/// claim poller and result syncer together.
pub struct Agent {
    config: AgentConfig,
    scheduler: Scheduler,
    client: Option<Arc<ServerClient>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let store = Arc::new(TaskStore::open(&config.db_path)?);

        let executor = TaskExecutor::new(config.max_workers)
            .with_max_output_size(config.limits.max_output_size)
            .with_default_timeout(Duration::from_secs(config.limits.default_timeout_secs))
            .with_validator(CommandValidator::new(
                config.security.allowed_commands.clone(),
                config.security.blocked_patterns.clone(),
            ));

        let client = if config.server_configured() {
            Some(Arc::new(ServerClient::new(&config.server)?))
        } else {
            tracing::info!("No server configured, running in local-only mode");
            None
        };
        let reporter = client
            .clone()
            .map(|c| c as Arc<dyn TaskReporter>);

        let scheduler = Scheduler::new(store, executor, config.scheduler.clone(), reporter);

        Ok(Self {
            config,
            scheduler,
            client,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Run until `shutdown` is cancelled, then drain and close the store.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let report = self.scheduler.start().await?;
        tracing::info!(
            db_path = %self.config.db_path.display(),
            max_workers = self.config.max_workers,
            remote = self.client.is_some(),
            requeued = report.requeued,
            "Agent started"
        );

        let background = shutdown.child_token();
        let mut handles = Vec::new();

        if let Some(client) = &self.client {
            let poller = TaskPoller::new(
                client.clone(),
                self.scheduler.clone(),
                Duration::from_secs(self.config.poll.interval_secs.max(1)),
                self.config.poll.batch_size,
            );
            handles.push(tokio::spawn(poller.run(background.clone())));

            let syncer = ResultSyncer::new(
                self.scheduler.store().clone(),
                client.clone(),
                Duration::from_secs(self.config.sync.interval_secs.max(1)),
            );
            handles.push(tokio::spawn(syncer.run(background.clone())));
        }

        let mut status_ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = status_ticker.tick() => {
                    let status = self.scheduler.queue_status();
                    tracing::info!(
                        pending = status.pending,
                        running = status.running,
                        capacity = status.capacity,
                        "Queue status"
                    );
                }
            }
        }

        background.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Background loop ended abnormally");
            }
        }
        self.scheduler.shutdown().await;
        tracing::info!("Agent stopped");
        Ok(())
    }
}
