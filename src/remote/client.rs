use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::error::{AgentError, Result};
use crate::scheduler::task::Task;

/// How far each renewal pushes the lease out.
pub const LEASE_EXTEND_SECS: u64 = 300;

const CODE_ATTEMPT_MISMATCH: i64 = 30001;
const CODE_LEASE_EXPIRED: i64 = 30003;
const CODE_TASK_NOT_FOUND: i64 = 30004;

/// Lifecycle reports for remote-leased tasks.
///
/// Callers treat every call as best-effort: a failure is logged and never
/// changes local task state.
#[async_trait]
pub trait TaskReporter: Send + Sync {
    async fn report_start(&self, task_id: &str, attempt_id: &str) -> Result<()>;

    async fn renew_lease(&self, task_id: &str, attempt_id: &str) -> Result<()>;

    /// Report the terminal result carried by `task` under its attempt ID.
    async fn report_complete(&self, task: &Task) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimData {
    #[serde(default)]
    tasks: Option<Vec<Task>>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    agent_id: &'a str,
    machine_id: &'a str,
    limit: usize,
    request_id: String,
}

#[derive(Debug, Serialize)]
struct AttemptRequest<'a> {
    agent_id: &'a str,
    attempt_id: &'a str,
}

#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    agent_id: &'a str,
    attempt_id: &'a str,
    extend_sec: u64,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    agent_id: &'a str,
    attempt_id: &'a str,
    exit_code: i32,
    stdout: &'a str,
    stderr: &'a str,
    error: &'a str,
}

/// JSON-over-HTTP client for the central server's agent task API.
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: reqwest::Client,
    base_url: String,
    agent_id: String,
    machine_id: String,
    token: String,
}

impl ServerClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            agent_id: config.agent_id.clone(),
            machine_id: config.machine_id.clone(),
            token: config.token.clone(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/agent/tasks/{}", self.base_url, path)
    }

    async fn post<B, T>(&self, task_id: Option<&str>, path: &str, body: &B) -> Result<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut req = self.client.post(self.url(path)).json(body);
        if !self.token.is_empty() {
            req = req.bearer_auth(&self.token);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        let envelope: Envelope<T> = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(AgentError::Server {
                    code: i64::from(status.as_u16()),
                    message: text,
                });
            }
            Err(e) => return Err(e.into()),
        };

        match envelope.code {
            0 => Ok(envelope.data),
            CODE_ATTEMPT_MISMATCH | CODE_LEASE_EXPIRED => Err(AgentError::LeaseInvalid {
                task_id: task_id.unwrap_or_default().to_string(),
                message: envelope.message,
            }),
            CODE_TASK_NOT_FOUND => Err(AgentError::TaskNotFound(
                task_id.unwrap_or_default().to_string(),
            )),
            code => Err(AgentError::Server {
                code,
                message: envelope.message,
            }),
        }
    }

    /// Claim up to `limit` tasks leased to this agent.
    pub async fn claim_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let body = ClaimRequest {
            agent_id: &self.agent_id,
            machine_id: &self.machine_id,
            limit,
            request_id: Uuid::new_v4().to_string(),
        };
        let data: Option<ClaimData> = self.post(None, "claim", &body).await?;
        Ok(data.and_then(|d| d.tasks).unwrap_or_default())
    }
}

#[async_trait]
impl TaskReporter for ServerClient {
    async fn report_start(&self, task_id: &str, attempt_id: &str) -> Result<()> {
        let body = AttemptRequest {
            agent_id: &self.agent_id,
            attempt_id,
        };
        self.post::<_, serde_json::Value>(Some(task_id), &format!("{task_id}/start"), &body)
            .await?;
        Ok(())
    }

    async fn renew_lease(&self, task_id: &str, attempt_id: &str) -> Result<()> {
        let body = RenewRequest {
            agent_id: &self.agent_id,
            attempt_id,
            extend_sec: LEASE_EXTEND_SECS,
        };
        self.post::<_, serde_json::Value>(
            Some(task_id),
            &format!("{task_id}/lease/renew"),
            &body,
        )
        .await?;
        Ok(())
    }

    async fn report_complete(&self, task: &Task) -> Result<()> {
        let body = CompleteRequest {
            agent_id: &self.agent_id,
            attempt_id: &task.attempt_id,
            exit_code: task.exit_code,
            stdout: &task.stdout,
            stderr: &task.stderr,
            error: &task.error,
        };
        self.post::<_, serde_json::Value>(
            Some(&task.id),
            &format!("{}/complete", task.id),
            &body,
        )
        .await?;
        Ok(())
    }
}
