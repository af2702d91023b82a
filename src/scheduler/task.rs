use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Retry delay used when a task does not carry one.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const TERMINAL: [TaskStatus; 3] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind}: {value:?}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "assigned" => Ok(TaskStatus::Assigned),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(ParseEnumError {
                kind: "task status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    Shell,
    Python,
    Script,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Shell => "shell",
            TaskType::Python => "python",
            TaskType::Script => "script",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // Rows written before the type column was populated.
            "" | "shell" => Ok(TaskType::Shell),
            "python" => Ok(TaskType::Python),
            "script" => Ok(TaskType::Script),
            other => Err(ParseEnumError {
                kind: "task type",
                value: other.to_string(),
            }),
        }
    }
}

/// A unit of work, either submitted locally or claimed from the central server.
///
/// The JSON form matches the server's task payload. Unset timestamps are `None`;
/// the server's zero time (`0001-01-01T00:00:00Z`) and `null` collections are
/// accepted on input.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub command: String,
    #[serde(deserialize_with = "null_as_default")]
    pub args: Vec<String>,
    pub workdir: String,
    #[serde(deserialize_with = "null_as_default")]
    pub env: HashMap<String, String>,
    /// Seconds; 0 means the executor default.
    pub timeout: u64,

    /// Lower value runs first.
    pub priority: i32,
    pub retry_count: u32,
    /// Seconds; 0 means the scheduler's configured default.
    pub retry_delay: u64,
    pub max_retries: u32,

    pub status: TaskStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub error: String,

    pub machine_id: String,
    pub group_id: String,
    pub parent_id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub depends_on: Vec<String>,

    pub assigned_agent_id: String,
    pub attempt_id: String,
    #[serde(deserialize_with = "zero_time_as_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[serde(deserialize_with = "zero_time_as_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "zero_time_as_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "zero_time_as_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "zero_time_as_none")]
    pub ended_at: Option<DateTime<Utc>>,

    pub synced: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            ..Default::default()
        }
    }

    /// Remote-leased tasks carry an attempt ID and must be reported upstream.
    pub fn is_remote(&self) -> bool {
        !self.attempt_id.is_empty()
    }

    /// A lease only counts as expired when one was actually granted.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    pub fn should_retry(&self) -> bool {
        self.status == TaskStatus::Failed
            && self.max_retries > 0
            && self.retry_count < self.max_retries
    }

    /// Delay before the next attempt; `default` applies when the task sets none.
    pub fn retry_delay(&self, default: Duration) -> Duration {
        if self.retry_delay == 0 {
            default
        } else {
            Duration::from_secs(self.retry_delay)
        }
    }

    /// Turn a failed attempt into a fresh local pending task.
    ///
    /// The lease belonged to the failed attempt, so the retry is no longer
    /// reportable under it.
    pub fn prepare_retry(&mut self) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
        self.attempt_id.clear();
        self.assigned_agent_id.clear();
        self.lease_expires_at = None;
        self.error.clear();
        self.exit_code = 0;
        self.stdout.clear();
        self.stderr.clear();
        self.started_at = None;
        self.ended_at = None;
        self.synced = false;
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.started_at = Some(at);
        self.ended_at = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.status = TaskStatus::Failed;
        self.error = error.into();
        self.exit_code = -1;
        self.ended_at = Some(at);
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn zero_time_as_none<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<DateTime<Utc>>::deserialize(deserializer)?;
    Ok(value.filter(|t| t.year() > 1))
}
