use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Lease no longer held for task {task_id}: {message}")]
    LeaseInvalid { task_id: String, message: String },

    #[error("Invalid task: {0}")]
    InvalidTask(String),

    #[error("Task already running: {0}")]
    AlreadyRunning(String),

    #[error("Command rejected: {0}")]
    CommandRejected(String),

    #[error("Execution pool is closed")]
    PoolClosed,

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Store is closed")]
    StoreClosed,

    #[error("Task store {0} is in use by another agent process")]
    StoreLocked(String),

    #[error("Invalid record for task {task_id}: {message}")]
    InvalidRecord { task_id: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server rejected request (code {code}): {message}")]
    Server { code: i64, message: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// True when the central server no longer recognises this agent's attempt.
    pub fn is_lease_invalid(&self) -> bool {
        matches!(self, AgentError::LeaseInvalid { .. })
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
