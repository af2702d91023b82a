use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::scheduler::task::DEFAULT_RETRY_DELAY_SECS;

/// Files tried, in order, when no config path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["agent.toml", "/etc/fleet-agent/agent.toml"];

/// Dispatch and retry timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Fallback dispatch tick in case a queue signal is missed.
    pub tick_interval_ms: u64,
    pub lease_renew_interval_secs: u64,
    /// Retry delay for tasks that do not set one.
    pub default_retry_delay_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            lease_renew_interval_secs: 60,
            default_retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_secs(self.lease_renew_interval_secs.max(1))
    }

    pub fn default_retry_delay(&self) -> Duration {
        Duration::from_secs(self.default_retry_delay_secs)
    }
}

/// Central server connection. Remote features stay off unless `url`,
/// `agent_id` and `machine_id` are all set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub agent_id: String,
    pub machine_id: String,
    /// Bearer token; sent only when non-empty.
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            agent_id: String::new(),
            machine_id: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            batch_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Per-stream capture limit in bytes.
    pub max_output_size: usize,
    pub default_timeout_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_output_size: 1 << 20,
            default_timeout_secs: 3600,
        }
    }
}

/// Command validation rules. Both lists empty disables validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub allowed_commands: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub db_path: PathBuf,
    pub max_workers: usize,
    pub scheduler: SchedulerConfig,
    pub server: ServerConfig,
    pub poll: PollConfig,
    pub sync: SyncConfig,
    pub limits: LimitsConfig,
    pub security: SecurityConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/fleet-agent/tasks.db"),
            max_workers: 4,
            scheduler: SchedulerConfig::default(),
            server: ServerConfig::default(),
            poll: PollConfig::default(),
            sync: SyncConfig::default(),
            limits: LimitsConfig::default(),
            security: SecurityConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load from `path`, or from the first default location that exists, then
    /// apply environment overrides. Missing default files are not an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => Some(path.to_path_buf()),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.is_file()),
        };

        let mut config = match file {
            Some(file) => {
                let text = std::fs::read_to_string(&file).map_err(|e| {
                    AgentError::Config(format!("failed to read {}: {e}", file.display()))
                })?;
                tracing::info!(path = %file.display(), "Loaded config file");
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Override fields from `AGENT_DB_PATH`, `AGENT_MAX_WORKERS`, `SERVER_URL`,
    /// `AGENT_ID`, `MACHINE_ID` and `AGENT_TOKEN`. Empty values are ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("AGENT_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("AGENT_MAX_WORKERS") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => self.max_workers = n,
                _ => tracing::warn!(value = %v, "Ignoring invalid AGENT_MAX_WORKERS"),
            }
        }
        if let Some(v) = get("SERVER_URL") {
            self.server.url = v;
        }
        if let Some(v) = get("AGENT_ID") {
            self.server.agent_id = v;
        }
        if let Some(v) = get("MACHINE_ID") {
            self.server.machine_id = v;
        }
        if let Some(v) = get("AGENT_TOKEN") {
            self.server.token = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(AgentError::Config("max_workers must be at least 1".into()));
        }
        if self.poll.batch_size == 0 {
            return Err(AgentError::Config("poll.batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn server_configured(&self) -> bool {
        !self.server.url.is_empty()
            && !self.server.agent_id.is_empty()
            && !self.server.machine_id.is_empty()
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }
}
