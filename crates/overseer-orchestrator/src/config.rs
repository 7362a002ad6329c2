use overseer_core::{OverseerError, OverseerResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Construction parameters of the [`Orchestrator`](crate::Orchestrator).
///
/// Every field has a default, so an empty TOML document is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Identifier of the master in the star topology.
    #[serde(default = "default_master_id")]
    pub master_id: String,
    /// Registry capacity.
    #[serde(default = "default_max_agents")]
    pub max_agents: usize,
    /// Period of the health monitor loop.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Heartbeat age after which an agent is presumed unavailable.
    #[serde(default = "default_agent_timeout_ms")]
    pub agent_timeout_ms: u64,
    /// How long a restart probe may go unanswered.
    #[serde(default = "default_restart_ack_timeout_ms")]
    pub restart_ack_timeout_ms: u64,
    /// Restart probes per unavailability episode before eviction.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    /// Consecutive stale health checks before a restart probe (or failure).
    #[serde(default = "default_unavailable_checks")]
    pub unavailable_checks_before_restart: u32,
    /// Per-task deadline. `0` disables task timeouts.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Bound of every per-recipient channel.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Outcomes kept in memory for `recent_outcomes`.
    #[serde(default = "default_outcome_log_capacity")]
    pub outcome_log_capacity: usize,
    /// Events buffered per subscriber before it lags.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Send SHUTDOWN to every registered agent on `stop()`.
    #[serde(default = "default_true")]
    pub notify_agents_on_stop: bool,
    /// Health scoring.
    #[serde(default)]
    pub health: HealthPolicy,
    /// Host process discovery.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

fn default_master_id() -> String {
    "master".to_string()
}
fn default_max_agents() -> usize {
    50
}
fn default_health_check_interval_ms() -> u64 {
    5_000
}
fn default_agent_timeout_ms() -> u64 {
    30_000
}
fn default_restart_ack_timeout_ms() -> u64 {
    10_000
}
fn default_max_restart_attempts() -> u32 {
    1
}
fn default_unavailable_checks() -> u32 {
    3
}
fn default_task_timeout_ms() -> u64 {
    600_000
}
fn default_mailbox_capacity() -> usize {
    256
}
fn default_outcome_log_capacity() -> usize {
    1_000
}
fn default_event_capacity() -> usize {
    1_024
}
fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            master_id: default_master_id(),
            max_agents: default_max_agents(),
            health_check_interval_ms: default_health_check_interval_ms(),
            agent_timeout_ms: default_agent_timeout_ms(),
            restart_ack_timeout_ms: default_restart_ack_timeout_ms(),
            max_restart_attempts: default_max_restart_attempts(),
            unavailable_checks_before_restart: default_unavailable_checks(),
            task_timeout_ms: default_task_timeout_ms(),
            mailbox_capacity: default_mailbox_capacity(),
            outcome_log_capacity: default_outcome_log_capacity(),
            event_capacity: default_event_capacity(),
            notify_agents_on_stop: default_true(),
            health: HealthPolicy::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> OverseerResult<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| OverseerError::Config(format!("invalid orchestrator config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> OverseerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OverseerError::Config(format!("failed to read '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> OverseerResult<()> {
        if self.master_id.trim().is_empty() {
            return Err(OverseerError::Config("master_id must not be empty".into()));
        }
        if self.max_agents == 0 {
            return Err(OverseerError::Config("max_agents must be > 0".into()));
        }
        if self.health_check_interval_ms == 0 {
            return Err(OverseerError::Config(
                "health_check_interval_ms must be > 0".into(),
            ));
        }
        if self.agent_timeout_ms == 0 {
            return Err(OverseerError::Config("agent_timeout_ms must be > 0".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(OverseerError::Config("mailbox_capacity must be > 0".into()));
        }
        if self.event_capacity == 0 {
            return Err(OverseerError::Config("event_capacity must be > 0".into()));
        }
        if self.unavailable_checks_before_restart == 0 {
            return Err(OverseerError::Config(
                "unavailable_checks_before_restart must be > 0".into(),
            ));
        }
        self.health.validate()?;
        regex::Regex::new(&self.discovery.worker_pattern).map_err(|e| {
            OverseerError::Config(format!(
                "invalid discovery.worker_pattern '{}': {e}",
                self.discovery.worker_pattern
            ))
        })?;
        Ok(())
    }

    /// `health_check_interval_ms` as a duration.
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// `agent_timeout_ms` as a duration.
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    /// `restart_ack_timeout_ms` as a duration.
    pub fn restart_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.restart_ack_timeout_ms)
    }

    /// `None` when task timeouts are disabled.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_ms > 0).then(|| Duration::from_millis(self.task_timeout_ms))
    }
}

/// Penalty model used to derive health scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// CPU percentage above which every extra point costs health.
    #[serde(default = "default_cpu_soft_limit")]
    pub cpu_soft_limit: f32,
    /// Health points lost per CPU percent over the soft limit.
    #[serde(default = "default_cpu_penalty")]
    pub cpu_penalty_per_percent: f32,
    /// Memory in megabytes above which health is lost.
    #[serde(default = "default_memory_soft_limit_mb")]
    pub memory_soft_limit_mb: f64,
    /// Size of one memory penalty step in megabytes.
    #[serde(default = "default_memory_step_mb")]
    pub memory_penalty_step_mb: f64,
    /// Health points lost per full step over the memory soft limit.
    #[serde(default = "default_memory_penalty")]
    pub memory_penalty_per_step: f64,
    /// Health points lost per missed heartbeat check.
    #[serde(default = "default_missed_penalty")]
    pub missed_heartbeat_penalty: u32,
    /// Agents scoring below this count as unhealthy in [`SystemStatus`](crate::SystemStatus).
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u8,
}

fn default_cpu_soft_limit() -> f32 {
    80.0
}
fn default_cpu_penalty() -> f32 {
    1.0
}
fn default_memory_soft_limit_mb() -> f64 {
    2_048.0
}
fn default_memory_step_mb() -> f64 {
    256.0
}
fn default_memory_penalty() -> f64 {
    5.0
}
fn default_missed_penalty() -> u32 {
    20
}
fn default_unhealthy_threshold() -> u8 {
    50
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            cpu_soft_limit: default_cpu_soft_limit(),
            cpu_penalty_per_percent: default_cpu_penalty(),
            memory_soft_limit_mb: default_memory_soft_limit_mb(),
            memory_penalty_step_mb: default_memory_step_mb(),
            memory_penalty_per_step: default_memory_penalty(),
            missed_heartbeat_penalty: default_missed_penalty(),
            unhealthy_threshold: default_unhealthy_threshold(),
        }
    }
}

impl HealthPolicy {
    fn validate(&self) -> OverseerResult<()> {
        if self.memory_penalty_step_mb <= 0.0 {
            return Err(OverseerError::Config(
                "health.memory_penalty_step_mb must be > 0".into(),
            ));
        }
        if self.cpu_penalty_per_percent < 0.0 || self.memory_penalty_per_step < 0.0 {
            return Err(OverseerError::Config(
                "health penalties must not be negative".into(),
            ));
        }
        if self.unhealthy_threshold > 100 {
            return Err(OverseerError::Config(
                "health.unhealthy_threshold must be <= 100".into(),
            ));
        }
        Ok(())
    }
}

/// Host process discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run discovery when the orchestrator starts.
    #[serde(default)]
    pub enabled: bool,
    /// Regex matched against each process command line.
    #[serde(default = "default_worker_pattern")]
    pub worker_pattern: String,
    /// Re-scan period. `0` scans once at start.
    #[serde(default)]
    pub interval_ms: u64,
    /// Agent id prefix when the command line carries no `--agent-id`.
    #[serde(default = "default_id_prefix")]
    pub id_prefix: String,
    /// Capabilities assumed when the command line carries no `--capabilities`.
    #[serde(default)]
    pub default_capabilities: Vec<String>,
}

fn default_worker_pattern() -> String {
    r"(^|[/\\\s])overseer-worker(\.exe)?(\s|$)".to_string()
}
fn default_id_prefix() -> String {
    "worker".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            worker_pattern: default_worker_pattern(),
            interval_ms: 0,
            id_prefix: default_id_prefix(),
            default_capabilities: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    /// `None` when discovery runs once.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }
}
