//! Typed views over [`Message`](crate::Message) payloads.
//!
//! The envelope keeps the payload as raw JSON so that unknown fields from
//! newer workers pass through untouched; these structs are what the master
//! actually reads.

use crate::task::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Role of a participant in the star topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// The single coordinating process. Never stored in the registry.
    Master,
    /// A plain worker.
    #[default]
    Slave,
    /// A worker allowed to sub-delegate.
    Coordinator,
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentRole::Master => write!(f, "master"),
            AgentRole::Slave => write!(f, "slave"),
            AgentRole::Coordinator => write!(f, "coordinator"),
        }
    }
}

impl std::str::FromStr for AgentRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "master" => Ok(AgentRole::Master),
            "slave" | "worker" => Ok(AgentRole::Slave),
            "coordinator" => Ok(AgentRole::Coordinator),
            other => Err(format!("unknown agent role '{other}'")),
        }
    }
}

/// Host process facts about a worker, for diagnostics and safe-kill checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Operating system process id.
    pub pid: u32,
    /// Full command line, arguments joined by spaces.
    pub command_line: String,
    /// Process start, when the host reports it.
    pub start_time: Option<DateTime<Utc>>,
}

/// `REGISTER` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Task types the agent accepts.
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    /// Defaults to [`AgentRole::Slave`].
    #[serde(default)]
    pub role: AgentRole,
    /// Set by workers that know their own process facts.
    #[serde(default)]
    pub process_info: Option<ProcessInfo>,
}

/// `HEARTBEAT` payload. Resource numbers are optional; a bare heartbeat only
/// proves liveness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// CPU usage in percent of one core.
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    /// Resident memory in megabytes.
    #[serde(default)]
    pub memory_mb: Option<f64>,
}

/// `HEALTH_REPORT` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthReportPayload {
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in megabytes.
    pub memory_mb: f64,
}

/// `TASK_STATUS_UPDATE` payload, in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusPayload {
    /// Task the update is about.
    pub task_id: String,
    /// Reported state.
    pub status: TaskState,
    /// Fraction complete in `[0, 1]`, for `running` updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    /// Failure description, for `failed` updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Free-form worker report (decisions, learnings) kept in the outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl TaskStatusPayload {
    /// A bare status update.
    pub fn new(task_id: impl Into<String>, status: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            progress: None,
            error: None,
            result: None,
        }
    }

    /// A `completed` update carrying the worker's result.
    pub fn completed(task_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(task_id, TaskState::Completed)
        }
    }

    /// A `failed` update carrying an error description.
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(task_id, TaskState::Failed)
        }
    }
}

/// `SHUTDOWN` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShutdownPayload {
    /// Why the agent is being stopped.
    #[serde(default)]
    pub reason: Option<String>,
}

/// `ERROR` payload. `fatal` marks an unrecoverable report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable description.
    pub message: String,
    /// The sender cannot continue.
    #[serde(default)]
    pub fatal: bool,
}
