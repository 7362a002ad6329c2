use chrono::{DateTime, Utc};
use overseer_core::{AgentRole, ProcessInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Lifecycle state of a registered agent.
///
/// ```text
/// Ready ──assign──▶ Busy ──completed/failed──▶ Ready
///   │                │
///   └──timeout──▶ Unavailable ◀──timeout──┘
///                    │   ▲ heartbeat (recovery)
///                    ▼
///                  Failed (terminal, record removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    /// Idle and eligible for assignment.
    Ready,
    /// Holding exactly one task.
    Busy,
    /// Heartbeat is stale; not eligible, restart may be attempted.
    Unavailable,
    /// Given up on. Terminal for this record.
    Failed,
}

impl AgentStatus {
    /// The transition table. Self-transitions are not transitions.
    pub fn can_transition_to(self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, next),
            (Ready, Busy)
                | (Ready, Unavailable)
                | (Ready, Failed)
                | (Busy, Ready)
                | (Busy, Unavailable)
                | (Busy, Failed)
                | (Unavailable, Ready)
                | (Unavailable, Busy)
                | (Unavailable, Failed)
        )
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        self == AgentStatus::Failed
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Ready => write!(f, "READY"),
            AgentStatus::Busy => write!(f, "BUSY"),
            AgentStatus::Unavailable => write!(f, "UNAVAILABLE"),
            AgentStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Rejected state machine move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid agent status transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Status the record stayed in.
    pub from: AgentStatus,
    /// Status that was refused.
    pub to: AgentStatus,
}

/// Point-in-time gauges plus monotonic task counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Last reported CPU usage, percent of one core.
    pub cpu_percent: f32,
    /// Last reported resident memory in megabytes.
    pub memory_mb: f64,
    /// Tasks this agent finished successfully.
    pub tasks_completed: u64,
    /// Tasks that failed or timed out on this agent.
    pub tasks_failed: u64,
}

/// In-memory representation of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique, immutable agent id.
    pub id: String,
    /// Never [`AgentRole::Master`] for a stored record.
    pub role: AgentRole,
    /// Task types the agent accepts, fixed at registration.
    pub capabilities: BTreeSet<String>,
    /// Current state machine position.
    pub status: AgentStatus,
    /// Derived by the health monitor, `0..=100`.
    pub health_score: u8,
    /// The one task this agent holds, if any.
    pub current_task: Option<String>,
    /// Gauges and task counters.
    pub resource_usage: ResourceUsage,
    /// Time of the last inbound message from this agent.
    pub last_heartbeat: DateTime<Utc>,
    /// Host process facts, for discovered or self-describing workers.
    pub process_info: Option<ProcessInfo>,
    /// When the record entered the registry.
    pub registered_at: DateTime<Utc>,
    /// When the agent last became idle; the balancer prefers the oldest.
    pub idle_since: DateTime<Utc>,
    /// Consecutive health checks that found the heartbeat stale.
    pub missed_heartbeats: u32,
    /// Start of the current unavailability episode.
    pub unavailable_since: Option<DateTime<Utc>>,
    /// Restart probes sent during the current unavailability episode.
    pub restart_attempts: u32,
    /// When the latest restart probe went out.
    pub restart_sent_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    /// A fresh, healthy, idle slave.
    pub fn new<I, S>(id: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            id: id.into(),
            role: AgentRole::Slave,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Ready,
            health_score: 100,
            current_task: None,
            resource_usage: ResourceUsage::default(),
            last_heartbeat: now,
            process_info: None,
            registered_at: now,
            idle_since: now,
            missed_heartbeats: 0,
            unavailable_since: None,
            restart_attempts: 0,
            restart_sent_at: None,
        }
    }

    /// Sets the declared role.
    pub fn with_role(mut self, role: AgentRole) -> Self {
        self.role = role;
        self
    }

    /// Attaches host process facts.
    pub fn with_process_info(mut self, info: ProcessInfo) -> Self {
        self.process_info = Some(info);
        self
    }

    /// Whether the agent declared `task_type` as a capability.
    pub fn can_handle(&self, task_type: &str) -> bool {
        self.capabilities.contains(task_type)
    }

    /// Moves to `next` if the transition table allows it.
    pub fn transition(&mut self, next: AgentStatus) -> Result<AgentStatus, InvalidTransition> {
        let from = self.status;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.status = next;
        Ok(from)
    }

    /// Clears every liveness counter after proof of life.
    pub(crate) fn reset_liveness(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat = now;
        self.missed_heartbeats = 0;
        self.unavailable_since = None;
        self.restart_attempts = 0;
        self.restart_sent_at = None;
    }
}

/// A status move that happened, for events and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    /// Agent that moved.
    pub agent_id: String,
    /// Status before the move.
    pub from: AgentStatus,
    /// Status after the move.
    pub to: AgentStatus,
}

/// Aggregate view for dashboards and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Registered agents.
    pub total_agents: usize,
    /// Agents in READY.
    pub ready_agents: usize,
    /// Agents in BUSY.
    pub busy_agents: usize,
    /// Unavailable, or below the configured health threshold.
    pub unhealthy_agents: usize,
    /// Agents evicted as FAILED since the orchestrator started.
    pub failed_agents: u64,
    /// Entries in the task assignment map.
    pub active_task_count: usize,
    /// Mean health score of registered agents, 0 when there are none.
    pub system_health: u8,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const ALL: [AgentStatus; 4] = [
        AgentStatus::Ready,
        AgentStatus::Busy,
        AgentStatus::Unavailable,
        AgentStatus::Failed,
    ];

    #[test]
    fn test_failed_is_terminal() {
        for next in ALL {
            assert!(!AgentStatus::Failed.can_transition_to(next));
        }
        assert!(AgentStatus::Failed.is_terminal());
    }

    #[test]
    fn test_every_live_state_can_fail() {
        assert!(AgentStatus::Ready.can_transition_to(AgentStatus::Failed));
        assert!(AgentStatus::Busy.can_transition_to(AgentStatus::Failed));
        assert!(AgentStatus::Unavailable.can_transition_to(AgentStatus::Failed));
    }

    #[test]
    fn test_no_self_transitions() {
        for s in ALL {
            assert!(!s.can_transition_to(s));
        }
    }

    #[test]
    fn test_record_defaults() {
        let agent = AgentRecord::new("w-1", ["build", "test"]);
        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.health_score, 100);
        assert_eq!(agent.role, AgentRole::Slave);
        assert!(agent.can_handle("build"));
        assert!(!agent.can_handle("deploy"));
        assert!(agent.current_task.is_none());
    }

    #[test]
    fn test_transition_rejects_illegal_move() {
        let mut agent = AgentRecord::new("w-1", ["build"]);
        agent.transition(AgentStatus::Unavailable).unwrap();
        agent.transition(AgentStatus::Failed).unwrap();
        let err = agent.transition(AgentStatus::Ready).unwrap_err();
        assert_eq!(err.from, AgentStatus::Failed);
        assert_eq!(agent.status, AgentStatus::Failed);
        assert_eq!(err.to_string(), "invalid agent status transition FAILED -> READY");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&AgentStatus::Unavailable).unwrap();
        assert_eq!(json, "\"UNAVAILABLE\"");
    }
}
