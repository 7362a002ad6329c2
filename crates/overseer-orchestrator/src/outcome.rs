use crate::registry::Assignment;
use chrono::{DateTime, Utc};
use overseer_core::OverseerResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How a task left the assignment map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// The agent reported success.
    Completed,
    /// The agent reported failure.
    Failed,
    /// Withdrawn by the master.
    Cancelled,
    /// Exceeded the task timeout.
    TimedOut,
    /// The owning agent was evicted or unregistered.
    Orphaned,
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutcomeStatus::Completed => write!(f, "completed"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::Cancelled => write!(f, "cancelled"),
            OutcomeStatus::TimedOut => write!(f, "timed_out"),
            OutcomeStatus::Orphaned => write!(f, "orphaned"),
        }
    }
}

/// Final record of one task assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Finished task.
    pub task_id: String,
    /// Its declared type.
    pub task_type: String,
    /// Agent that held it last.
    pub agent_id: String,
    /// How it ended.
    pub status: OutcomeStatus,
    /// Failure or release description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Worker report for completed tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// When the task was claimed.
    pub assigned_at: DateTime<Utc>,
    /// When it left the assignment map.
    pub finished_at: DateTime<Utc>,
    /// `finished_at - assigned_at`, never negative.
    pub duration_ms: u64,
}

impl TaskOutcome {
    /// Build an outcome for an assignment that ended at `finished_at`.
    pub fn from_assignment(
        assignment: &Assignment,
        status: OutcomeStatus,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = u64::try_from(
            (finished_at - assignment.assigned_at)
                .num_milliseconds()
                .max(0),
        )
        .unwrap_or(0);
        Self {
            task_id: assignment.task.id.clone(),
            task_type: assignment.task.task_type.clone(),
            agent_id: assignment.agent_id.clone(),
            status,
            error: None,
            result: None,
            assigned_at: assignment.assigned_at,
            finished_at,
            duration_ms,
        }
    }

    /// Sets the error text.
    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    /// Sets the worker report.
    pub fn with_result(mut self, result: Option<serde_json::Value>) -> Self {
        self.result = result;
        self
    }
}

/// Destination for finished task records (database, file, queue...).
///
/// Errors are logged by the caller and never reach the orchestrator core.
pub trait OutcomeSink: Send + Sync {
    /// Label used in logs.
    fn name(&self) -> &str;
    /// Store one outcome.
    fn record(&self, outcome: &TaskOutcome) -> OverseerResult<()>;
}

/// Bounded in-memory ring of recent outcomes.
pub struct OutcomeLog {
    capacity: usize,
    entries: Mutex<VecDeque<TaskOutcome>>,
}

impl OutcomeLog {
    /// A log keeping the last `capacity` outcomes. Zero keeps nothing.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    /// Up to `n` most recent outcomes, newest first.
    pub fn recent(&self, n: usize) -> Vec<TaskOutcome> {
        self.entries.lock().iter().rev().take(n).cloned().collect()
    }

    /// Outcomes currently held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutcomeSink for OutcomeLog {
    fn name(&self) -> &str {
        "outcome_log"
    }

    fn record(&self, outcome: &TaskOutcome) -> OverseerResult<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(outcome.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use overseer_core::TaskDescriptor;

    fn assignment(task_id: &str) -> Assignment {
        Assignment {
            agent_id: "w-1".into(),
            task: TaskDescriptor::with_id(task_id, "build"),
            assigned_at: Utc::now() - chrono::Duration::milliseconds(1500),
        }
    }

    #[test]
    fn test_outcome_duration() {
        let a = assignment("t-1");
        let outcome = TaskOutcome::from_assignment(&a, OutcomeStatus::Completed, Utc::now());
        assert!(outcome.duration_ms >= 1500);
        assert_eq!(outcome.task_type, "build");
        assert_eq!(outcome.agent_id, "w-1");
    }

    #[test]
    fn test_log_is_bounded() {
        let log = OutcomeLog::new(2);
        for id in ["t-1", "t-2", "t-3"] {
            let outcome =
                TaskOutcome::from_assignment(&assignment(id), OutcomeStatus::Failed, Utc::now());
            log.record(&outcome).unwrap();
        }
        assert_eq!(log.len(), 2);
        let recent = log.recent(10);
        assert_eq!(recent[0].task_id, "t-3");
        assert_eq!(recent[1].task_id, "t-2");
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome =
            TaskOutcome::from_assignment(&assignment("t-9"), OutcomeStatus::TimedOut, Utc::now());
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "timed_out");
        assert!(json.get("error").is_none());
    }
}
