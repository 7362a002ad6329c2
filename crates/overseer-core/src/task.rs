use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work handed to a worker inside a `TASK_ASSIGNMENT` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Caller-chosen task identifier, unique among in-flight tasks.
    pub id: String,
    /// Declared task type, matched against agent capabilities.
    pub task_type: String,
    /// Arbitrary parameters forwarded verbatim to the worker.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// When the task was first offered to the master.
    #[serde(default = "Utc::now")]
    pub submitted_at: DateTime<Utc>,
}

impl TaskDescriptor {
    /// Creates a task with a random id and no parameters.
    pub fn new(task_type: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), task_type)
    }

    /// Creates a task with an explicit id.
    pub fn with_id(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            parameters: serde_json::Value::Null,
            submitted_at: Utc::now(),
        }
    }

    /// Attaches worker parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Task status carried by `TASK_STATUS_UPDATE` messages.
///
/// Workers report `Running`, `Completed` and `Failed`. The master sends
/// `Cancelled` to an agent whose task it has withdrawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Still in progress.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Withdrawn by the master.
    Cancelled,
}

impl TaskState {
    /// Whether this state ends the agent's ownership of the task.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskState::Running => write!(f, "running"),
            TaskState::Completed => write!(f, "completed"),
            TaskState::Failed => write!(f, "failed"),
            TaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}
