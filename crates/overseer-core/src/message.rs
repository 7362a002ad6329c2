use crate::error::{OverseerError, OverseerResult};
use crate::payload::{ErrorPayload, HeartbeatPayload, ShutdownPayload, TaskStatusPayload};
use crate::task::TaskDescriptor;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a [`Message`]; determines the payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent announces itself and its capabilities.
    Register,
    /// Agent leaves cleanly.
    Unregister,
    /// Liveness signal, optionally with resource numbers.
    Heartbeat,
    /// Full resource report.
    HealthReport,
    /// Master hands a task to an agent.
    TaskAssignment,
    /// Progress or completion of a task, in either direction.
    TaskStatusUpdate,
    /// Master asks an agent to exit.
    Shutdown,
    /// Error report; fatal ones end the sender's membership.
    Error,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageType::Register => "REGISTER",
            MessageType::Unregister => "UNREGISTER",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::HealthReport => "HEALTH_REPORT",
            MessageType::TaskAssignment => "TASK_ASSIGNMENT",
            MessageType::TaskStatusUpdate => "TASK_STATUS_UPDATE",
            MessageType::Shutdown => "SHUTDOWN",
            MessageType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Envelope for all master/worker traffic.
///
/// Messages are consumed exactly once by the router and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, used only for log correlation.
    pub id: Uuid,
    /// Serialized under the `type` key.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Agent or master that sent the message.
    pub sender_id: String,
    /// Agent or master the message is for.
    pub recipient_id: String,
    /// Shape depends on `message_type`.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message with the given raw payload.
    pub fn new(
        message_type: MessageType,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type,
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Creates a message whose payload is the JSON form of `payload`.
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: &T,
    ) -> OverseerResult<Self> {
        Ok(Self::new(
            message_type,
            sender_id,
            recipient_id,
            serde_json::to_value(payload)?,
        ))
    }

    /// Parses the payload as `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> OverseerResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            OverseerError::Payload(format!(
                "{} from '{}': {e}",
                self.message_type, self.sender_id
            ))
        })
    }

    /// `TASK_ASSIGNMENT` from the master to an agent.
    pub fn task_assignment(
        master_id: impl Into<String>,
        agent_id: impl Into<String>,
        task: &TaskDescriptor,
    ) -> OverseerResult<Self> {
        Self::with_payload(MessageType::TaskAssignment, master_id, agent_id, task)
    }

    /// `TASK_STATUS_UPDATE` in either direction.
    pub fn task_status(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        status: &TaskStatusPayload,
    ) -> OverseerResult<Self> {
        Self::with_payload(MessageType::TaskStatusUpdate, sender_id, recipient_id, status)
    }

    /// A bare `HEARTBEAT`. Sent by the master it doubles as a wake-up probe.
    pub fn heartbeat(sender_id: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self::new(
            MessageType::Heartbeat,
            sender_id,
            recipient_id,
            serde_json::json!({}),
        )
    }

    /// A `HEARTBEAT` carrying resource numbers.
    pub fn heartbeat_with_usage(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        cpu_percent: f32,
        memory_mb: f64,
    ) -> OverseerResult<Self> {
        let payload = HeartbeatPayload {
            cpu_percent: Some(cpu_percent),
            memory_mb: Some(memory_mb),
        };
        Self::with_payload(MessageType::Heartbeat, sender_id, recipient_id, &payload)
    }

    /// `SHUTDOWN` from the master.
    pub fn shutdown(
        master_id: impl Into<String>,
        agent_id: impl Into<String>,
        reason: Option<String>,
    ) -> OverseerResult<Self> {
        Self::with_payload(
            MessageType::Shutdown,
            master_id,
            agent_id,
            &ShutdownPayload { reason },
        )
    }

    /// `ERROR` report.
    pub fn error(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message: impl Into<String>,
        fatal: bool,
    ) -> OverseerResult<Self> {
        let payload = ErrorPayload {
            message: message.into(),
            fatal,
        };
        Self::with_payload(MessageType::Error, sender_id, recipient_id, &payload)
    }
}
