use crate::outcome::TaskOutcome;
use crate::types::AgentStatus;
use serde::Serialize;
use std::collections::BTreeSet;
use tokio::sync::broadcast;
use tracing::trace;

/// Why a task left the assignment map without finishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The owner was marked FAILED and removed.
    AgentEvicted,
    /// The owner left the registry cleanly.
    AgentUnregistered,
    /// The caller withdrew the task.
    Cancelled,
    /// The task outlived the task timeout.
    TimedOut,
}

/// Notable state changes, broadcast to any interested observer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// An agent joined the registry.
    AgentRegistered {
        /// New agent.
        agent_id: String,
        /// Its declared capabilities.
        capabilities: BTreeSet<String>,
    },
    /// An agent left the registry.
    AgentUnregistered {
        /// Removed agent.
        agent_id: String,
        /// Whether the agent was evicted as FAILED.
        failed: bool,
    },
    /// A state machine move.
    AgentStatusChanged {
        /// Agent that moved.
        agent_id: String,
        /// Status before.
        from: AgentStatus,
        /// Status after.
        to: AgentStatus,
    },
    /// A task was claimed by an agent.
    TaskAssigned {
        /// Claimed task.
        task_id: String,
        /// Its new owner.
        agent_id: String,
    },
    /// The task is back in the caller's hands and may be re-offered.
    TaskReleased {
        /// Released task.
        task_id: String,
        /// Its declared type, for re-offering.
        task_type: String,
        /// Agent that held it.
        agent_id: String,
        /// Why it was released.
        reason: ReleaseReason,
    },
    /// A task reached a terminal outcome.
    TaskFinished(TaskOutcome),
}

/// Fan-out of [`OrchestratorEvent`]s.
///
/// Publishing never blocks; slow subscribers lag and lose events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    /// A bus keeping up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.tx.subscribe()
    }

    /// Send to all current subscribers.
    pub fn publish(&self, event: OrchestratorEvent) {
        if self.tx.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    /// Live receivers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(OrchestratorEvent::TaskAssigned {
            task_id: "t-1".into(),
            agent_id: "w-1".into(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        bus.publish(OrchestratorEvent::AgentStatusChanged {
            agent_id: "w-1".into(),
            from: AgentStatus::Ready,
            to: AgentStatus::Busy,
        });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, OrchestratorEvent::AgentStatusChanged { .. }));
    }

    #[test]
    fn test_event_json_shape() {
        let event = OrchestratorEvent::TaskReleased {
            task_id: "t-1".into(),
            task_type: "build".into(),
            agent_id: "w-1".into(),
            reason: ReleaseReason::AgentEvicted,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "task_released");
        assert_eq!(json["reason"], "agent_evicted");
    }
}
