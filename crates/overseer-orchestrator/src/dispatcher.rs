use crate::balancer::LoadBalancer;
use crate::events::{EventBus, OrchestratorEvent, ReleaseReason};
use crate::outcome::{OutcomeSink, OutcomeStatus, TaskOutcome};
use crate::registry::{AgentRegistry, Claim, Removal, Tally};
use crate::router::MessageRouter;
use crate::types::{AgentStatus, StatusChange};
use chrono::{DateTime, Utc};
use overseer_core::{Message, TaskDescriptor, TaskState, TaskStatusPayload};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What a `TASK_STATUS_UPDATE` did.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDisposition {
    /// `running` from the owner; nothing changed.
    Progress,
    /// The task finished and its agent is free again.
    Released(TaskOutcome),
    /// Unknown task, or a sender that does not own it. Dropped.
    Stale,
}

/// Matches tasks to agents and tracks them until they finish.
///
/// Reactive: a task that finds no capacity is returned to the caller, and
/// released tasks are announced on the event bus for the caller to re-offer.
pub struct TaskDispatcher {
    master_id: String,
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    events: EventBus,
    sinks: RwLock<Vec<Arc<dyn OutcomeSink>>>,
}

impl TaskDispatcher {
    /// A dispatcher sending as `master_id`.
    pub fn new(
        master_id: impl Into<String>,
        registry: Arc<AgentRegistry>,
        router: Arc<MessageRouter>,
        events: EventBus,
    ) -> Self {
        Self {
            master_id: master_id.into(),
            registry,
            router,
            events,
            sinks: RwLock::new(Vec::new()),
        }
    }

    /// Register a destination for finished task records.
    pub fn add_sink(&self, sink: Arc<dyn OutcomeSink>) {
        self.sinks.write().push(sink);
    }

    /// Tasks currently assigned.
    pub fn in_flight(&self) -> usize {
        self.registry.active_task_count()
    }

    /// Offer a task. Returns the chosen agent, or `None` when no READY
    /// agent declares the task type (or the task is already in flight).
    pub fn assign(&self, task: TaskDescriptor) -> Option<String> {
        self.assign_at(task, Utc::now())
    }

    /// [`assign`](Self::assign) with an explicit clock.
    pub fn assign_at(&self, task: TaskDescriptor, now: DateTime<Utc>) -> Option<String> {
        let claim = self.registry.assign_with(&task, now, |candidates| {
            LoadBalancer::select(candidates).map(|a| a.id.clone())
        });

        let agent_id = match claim {
            Claim::Assigned(agent_id) => agent_id,
            Claim::NoCapacity => {
                debug!(task_id = %task.id, task_type = %task.task_type, "No capacity for task");
                return None;
            }
            Claim::AlreadyAssigned(owner) => {
                warn!(task_id = %task.id, agent_id = %owner, "Task is already assigned");
                return None;
            }
        };

        info!(task_id = %task.id, task_type = %task.task_type, agent_id = %agent_id, "Task assigned");
        self.events.publish(OrchestratorEvent::AgentStatusChanged {
            agent_id: agent_id.clone(),
            from: AgentStatus::Ready,
            to: AgentStatus::Busy,
        });
        self.events.publish(OrchestratorEvent::TaskAssigned {
            task_id: task.id.clone(),
            agent_id: agent_id.clone(),
        });

        // An undelivered assignment stays claimed until the task timeout reclaims it.
        match Message::task_assignment(&self.master_id, &agent_id, &task) {
            Ok(message) => {
                let delivery = self.router.send(message);
                if !delivery.is_delivered() {
                    warn!(task_id = %task.id, agent_id = %agent_id, ?delivery, "Assignment not delivered");
                }
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Failed to encode task assignment");
            }
        }
        Some(agent_id)
    }

    /// Apply a worker's status report.
    pub fn handle_status_update(&self, sender: &str, update: TaskStatusPayload) -> UpdateDisposition {
        self.handle_status_update_at(sender, update, Utc::now())
    }

    /// [`handle_status_update`](Self::handle_status_update) with an explicit clock.
    pub fn handle_status_update_at(
        &self,
        sender: &str,
        update: TaskStatusPayload,
        now: DateTime<Utc>,
    ) -> UpdateDisposition {
        let (status, tally) = match update.status {
            TaskState::Running => {
                if self.registry.owner_of(&update.task_id).as_deref() == Some(sender) {
                    debug!(task_id = %update.task_id, agent_id = %sender, progress = ?update.progress, "Task progress");
                    return UpdateDisposition::Progress;
                }
                warn!(task_id = %update.task_id, agent_id = %sender, "Progress for a task the sender does not own");
                return UpdateDisposition::Stale;
            }
            TaskState::Completed => (OutcomeStatus::Completed, Tally::Completed),
            TaskState::Failed => (OutcomeStatus::Failed, Tally::Failed),
            TaskState::Cancelled => (OutcomeStatus::Cancelled, Tally::Neither),
        };

        let released = match self
            .registry
            .release_task(&update.task_id, Some(sender), tally, now)
        {
            Ok(released) => released,
            Err(e) => {
                warn!(agent_id = %sender, status = %update.status, error = %e, "Dropping stale task update");
                return UpdateDisposition::Stale;
            }
        };

        let outcome = TaskOutcome::from_assignment(&released.assignment, status, now)
            .with_error(update.error)
            .with_result(update.result);
        info!(
            task_id = %outcome.task_id,
            agent_id = %outcome.agent_id,
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "Task finished"
        );
        self.publish_change(released.change);
        self.finish(&outcome);
        UpdateDisposition::Released(outcome)
    }

    /// Withdraw an in-flight task. The agent is told with a `cancelled`
    /// status update; anything it reports afterwards for this task is stale.
    pub fn cancel(&self, task_id: &str, reason: Option<String>) -> bool {
        self.withdraw(task_id, reason, OutcomeStatus::Cancelled, Utc::now())
            .is_some()
    }

    pub(crate) fn withdraw(
        &self,
        task_id: &str,
        reason: Option<String>,
        status: OutcomeStatus,
        now: DateTime<Utc>,
    ) -> Option<TaskOutcome> {
        let tally = if status == OutcomeStatus::TimedOut {
            Tally::Failed
        } else {
            Tally::Neither
        };
        let released = match self.registry.release_task(task_id, None, tally, now) {
            Ok(released) => released,
            Err(e) => {
                debug!(task_id = %task_id, error = %e, "Nothing to withdraw");
                return None;
            }
        };
        let agent_id = released.assignment.agent_id.clone();

        let mut notice = TaskStatusPayload::new(task_id, TaskState::Cancelled);
        notice.error = reason.clone();
        match Message::task_status(&self.master_id, &agent_id, &notice) {
            Ok(message) => {
                self.router.send(message);
            }
            Err(e) => error!(task_id = %task_id, error = %e, "Failed to encode cancellation"),
        }

        let release_reason = if status == OutcomeStatus::TimedOut {
            ReleaseReason::TimedOut
        } else {
            ReleaseReason::Cancelled
        };
        info!(task_id = %task_id, agent_id = %agent_id, reason = ?release_reason, "Task withdrawn");

        self.events.publish(OrchestratorEvent::TaskReleased {
            task_id: task_id.to_string(),
            task_type: released.assignment.task.task_type.clone(),
            agent_id,
            reason: release_reason,
        });
        self.publish_change(released.change);

        let outcome = TaskOutcome::from_assignment(&released.assignment, status, now).with_error(reason);
        self.finish(&outcome);
        Some(outcome)
    }

    /// Close out the task held by an agent that left the registry.
    pub fn release_orphaned(
        &self,
        removal: &Removal,
        reason: ReleaseReason,
        now: DateTime<Utc>,
    ) -> Option<TaskOutcome> {
        let assignment = removal.released.as_ref()?;
        warn!(
            task_id = %assignment.task.id,
            agent_id = %assignment.agent_id,
            reason = ?reason,
            "Task released by departing agent"
        );
        self.events.publish(OrchestratorEvent::TaskReleased {
            task_id: assignment.task.id.clone(),
            task_type: assignment.task.task_type.clone(),
            agent_id: assignment.agent_id.clone(),
            reason,
        });
        let outcome = TaskOutcome::from_assignment(assignment, OutcomeStatus::Orphaned, now);
        self.finish(&outcome);
        Some(outcome)
    }

    fn publish_change(&self, change: Option<StatusChange>) {
        if let Some(change) = change {
            self.events.publish(OrchestratorEvent::AgentStatusChanged {
                agent_id: change.agent_id,
                from: change.from,
                to: change.to,
            });
        }
    }

    fn finish(&self, outcome: &TaskOutcome) {
        let sinks: Vec<Arc<dyn OutcomeSink>> = self.sinks.read().clone();
        for sink in sinks {
            if let Err(e) = sink.record(outcome) {
                error!(sink = sink.name(), task_id = %outcome.task_id, error = %e, "Outcome sink failed");
            }
        }
        self.events
            .publish(OrchestratorEvent::TaskFinished(outcome.clone()));
    }
}
