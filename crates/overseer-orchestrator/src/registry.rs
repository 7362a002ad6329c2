use crate::types::{AgentRecord, AgentStatus, StatusChange, SystemStatus};
use chrono::{DateTime, Utc};
use overseer_core::{AgentRole, TaskDescriptor};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a registration was refused. Never fatal to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The id is taken; the existing record is kept.
    #[error("agent '{0}' is already registered")]
    Duplicate(String),
    /// `max_agents` records are already stored.
    #[error("registry is at capacity ({0} agents)")]
    AtCapacity(usize),
    /// Blank or whitespace-only id.
    #[error("agent id must not be empty")]
    EmptyId,
    /// Only the orchestrator itself is the master.
    #[error("agent '{0}' cannot register with the master role")]
    MasterRole(String),
    /// The id belongs to the master.
    #[error("agent id '{0}' is reserved for the master")]
    ReservedId(String),
}

/// Why a task could not be released.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReleaseError {
    /// No assignment entry for the task.
    #[error("task '{0}' is not assigned")]
    UnknownTask(String),
    /// Someone other than the owner tried to release it.
    #[error("task '{task_id}' is owned by '{owner}', not '{claimed_by}'")]
    NotOwner {
        /// Task in question.
        task_id: String,
        /// Agent holding it.
        owner: String,
        /// Agent that claimed it.
        claimed_by: String,
    },
}

/// Entry of the task assignment map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    /// Owner of the task.
    pub agent_id: String,
    /// The task as offered.
    pub task: TaskDescriptor,
    /// Claim time, the start of the task timeout.
    pub assigned_at: DateTime<Utc>,
}

/// A record removed from the registry, with the task it was holding.
#[derive(Debug, Clone)]
pub struct Removal {
    /// The record as it left the registry.
    pub record: AgentRecord,
    /// Status held just before removal. Differs from `record.status`
    /// after an eviction, which moves the record to FAILED first.
    pub previous_status: AgentStatus,
    /// Task the agent was holding.
    pub released: Option<Assignment>,
}

/// Result of [`AgentRegistry::assign_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The task now belongs to this agent.
    Assigned(String),
    /// No eligible agent right now.
    NoCapacity,
    /// The task id is already in flight on this agent.
    AlreadyAssigned(String),
}

/// Which per-agent counter a release increments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tally {
    /// `tasks_completed`.
    Completed,
    /// `tasks_failed`.
    Failed,
    /// Neither counter, for cancellations and orphans.
    Neither,
}

/// A task removed from the assignment map.
#[derive(Debug, Clone)]
pub struct Released {
    /// Released task.
    pub task_id: String,
    /// Its former assignment entry.
    pub assignment: Assignment,
    /// Set when the owning agent went back to READY.
    pub change: Option<StatusChange>,
}

/// Effect of an inbound message on an agent's liveness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The sender is not registered.
    Unknown,
    /// Liveness refreshed, status unchanged.
    Alive,
    /// The agent was UNAVAILABLE and is back.
    Recovered(StatusChange),
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    task_assignments: HashMap<String, Assignment>,
    failed_total: u64,
}

/// The authoritative agent map and task assignment map.
///
/// Both maps sit behind one mutex, so register, unregister, assign and
/// release are atomic relative to each other. The lock is only held for
/// in-memory work and never across an `.await`.
pub struct AgentRegistry {
    max_agents: usize,
    master_id: Option<String>,
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    /// An empty registry holding at most `max_agents` records.
    pub fn new(max_agents: usize) -> Self {
        Self {
            max_agents,
            master_id: None,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Refuse registrations under the master's own id.
    pub fn with_master_id(mut self, master_id: impl Into<String>) -> Self {
        self.master_id = Some(master_id.into());
        self
    }

    /// Capacity.
    pub fn max_agents(&self) -> usize {
        self.max_agents
    }

    /// Register a plain slave. Returns `false`, leaving the registry
    /// untouched, on a duplicate id or when full.
    pub fn register<I, S>(&self, id: impl Into<String>, capabilities: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.try_register(AgentRecord::new(id, capabilities)).is_ok()
    }

    /// Register a fully built record.
    pub fn try_register(&self, record: AgentRecord) -> Result<(), RegistrationError> {
        if record.id.trim().is_empty() {
            return Err(RegistrationError::EmptyId);
        }
        if record.role == AgentRole::Master {
            return Err(RegistrationError::MasterRole(record.id));
        }
        if self.master_id.as_deref() == Some(record.id.as_str()) {
            return Err(RegistrationError::ReservedId(record.id));
        }

        let mut state = self.state.lock();
        if state.agents.contains_key(&record.id) {
            return Err(RegistrationError::Duplicate(record.id));
        }
        if state.agents.len() >= self.max_agents {
            return Err(RegistrationError::AtCapacity(self.max_agents));
        }

        debug!(agent_id = %record.id, capabilities = ?record.capabilities, "Agent registered");
        state.agents.insert(record.id.clone(), record);
        Ok(())
    }

    /// Remove an agent. Its task, if any, leaves the assignment map and is
    /// handed back to the caller.
    pub fn unregister(&self, id: &str) -> Option<Removal> {
        let mut state = self.state.lock();
        Self::remove_locked(&mut state, id)
    }

    /// Mark an agent FAILED and remove it, if `still_failing` agrees under
    /// the lock. The predicate lets callers re-check a decision taken
    /// during an earlier lock acquisition.
    pub fn evict_if<F>(&self, id: &str, still_failing: F) -> Option<Removal>
    where
        F: FnOnce(&AgentRecord) -> bool,
    {
        let mut state = self.state.lock();
        let agent = state.agents.get_mut(id)?;
        if !still_failing(agent) {
            return None;
        }
        let previous = match agent.transition(AgentStatus::Failed) {
            Ok(previous) => previous,
            Err(e) => {
                warn!(agent_id = %id, error = %e, "Eviction skipped");
                return None;
            }
        };
        state.failed_total += 1;
        let mut removal = Self::remove_locked(&mut state, id)?;
        removal.previous_status = previous;
        Some(removal)
    }

    /// Unconditional eviction, for unrecoverable reports.
    pub fn evict(&self, id: &str) -> Option<Removal> {
        self.evict_if(id, |_| true)
    }

    fn remove_locked(state: &mut RegistryState, id: &str) -> Option<Removal> {
        let record = state.agents.remove(id)?;
        let released = record
            .current_task
            .as_ref()
            .and_then(|task_id| state.task_assignments.remove(task_id));
        Some(Removal {
            previous_status: record.status,
            record,
            released,
        })
    }

    /// Copy of one record.
    pub fn get(&self, id: &str) -> Option<AgentRecord> {
        self.state.lock().agents.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.state.lock().agents.contains_key(id)
    }

    /// Snapshot of the agents matching `filter`, ordered by id.
    pub fn list<F>(&self, filter: F) -> Vec<AgentRecord>
    where
        F: Fn(&AgentRecord) -> bool,
    {
        let state = self.state.lock();
        let mut agents: Vec<AgentRecord> =
            state.agents.values().filter(|a| filter(a)).cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Snapshot of every agent, ordered by id.
    pub fn snapshot(&self) -> Vec<AgentRecord> {
        self.list(|_| true)
    }

    /// Registered agents.
    pub fn len(&self) -> usize {
        self.state.lock().agents.len()
    }

    /// Whether no agent is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refresh liveness for any inbound message. Recovers UNAVAILABLE agents.
    pub fn record_heartbeat(&self, id: &str, now: DateTime<Utc>) -> HeartbeatResult {
        let mut state = self.state.lock();
        let Some(agent) = state.agents.get_mut(id) else {
            return HeartbeatResult::Unknown;
        };
        agent.reset_liveness(now);

        if agent.status != AgentStatus::Unavailable {
            return HeartbeatResult::Alive;
        }
        let next = if agent.current_task.is_some() {
            AgentStatus::Busy
        } else {
            AgentStatus::Ready
        };
        match agent.transition(next) {
            Ok(from) => HeartbeatResult::Recovered(StatusChange {
                agent_id: id.to_string(),
                from,
                to: next,
            }),
            Err(_) => HeartbeatResult::Alive,
        }
    }

    /// Store reported gauges. `None` keeps the previous value.
    pub fn update_resources(
        &self,
        id: &str,
        cpu_percent: Option<f32>,
        memory_mb: Option<f64>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(agent) = state.agents.get_mut(id) else {
            return false;
        };
        if let Some(cpu) = cpu_percent {
            agent.resource_usage.cpu_percent = cpu.max(0.0);
        }
        if let Some(memory) = memory_mb {
            agent.resource_usage.memory_mb = memory.max(0.0);
        }
        true
    }

    /// Atomically pick and claim an agent for `task`.
    ///
    /// `select` sees READY agents whose capabilities contain the task type
    /// and returns the id of its choice. The claim (current task, BUSY,
    /// assignment entry) happens under the same lock as the selection.
    pub fn assign_with<F>(&self, task: &TaskDescriptor, now: DateTime<Utc>, select: F) -> Claim
    where
        F: FnOnce(&[AgentRecord]) -> Option<String>,
    {
        let mut state = self.state.lock();

        if let Some(existing) = state.task_assignments.get(&task.id) {
            return Claim::AlreadyAssigned(existing.agent_id.clone());
        }

        let candidates: Vec<AgentRecord> = state
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Ready && a.can_handle(&task.task_type))
            .cloned()
            .collect();

        let Some(chosen) = select(&candidates) else {
            return Claim::NoCapacity;
        };
        let Some(agent) = state.agents.get_mut(&chosen) else {
            return Claim::NoCapacity;
        };
        if agent.current_task.is_some() || agent.transition(AgentStatus::Busy).is_err() {
            return Claim::NoCapacity;
        }
        agent.current_task = Some(task.id.clone());

        state.task_assignments.insert(
            task.id.clone(),
            Assignment {
                agent_id: chosen.clone(),
                task: task.clone(),
                assigned_at: now,
            },
        );
        Claim::Assigned(chosen)
    }

    /// Remove a task from the assignment map and free its agent.
    ///
    /// With `expected_owner` set, the release only happens if that agent
    /// holds the task.
    pub fn release_task(
        &self,
        task_id: &str,
        expected_owner: Option<&str>,
        tally: Tally,
        now: DateTime<Utc>,
    ) -> Result<Released, ReleaseError> {
        let mut state = self.state.lock();

        let owner = match state.task_assignments.get(task_id) {
            Some(a) => a.agent_id.clone(),
            None => return Err(ReleaseError::UnknownTask(task_id.to_string())),
        };
        if let Some(claimed_by) = expected_owner {
            if claimed_by != owner {
                return Err(ReleaseError::NotOwner {
                    task_id: task_id.to_string(),
                    owner,
                    claimed_by: claimed_by.to_string(),
                });
            }
        }

        let Some(assignment) = state.task_assignments.remove(task_id) else {
            return Err(ReleaseError::UnknownTask(task_id.to_string()));
        };

        let mut change = None;
        if let Some(agent) = state.agents.get_mut(&owner) {
            if agent.current_task.as_deref() == Some(task_id) {
                agent.current_task = None;
                agent.idle_since = now;
                match tally {
                    Tally::Completed => agent.resource_usage.tasks_completed += 1,
                    Tally::Failed => agent.resource_usage.tasks_failed += 1,
                    Tally::Neither => {}
                }
                if agent.status == AgentStatus::Busy {
                    if let Ok(from) = agent.transition(AgentStatus::Ready) {
                        change = Some(StatusChange {
                            agent_id: owner.clone(),
                            from,
                            to: AgentStatus::Ready,
                        });
                    }
                }
            }
        }

        Ok(Released {
            task_id: task_id.to_string(),
            assignment,
            change,
        })
    }

    /// Owner of an in-flight task.
    pub fn owner_of(&self, task_id: &str) -> Option<String> {
        self.state
            .lock()
            .task_assignments
            .get(task_id)
            .map(|a| a.agent_id.clone())
    }

    /// Snapshot of the assignment map.
    pub fn assignments(&self) -> HashMap<String, Assignment> {
        self.state.lock().task_assignments.clone()
    }

    /// Entries in the assignment map.
    pub fn active_task_count(&self) -> usize {
        self.state.lock().task_assignments.len()
    }

    /// Assignments older than `timeout`, oldest first.
    pub fn overdue_assignments(
        &self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Vec<(String, Assignment)> {
        let state = self.state.lock();
        let mut overdue: Vec<(String, Assignment)> = state
            .task_assignments
            .iter()
            .filter(|(_, a)| {
                (now - a.assigned_at)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > timeout)
            })
            .map(|(id, a)| (id.clone(), a.clone()))
            .collect();
        overdue.sort_by_key(|(_, a)| a.assigned_at);
        overdue
    }

    /// Run `f` over every record under the lock.
    ///
    /// Reserved for the health monitor, which owns status, liveness and
    /// score fields; `f` must not touch `current_task`.
    pub(crate) fn update_each<F>(&self, mut f: F)
    where
        F: FnMut(&mut AgentRecord),
    {
        let mut state = self.state.lock();
        let mut ids: Vec<String> = state.agents.keys().cloned().collect();
        ids.sort();
        for id in ids {
            if let Some(agent) = state.agents.get_mut(&id) {
                f(agent);
            }
        }
    }

    /// Aggregate counts, read under the lock without side effects.
    pub fn system_status(&self, unhealthy_threshold: u8) -> SystemStatus {
        let state = self.state.lock();
        let mut status = SystemStatus {
            total_agents: state.agents.len(),
            failed_agents: state.failed_total,
            active_task_count: state.task_assignments.len(),
            ..SystemStatus::default()
        };

        let mut health_sum: u64 = 0;
        for agent in state.agents.values() {
            match agent.status {
                AgentStatus::Ready => status.ready_agents += 1,
                AgentStatus::Busy => status.busy_agents += 1,
                AgentStatus::Unavailable | AgentStatus::Failed => {}
            }
            if agent.status == AgentStatus::Unavailable
                || agent.health_score < unhealthy_threshold
            {
                status.unhealthy_agents += 1;
            }
            health_sum += u64::from(agent.health_score);
        }

        if let Some(count) = u64::try_from(state.agents.len()).ok().filter(|n| *n > 0) {
            let mean = (health_sum + count / 2) / count;
            status.system_health = u8::try_from(mean.min(100)).unwrap_or(100);
        }
        status
    }

    /// Check the cross-map invariants: every assigned agent exists and
    /// holds exactly that task, no agent holds two tasks, and every
    /// `current_task` has an entry.
    pub fn verify_invariants(&self) -> Result<(), String> {
        let state = self.state.lock();
        let mut owners = BTreeSet::new();

        for (task_id, assignment) in &state.task_assignments {
            let Some(agent) = state.agents.get(&assignment.agent_id) else {
                return Err(format!(
                    "task '{task_id}' assigned to missing agent '{}'",
                    assignment.agent_id
                ));
            };
            if agent.current_task.as_deref() != Some(task_id.as_str()) {
                return Err(format!(
                    "task '{task_id}' assigned to '{}' whose current_task is {:?}",
                    agent.id, agent.current_task
                ));
            }
            if !owners.insert(assignment.agent_id.as_str()) {
                return Err(format!("agent '{}' holds two tasks", assignment.agent_id));
            }
        }

        for agent in state.agents.values() {
            if let Some(task_id) = &agent.current_task {
                if !state.task_assignments.contains_key(task_id) {
                    return Err(format!(
                        "agent '{}' holds '{task_id}' with no assignment entry",
                        agent.id
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn first(candidates: &[AgentRecord]) -> Option<String> {
        let mut ids: Vec<&String> = candidates.iter().map(|a| &a.id).collect();
        ids.sort();
        ids.first().map(|id| (*id).clone())
    }

    fn task(id: &str, kind: &str) -> TaskDescriptor {
        TaskDescriptor::with_id(id, kind)
    }

    #[test]
    fn test_register_and_get() {
        let registry = AgentRegistry::new(4);
        assert!(registry.register("w-1", ["build"]));
        let agent = registry.get("w-1").unwrap();
        assert!(agent.can_handle("build"));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("w-2").is_none());
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = AgentRegistry::new(3);
        let accepted = (0..4)
            .filter(|i| registry.register(format!("w-{i}"), ["build"]))
            .count();
        assert_eq!(accepted, 3);
        assert_eq!(registry.len(), 3);
        assert_eq!(
            registry.try_register(AgentRecord::new("w-9", ["build"])),
            Err(RegistrationError::AtCapacity(3))
        );
    }

    #[test]
    fn test_reregistration_keeps_original_capabilities() {
        let registry = AgentRegistry::new(4);
        assert!(registry.register("w-1", ["build"]));
        assert!(!registry.register("w-1", ["deploy", "test"]));
        let agent = registry.get("w-1").unwrap();
        assert_eq!(agent.capabilities.len(), 1);
        assert!(agent.can_handle("build"));
        assert!(!agent.can_handle("deploy"));
    }

    #[test]
    fn test_master_role_and_empty_id_rejected() {
        let registry = AgentRegistry::new(4);
        let master = AgentRecord::new("boss", ["build"]).with_role(AgentRole::Master);
        assert_eq!(
            registry.try_register(master),
            Err(RegistrationError::MasterRole("boss".into()))
        );
        assert_eq!(
            registry.try_register(AgentRecord::new("  ", ["build"])),
            Err(RegistrationError::EmptyId)
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_master_id_is_reserved() {
        let registry = AgentRegistry::new(4).with_master_id("hq");
        assert_eq!(
            registry.try_register(AgentRecord::new("hq", ["build"])),
            Err(RegistrationError::ReservedId("hq".into()))
        );
        assert!(!registry.register("hq", ["build"]));
        assert!(registry.register("master", ["build"]));
        assert!(!registry.contains("hq"));
    }

    #[test]
    fn test_assign_claims_agent() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);

        let claim = registry.assign_with(&task("t-1", "build"), Utc::now(), first);
        assert_eq!(claim, Claim::Assigned("w-1".into()));

        let agent = registry.get("w-1").unwrap();
        assert_eq!(agent.status, AgentStatus::Busy);
        assert_eq!(agent.current_task.as_deref(), Some("t-1"));
        assert_eq!(registry.owner_of("t-1").as_deref(), Some("w-1"));
        registry.verify_invariants().unwrap();
    }

    #[test]
    fn test_assign_filters_by_capability() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        let claim = registry.assign_with(&task("t-1", "deploy"), Utc::now(), first);
        assert_eq!(claim, Claim::NoCapacity);
        assert_eq!(registry.active_task_count(), 0);
    }

    #[test]
    fn test_same_task_twice_is_rejected() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        registry.register("w-2", ["build"]);
        registry.assign_with(&task("t-1", "build"), Utc::now(), first);
        let claim = registry.assign_with(&task("t-1", "build"), Utc::now(), first);
        assert_eq!(claim, Claim::AlreadyAssigned("w-1".into()));
        assert_eq!(registry.get("w-2").unwrap().status, AgentStatus::Ready);
    }

    #[test]
    fn test_unregister_releases_task() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        registry.assign_with(&task("t-1", "build"), Utc::now(), first);

        let removal = registry.unregister("w-1").unwrap();
        assert_eq!(removal.previous_status, AgentStatus::Busy);
        assert_eq!(removal.released.unwrap().task.id, "t-1");
        assert!(registry.assignments().is_empty());
        assert!(registry.unregister("w-1").is_none());
        registry.verify_invariants().unwrap();
    }

    #[test]
    fn test_release_requires_owner() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        registry.register("w-2", ["build"]);
        registry.assign_with(&task("t-1", "build"), Utc::now(), first);

        let err = registry
            .release_task("t-1", Some("w-2"), Tally::Completed, Utc::now())
            .unwrap_err();
        assert!(matches!(err, ReleaseError::NotOwner { .. }));
        assert_eq!(registry.owner_of("t-1").as_deref(), Some("w-1"));

        let released = registry
            .release_task("t-1", Some("w-1"), Tally::Completed, Utc::now())
            .unwrap();
        assert_eq!(released.change.unwrap().to, AgentStatus::Ready);
        let agent = registry.get("w-1").unwrap();
        assert_eq!(agent.resource_usage.tasks_completed, 1);
        assert!(agent.current_task.is_none());
    }

    #[test]
    fn test_release_unknown_task() {
        let registry = AgentRegistry::new(4);
        let err = registry
            .release_task("ghost", None, Tally::Failed, Utc::now())
            .unwrap_err();
        assert_eq!(err, ReleaseError::UnknownTask("ghost".into()));
    }

    #[test]
    fn test_heartbeat_recovers_unavailable_agent() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        registry.update_each(|a| {
            a.transition(AgentStatus::Unavailable).unwrap();
            a.missed_heartbeats = 2;
        });

        match registry.record_heartbeat("w-1", Utc::now()) {
            HeartbeatResult::Recovered(change) => {
                assert_eq!(change.from, AgentStatus::Unavailable);
                assert_eq!(change.to, AgentStatus::Ready);
            }
            other => panic!("expected recovery, got {other:?}"),
        }
        assert_eq!(registry.get("w-1").unwrap().missed_heartbeats, 0);
        assert_eq!(
            registry.record_heartbeat("nobody", Utc::now()),
            HeartbeatResult::Unknown
        );
    }

    #[test]
    fn test_evict_counts_failures() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        registry.register("w-2", ["build"]);
        assert!(registry.evict_if("w-1", |a| a.status == AgentStatus::Busy).is_none());
        let removal = registry.evict("w-1").unwrap();
        assert_eq!(removal.record.status, AgentStatus::Failed);
        assert_eq!(removal.previous_status, AgentStatus::Ready);
        let status = registry.system_status(50);
        assert_eq!(status.failed_agents, 1);
        assert_eq!(status.total_agents, 1);
    }

    #[test]
    fn test_system_status_counts() {
        let registry = AgentRegistry::new(8);
        registry.register("w-1", ["build"]);
        registry.register("w-2", ["build"]);
        registry.register("w-3", ["build"]);
        registry.assign_with(&task("t-1", "build"), Utc::now(), first);
        registry.update_each(|a| {
            if a.id == "w-3" {
                a.health_score = 40;
            }
        });

        let status = registry.system_status(50);
        assert_eq!(status.total_agents, 3);
        assert_eq!(status.busy_agents, 1);
        assert_eq!(status.ready_agents, 2);
        assert_eq!(status.unhealthy_agents, 1);
        assert_eq!(status.active_task_count, 1);
        assert_eq!(status.system_health, 80);
    }

    #[test]
    fn test_empty_system_status() {
        let status = AgentRegistry::new(2).system_status(50);
        assert_eq!(status, SystemStatus::default());
    }

    #[test]
    fn test_overdue_assignments() {
        let registry = AgentRegistry::new(4);
        registry.register("w-1", ["build"]);
        let then = Utc::now() - chrono::Duration::seconds(120);
        registry.assign_with(&task("t-1", "build"), then, first);

        assert_eq!(
            registry
                .overdue_assignments(Utc::now(), Duration::from_secs(60))
                .len(),
            1
        );
        assert!(registry
            .overdue_assignments(Utc::now(), Duration::from_secs(600))
            .is_empty());
    }

    #[test]
    fn test_invariants_hold_across_operation_sequence() {
        let registry = AgentRegistry::new(5);
        let now = Utc::now();
        for step in 0u32..200 {
            let agent = format!("w-{}", step % 7);
            let task_id = format!("t-{}", step % 11);
            match step % 5 {
                0 | 1 => {
                    registry.register(agent, ["build"]);
                }
                2 => {
                    registry.assign_with(&task(&task_id, "build"), now, first);
                }
                3 => {
                    let _ = registry.release_task(&task_id, None, Tally::Completed, now);
                }
                _ => {
                    registry.unregister(&agent);
                }
            }
            registry.verify_invariants().unwrap();
            let busy = registry.list(|a| a.current_task.is_some()).len();
            assert_eq!(busy, registry.active_task_count());
        }
    }
}
