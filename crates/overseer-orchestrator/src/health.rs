use crate::config::{HealthPolicy, OrchestratorConfig};
use crate::dispatcher::TaskDispatcher;
use crate::events::{EventBus, OrchestratorEvent, ReleaseReason};
use crate::outcome::OutcomeStatus;
use crate::registry::AgentRegistry;
use crate::router::MessageRouter;
use crate::types::{AgentStatus, ResourceUsage, StatusChange};
use chrono::{DateTime, Utc};
use overseer_core::Message;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Score an agent from its gauges and missed heartbeats, `0..=100`.
pub fn compute_health_score(usage: &ResourceUsage, missed: u32, policy: &HealthPolicy) -> u8 {
    let cpu_penalty = f64::from((usage.cpu_percent - policy.cpu_soft_limit).max(0.0))
        * f64::from(policy.cpu_penalty_per_percent);

    let memory_excess = (usage.memory_mb - policy.memory_soft_limit_mb).max(0.0);
    let memory_penalty = if policy.memory_penalty_step_mb > 0.0 {
        (memory_excess / policy.memory_penalty_step_mb).floor() * policy.memory_penalty_per_step
    } else {
        0.0
    };

    let missed_penalty = f64::from(missed) * f64::from(policy.missed_heartbeat_penalty);
    let score = (100.0 - cpu_penalty - memory_penalty - missed_penalty).clamp(0.0, 100.0);
    // Clamped to 0..=100 above, the cast cannot truncate.
    score.round() as u8
}

/// Timing and policy knobs the monitor reads every tick.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Tick period.
    pub interval: Duration,
    /// Heartbeat age that counts as a miss.
    pub agent_timeout: Duration,
    /// Grace given to a restart probe.
    pub restart_ack_timeout: Duration,
    /// Probes per episode before eviction.
    pub max_restart_attempts: u32,
    /// Stale checks before the first probe.
    pub unavailable_checks_before_restart: u32,
    /// Task deadline, if any.
    pub task_timeout: Option<Duration>,
    /// Scoring penalties.
    pub policy: HealthPolicy,
}

impl From<&OrchestratorConfig> for MonitorSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            interval: config.health_check_interval(),
            agent_timeout: config.agent_timeout(),
            restart_ack_timeout: config.restart_ack_timeout(),
            max_restart_attempts: config.max_restart_attempts,
            unavailable_checks_before_restart: config.unavailable_checks_before_restart,
            task_timeout: config.task_timeout(),
            policy: config.health.clone(),
        }
    }
}

/// What one health check did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthTickReport {
    /// Agents whose score changed.
    pub rescored: usize,
    /// Agents moved to UNAVAILABLE.
    pub became_unavailable: Vec<String>,
    /// Agents probed with a wake-up heartbeat.
    pub restarts_sent: Vec<String>,
    /// Agents marked FAILED and removed.
    pub evicted: Vec<String>,
    /// Tasks freed by evictions.
    pub released_tasks: Vec<String>,
    /// Tasks past the task timeout.
    pub timed_out_tasks: Vec<String>,
}

impl HealthTickReport {
    /// Nothing but rescoring happened.
    pub fn is_quiet(&self) -> bool {
        self.became_unavailable.is_empty()
            && self.restarts_sent.is_empty()
            && self.evicted.is_empty()
            && self.released_tasks.is_empty()
            && self.timed_out_tasks.is_empty()
    }
}

/// Periodic liveness check, scoring, restart probing and eviction.
pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<TaskDispatcher>,
    events: EventBus,
    settings: MonitorSettings,
}

fn is_stale(last: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    (now - last).to_std().is_ok_and(|elapsed| elapsed > timeout)
}

impl HealthMonitor {
    /// A monitor over `registry`, probing through `router`.
    pub fn new(
        registry: Arc<AgentRegistry>,
        router: Arc<MessageRouter>,
        dispatcher: Arc<TaskDispatcher>,
        events: EventBus,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            router,
            dispatcher,
            events,
            settings,
        }
    }

    /// Settings in use.
    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    /// One health check as of now.
    pub fn tick(&self) -> HealthTickReport {
        self.tick_at(Utc::now())
    }

    /// One health check as of `now`.
    ///
    /// Decisions are made under the registry lock, messages are sent after
    /// it is released, and evictions re-check their condition when the lock
    /// is taken again.
    pub fn tick_at(&self, now: DateTime<Utc>) -> HealthTickReport {
        let settings = &self.settings;
        let mut report = HealthTickReport::default();
        let mut changes: Vec<StatusChange> = Vec::new();
        let mut to_evict: Vec<String> = Vec::new();

        self.registry.update_each(|agent| {
            if is_stale(agent.last_heartbeat, now, settings.agent_timeout) {
                agent.missed_heartbeats = agent.missed_heartbeats.saturating_add(1);
                if matches!(agent.status, AgentStatus::Ready | AgentStatus::Busy) {
                    if let Ok(from) = agent.transition(AgentStatus::Unavailable) {
                        agent.unavailable_since = Some(now);
                        report.became_unavailable.push(agent.id.clone());
                        changes.push(StatusChange {
                            agent_id: agent.id.clone(),
                            from,
                            to: AgentStatus::Unavailable,
                        });
                    }
                }
            }

            let score = compute_health_score(
                &agent.resource_usage,
                agent.missed_heartbeats,
                &settings.policy,
            );
            if score != agent.health_score {
                agent.health_score = score;
                report.rescored += 1;
            }

            if agent.status != AgentStatus::Unavailable
                || agent.missed_heartbeats < settings.unavailable_checks_before_restart
            {
                return;
            }
            let awaiting_ack = agent
                .restart_sent_at
                .is_some_and(|sent| !is_stale(sent, now, settings.restart_ack_timeout));
            if awaiting_ack {
                return;
            }
            if agent.restart_attempts < settings.max_restart_attempts {
                agent.restart_attempts += 1;
                agent.restart_sent_at = Some(now);
                report.restarts_sent.push(agent.id.clone());
            } else {
                to_evict.push(agent.id.clone());
            }
        });

        for change in changes {
            warn!(agent_id = %change.agent_id, from = %change.from, "Agent heartbeat is stale");
            self.events.publish(OrchestratorEvent::AgentStatusChanged {
                agent_id: change.agent_id,
                from: change.from,
                to: change.to,
            });
        }

        for agent_id in &report.restarts_sent {
            info!(agent_id = %agent_id, "Sending restart probe");
            let delivery = self
                .router
                .send(Message::heartbeat(self.router.master_id(), agent_id.as_str()));
            if !delivery.is_delivered() {
                debug!(agent_id = %agent_id, ?delivery, "Restart probe not delivered");
            }
        }

        let threshold = settings.unavailable_checks_before_restart;
        for agent_id in to_evict {
            let removal = self.registry.evict_if(&agent_id, |a| {
                a.status == AgentStatus::Unavailable && a.missed_heartbeats >= threshold
            });
            let Some(removal) = removal else {
                debug!(agent_id = %agent_id, "Agent recovered before eviction");
                continue;
            };

            warn!(
                agent_id = %agent_id,
                restart_attempts = removal.record.restart_attempts,
                "Agent evicted as failed"
            );
            self.router.close_mailbox(&agent_id);
            self.events.publish(OrchestratorEvent::AgentStatusChanged {
                agent_id: agent_id.clone(),
                from: removal.previous_status,
                to: AgentStatus::Failed,
            });
            self.events.publish(OrchestratorEvent::AgentUnregistered {
                agent_id: agent_id.clone(),
                failed: true,
            });
            if let Some(outcome) =
                self.dispatcher
                    .release_orphaned(&removal, ReleaseReason::AgentEvicted, now)
            {
                report.released_tasks.push(outcome.task_id);
            }
            report.evicted.push(agent_id);
        }

        if let Some(timeout) = settings.task_timeout {
            for (task_id, _) in self.registry.overdue_assignments(now, timeout) {
                let reason = Some(format!("exceeded task timeout of {}ms", timeout.as_millis()));
                if self
                    .dispatcher
                    .withdraw(&task_id, reason, OutcomeStatus::TimedOut, now)
                    .is_some()
                {
                    report.timed_out_tasks.push(task_id);
                }
            }
        }

        report
    }

    /// Run [`tick`](Self::tick) on an interval until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.settings.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so fresh agents get a full interval.
            ticker.tick().await;

            info!(interval_ms = self.settings.interval.as_millis() as u64, "Health monitor started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = self.tick();
                        if !report.is_quiet() {
                            info!(
                                unavailable = report.became_unavailable.len(),
                                restarts = report.restarts_sent.len(),
                                evicted = report.evicted.len(),
                                timed_out = report.timed_out_tasks.len(),
                                "Health check"
                            );
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}
