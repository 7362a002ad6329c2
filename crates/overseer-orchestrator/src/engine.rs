use crate::config::OrchestratorConfig;
use crate::discovery::{
    DiscoveredAgent, Discovery, DiscoveryReport, ProcessScanner, SysinfoScanner,
};
use crate::dispatcher::TaskDispatcher;
use crate::events::{EventBus, OrchestratorEvent, ReleaseReason};
use crate::health::{HealthMonitor, HealthTickReport, MonitorSettings};
use crate::outcome::{OutcomeLog, OutcomeSink, TaskOutcome};
use crate::registry::{AgentRegistry, HeartbeatResult, RegistrationError, Removal};
use crate::router::{Delivery, Mailbox, MessageRouter, RouterStats};
use crate::types::{AgentRecord, AgentStatus, SystemStatus};
use chrono::Utc;
use overseer_core::{
    ErrorPayload, HealthReportPayload, HeartbeatPayload, Message, MessageType, OverseerError,
    OverseerResult, RegisterPayload, TaskDescriptor, TaskStatusPayload,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Lifecycle {
    shutdown: Option<CancellationToken>,
    loops: Vec<JoinHandle<()>>,
    inbox_loop: Option<JoinHandle<Mailbox>>,
    /// The master's own mailbox while no inbox loop owns it.
    inbox: Option<Mailbox>,
}

/// The master orchestration engine.
///
/// Owns the agent registry and wires the router, dispatcher, health monitor
/// and discovery around it. Lifecycle is `new` / `start` / `stop`; the value
/// can be started again after a stop.
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    dispatcher: Arc<TaskDispatcher>,
    monitor: Arc<HealthMonitor>,
    discovery: Discovery,
    events: EventBus,
    outcomes: Arc<OutcomeLog>,
    lifecycle: Mutex<Lifecycle>,
}

impl Orchestrator {
    /// Create an orchestrator that discovers workers through the host process table.
    pub fn new(config: OrchestratorConfig) -> OverseerResult<Self> {
        Self::with_process_scanner(config, Arc::new(SysinfoScanner))
    }

    /// Create with a custom process scanner.
    pub fn with_process_scanner(
        config: OrchestratorConfig,
        scanner: Arc<dyn ProcessScanner>,
    ) -> OverseerResult<Self> {
        config.validate()?;

        let registry = Arc::new(
            AgentRegistry::new(config.max_agents).with_master_id(config.master_id.clone()),
        );
        let router = Arc::new(MessageRouter::new(
            config.master_id.clone(),
            config.mailbox_capacity,
        ));
        let events = EventBus::new(config.event_capacity);
        let dispatcher = Arc::new(TaskDispatcher::new(
            config.master_id.clone(),
            registry.clone(),
            router.clone(),
            events.clone(),
        ));
        let outcomes = Arc::new(OutcomeLog::new(config.outcome_log_capacity));
        dispatcher.add_sink(outcomes.clone());

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            router.clone(),
            dispatcher.clone(),
            events.clone(),
            MonitorSettings::from(&config),
        ));
        let discovery = Discovery::from_config(&config.discovery, scanner)?;
        let inbox = router.open_mailbox(&config.master_id);

        info!(
            master_id = %config.master_id,
            max_agents = config.max_agents,
            "Orchestrator: created"
        );

        Ok(Self {
            config,
            registry,
            router,
            dispatcher,
            monitor,
            discovery,
            events,
            outcomes,
            lifecycle: Mutex::new(Lifecycle {
                inbox: Some(inbox),
                ..Lifecycle::default()
            }),
        })
    }

    /// Add a destination for finished task records.
    pub fn add_outcome_sink(&self, sink: Arc<dyn OutcomeSink>) {
        self.dispatcher.add_sink(sink);
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Id of the master in the star.
    pub fn master_id(&self) -> &str {
        &self.config.master_id
    }

    /// The agent registry.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// The message router.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    /// The task dispatcher.
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// The health monitor.
    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Receive orchestrator events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    // --- Agents ---

    /// Register an in-process agent and open its mailbox.
    pub fn register_agent<I, S>(
        &self,
        id: impl Into<String>,
        capabilities: I,
    ) -> Result<Mailbox, RegistrationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let record = AgentRecord::new(id, capabilities);
        let id = record.id.clone();
        self.register_record(record)?;
        Ok(self.router.open_mailbox(&id))
    }

    /// Register a prepared record. The caller is responsible for its mailbox.
    pub fn register_record(&self, record: AgentRecord) -> Result<(), RegistrationError> {
        let agent_id = record.id.clone();
        let capabilities = record.capabilities.clone();
        let role = record.role;

        if let Err(e) = self.registry.try_register(record) {
            warn!(agent_id = %agent_id, error = %e, "Orchestrator: registration rejected");
            return Err(e);
        }

        info!(agent_id = %agent_id, role = %role, capabilities = ?capabilities, "Orchestrator: agent registered");
        self.events.publish(OrchestratorEvent::AgentRegistered {
            agent_id,
            capabilities,
        });
        Ok(())
    }

    /// Remove an agent. A task it held is released and reported as orphaned.
    pub fn unregister_agent(&self, id: &str) -> bool {
        let Some(removal) = self.registry.unregister(id) else {
            debug!(agent_id = %id, "Orchestrator: unregister of unknown agent");
            return false;
        };
        info!(agent_id = %id, "Orchestrator: agent unregistered");
        self.after_removal(&removal, false, ReleaseReason::AgentUnregistered);
        true
    }

    /// Mark an agent FAILED and remove it.
    fn evict_agent(&self, id: &str, reason: &str) -> bool {
        let Some(removal) = self.registry.evict(id) else {
            return false;
        };
        error!(agent_id = %id, reason = %reason, "Orchestrator: agent failed");
        self.events.publish(OrchestratorEvent::AgentStatusChanged {
            agent_id: id.to_string(),
            from: removal.previous_status,
            to: AgentStatus::Failed,
        });
        self.after_removal(&removal, true, ReleaseReason::AgentEvicted);
        true
    }

    fn after_removal(&self, removal: &Removal, failed: bool, reason: ReleaseReason) {
        self.router.close_mailbox(&removal.record.id);
        self.events.publish(OrchestratorEvent::AgentUnregistered {
            agent_id: removal.record.id.clone(),
            failed,
        });
        self.dispatcher.release_orphaned(removal, reason, Utc::now());
    }

    /// Snapshot of one agent.
    pub fn agent(&self, id: &str) -> Option<AgentRecord> {
        self.registry.get(id)
    }

    /// Every registered agent, ordered by id.
    pub fn agents(&self) -> Vec<AgentRecord> {
        self.registry.snapshot()
    }

    // --- Tasks ---

    /// Offer a task to the healthiest capable READY agent.
    pub fn assign_task(&self, task: TaskDescriptor) -> Option<String> {
        self.dispatcher.assign(task)
    }

    /// Withdraw an in-flight task.
    pub fn cancel_task(&self, task_id: &str, reason: Option<String>) -> bool {
        self.dispatcher.cancel(task_id, reason)
    }

    /// Up to `n` latest task outcomes, newest first.
    pub fn recent_outcomes(&self, n: usize) -> Vec<TaskOutcome> {
        self.outcomes.recent(n)
    }

    // --- Status ---

    /// Aggregate registry counts.
    pub fn get_system_status(&self) -> SystemStatus {
        self.registry
            .system_status(self.config.health.unhealthy_threshold)
    }

    /// Message delivery counters.
    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Run one health check now, outside the periodic loop.
    pub fn tick_health(&self) -> HealthTickReport {
        self.monitor.tick()
    }

    /// Dashboard snapshot.
    pub fn to_json(&self) -> serde_json::Value {
        let mut assignments: Vec<serde_json::Value> = self
            .registry
            .assignments()
            .into_iter()
            .map(|(task_id, a)| {
                serde_json::json!({
                    "task_id": task_id,
                    "task_type": a.task.task_type,
                    "agent_id": a.agent_id,
                    "assigned_at": a.assigned_at,
                })
            })
            .collect();
        assignments.sort_by(|a, b| a["task_id"].as_str().cmp(&b["task_id"].as_str()));

        serde_json::json!({
            "master_id": self.config.master_id,
            "running": self.is_running(),
            "status": self.get_system_status(),
            "agents": self.agents(),
            "assignments": assignments,
            "router": self.router.stats(),
            "recent_outcomes": self.outcomes.recent(20),
        })
    }

    // --- Messages ---

    /// Hand a message to the router, as a transport bridge would.
    pub fn deliver(&self, message: Message) -> Delivery {
        self.router.send(message)
    }

    /// Apply one message addressed to the master.
    ///
    /// Any message from a registered agent counts as proof of life.
    pub fn handle_message(&self, message: Message) {
        if message.recipient_id != self.config.master_id {
            warn!(
                message_id = %message.id,
                recipient = %message.recipient_id,
                "Orchestrator: message not addressed to the master"
            );
            return;
        }
        let sender = message.sender_id.as_str();

        if message.message_type == MessageType::Register {
            self.handle_register(&message);
            return;
        }

        if !self.note_liveness(sender) {
            warn!(
                agent_id = %sender,
                message_type = %message.message_type,
                "Orchestrator: message from unregistered agent dropped"
            );
            return;
        }

        match message.message_type {
            MessageType::Heartbeat => {
                if message.payload.is_null() {
                    return;
                }
                match message.payload_as::<HeartbeatPayload>() {
                    Ok(usage) => {
                        self.registry
                            .update_resources(sender, usage.cpu_percent, usage.memory_mb);
                    }
                    Err(e) => warn!(agent_id = %sender, error = %e, "Orchestrator: bad heartbeat payload"),
                }
            }
            MessageType::HealthReport => match message.payload_as::<HealthReportPayload>() {
                Ok(report) => {
                    self.registry.update_resources(
                        sender,
                        Some(report.cpu_percent),
                        Some(report.memory_mb),
                    );
                }
                Err(e) => warn!(agent_id = %sender, error = %e, "Orchestrator: bad health report"),
            },
            MessageType::TaskStatusUpdate => match message.payload_as::<TaskStatusPayload>() {
                Ok(update) => {
                    self.dispatcher.handle_status_update(sender, update);
                }
                Err(e) => warn!(agent_id = %sender, error = %e, "Orchestrator: bad status update"),
            },
            MessageType::Unregister => {
                self.unregister_agent(sender);
            }
            MessageType::Error => match message.payload_as::<ErrorPayload>() {
                Ok(report) if report.fatal => {
                    self.evict_agent(sender, &report.message);
                }
                Ok(report) => {
                    warn!(agent_id = %sender, error = %report.message, "Orchestrator: agent reported an error");
                }
                Err(e) => warn!(agent_id = %sender, error = %e, "Orchestrator: bad error report"),
            },
            MessageType::TaskAssignment | MessageType::Shutdown | MessageType::Register => {
                warn!(
                    agent_id = %sender,
                    message_type = %message.message_type,
                    "Orchestrator: unexpected message type from agent"
                );
            }
        }
    }

    /// Refresh an agent's liveness. False when it is not registered.
    fn note_liveness(&self, agent_id: &str) -> bool {
        match self.registry.record_heartbeat(agent_id, Utc::now()) {
            HeartbeatResult::Unknown => false,
            HeartbeatResult::Alive => true,
            HeartbeatResult::Recovered(change) => {
                info!(agent_id = %agent_id, to = %change.to, "Orchestrator: agent recovered");
                self.events.publish(OrchestratorEvent::AgentStatusChanged {
                    agent_id: change.agent_id,
                    from: change.from,
                    to: change.to,
                });
                true
            }
        }
    }

    fn handle_register(&self, message: &Message) {
        let sender = message.sender_id.as_str();
        let payload = if message.payload.is_null() {
            RegisterPayload::default()
        } else {
            match message.payload_as::<RegisterPayload>() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(agent_id = %sender, error = %e, "Orchestrator: bad registration payload");
                    return;
                }
            }
        };

        let mut record = AgentRecord::new(sender, payload.capabilities).with_role(payload.role);
        record.process_info = payload.process_info;

        let rejection = match self.register_record(record) {
            Ok(()) => {
                self.router.ensure_mailbox(sender);
                return;
            }
            Err(e) => e,
        };
        if matches!(rejection, RegistrationError::Duplicate(_)) {
            // Still alive; the original record and capabilities stay.
            self.note_liveness(sender);
        }
        if sender == self.config.master_id {
            return;
        }
        match Message::error(&self.config.master_id, sender, rejection.to_string(), false) {
            Ok(reply) => {
                let delivery = self.router.send_final(reply);
                if !delivery.is_delivered() {
                    debug!(agent_id = %sender, ?delivery, "Orchestrator: registration refusal not delivered");
                }
            }
            Err(e) => error!(error = %e, "Orchestrator: failed to encode reply"),
        }
    }

    // --- Discovery ---

    /// One discovery pass: register every matching worker not already known.
    pub async fn discover(&self) -> DiscoveryReport {
        self.discovery
            .discover(|worker| {
                let record = AgentRecord::new(worker.agent_id.clone(), worker.capabilities.clone())
                    .with_role(worker.role)
                    .with_process_info(worker.process.clone());
                if self.registry.contains(&worker.agent_id) {
                    return Err(RegistrationError::Duplicate(worker.agent_id.clone()));
                }
                self.register_record(record)?;
                self.router.ensure_mailbox(&worker.agent_id);
                Ok(())
            })
            .await
    }

    /// Matching worker processes, without registering anything.
    pub async fn scan_workers(&self) -> OverseerResult<Vec<DiscoveredAgent>> {
        self.discovery.scan().await
    }

    // --- Lifecycle ---

    /// Whether the background loops are up.
    pub fn is_running(&self) -> bool {
        self.lifecycle.lock().shutdown.is_some()
    }

    /// Spawn the health monitor, the master inbox loop and, when enabled,
    /// discovery. Must be called inside a tokio runtime.
    pub fn start(self: &Arc<Self>) -> OverseerResult<()> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.shutdown.is_some() {
            return Err(OverseerError::Orchestrator(
                "orchestrator is already running".to_string(),
            ));
        }
        let Some(mut inbox) = lifecycle.inbox.take() else {
            return Err(OverseerError::Orchestrator(
                "master inbox is unavailable".to_string(),
            ));
        };

        let shutdown = CancellationToken::new();
        lifecycle
            .loops
            .push(self.monitor.clone().spawn(shutdown.child_token()));

        let this = Arc::clone(self);
        let token = shutdown.child_token();
        lifecycle.inbox_loop = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    next = inbox.recv() => match next {
                        Some(message) => this.handle_message(message),
                        None => break,
                    },
                }
            }
            debug!("Orchestrator: inbox loop stopped");
            inbox
        }));

        if self.config.discovery.enabled {
            lifecycle
                .loops
                .push(self.spawn_discovery(shutdown.child_token()));
        }

        lifecycle.shutdown = Some(shutdown);
        info!(master_id = %self.config.master_id, "Orchestrator: started");
        Ok(())
    }

    fn spawn_discovery(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(period) = this.config.discovery.interval() else {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    report = this.discover() => {
                        debug!(registered = report.registered.len(), "Orchestrator: startup discovery done");
                    }
                }
                return;
            };

            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        this.discover().await;
                    }
                }
            }
        })
    }

    /// Stop every loop and wait for them. Registered agents are told to
    /// shut down when `notify_agents_on_stop` is set. Calling it twice is fine.
    pub async fn stop(&self) {
        let (shutdown, loops, inbox_loop) = {
            let mut lifecycle = self.lifecycle.lock();
            let Some(shutdown) = lifecycle.shutdown.take() else {
                return;
            };
            (
                shutdown,
                std::mem::take(&mut lifecycle.loops),
                lifecycle.inbox_loop.take(),
            )
        };

        info!("Orchestrator: stopping");
        shutdown.cancel();

        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Orchestrator: background loop panicked");
            }
        }
        if let Some(handle) = inbox_loop {
            match handle.await {
                Ok(inbox) => self.lifecycle.lock().inbox = Some(inbox),
                Err(e) => error!(error = %e, "Orchestrator: inbox loop panicked"),
            }
        }

        if self.config.notify_agents_on_stop {
            match Message::shutdown(
                &self.config.master_id,
                "",
                Some("orchestrator stopping".to_string()),
            ) {
                Ok(template) => {
                    let notified = self.router.broadcast_from_master(&template);
                    info!(notified, "Orchestrator: shutdown sent to agents");
                }
                Err(e) => error!(error = %e, "Orchestrator: failed to encode shutdown"),
            }
        }
        info!("Orchestrator: stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overseer_core::ProcessInfo;
    use std::time::Duration;

    struct NoProcesses;

    #[async_trait]
    impl ProcessScanner for NoProcesses {
        async fn scan(&self) -> OverseerResult<Vec<ProcessInfo>> {
            Ok(Vec::new())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::with_process_scanner(OrchestratorConfig::default(), Arc::new(NoProcesses))
            .unwrap()
    }

    fn register_msg(id: &str, caps: &[&str]) -> Message {
        Message::new(
            MessageType::Register,
            id,
            "master",
            serde_json::json!({ "capabilities": caps }),
        )
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = OrchestratorConfig {
            max_agents: 0,
            ..OrchestratorConfig::default()
        };
        let err = Orchestrator::with_process_scanner(config, Arc::new(NoProcesses))
            .err()
            .unwrap();
        assert!(matches!(err, OverseerError::Config(_)));
    }

    #[test]
    fn test_register_message_creates_mailbox() {
        let orch = orchestrator();
        orch.handle_message(register_msg("w-1", &["build"]));
        assert!(orch.agent("w-1").unwrap().can_handle("build"));
        assert!(orch.router().has_mailbox("w-1"));
        assert!(orch.router().claim_mailbox("w-1").is_some());
    }

    #[test]
    fn test_duplicate_register_gets_error_reply() {
        let orch = orchestrator();
        let mut mailbox = orch.register_agent("w-1", ["build"]).unwrap();
        orch.handle_message(register_msg("w-1", &["deploy"]));

        let reply = mailbox.try_recv().unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        assert!(!orch.agent("w-1").unwrap().can_handle("deploy"));
    }

    fn drain(events: &mut broadcast::Receiver<OrchestratorEvent>) -> Vec<OrchestratorEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_master_id_cannot_be_registered() {
        let orch = orchestrator();
        assert_eq!(
            orch.register_agent("master", ["build"]).err(),
            Some(RegistrationError::ReservedId("master".into()))
        );

        orch.handle_message(register_msg("master", &["build"]));
        assert!(orch.agents().is_empty());
        assert!(orch.router().claim_mailbox("master").is_none());
        assert_eq!(
            orch.deliver(register_msg("master", &["build"])),
            Delivery::IllegalRoute
        );
    }

    #[test]
    fn test_refused_register_gets_error_reply() {
        let config = OrchestratorConfig {
            max_agents: 1,
            ..OrchestratorConfig::default()
        };
        let orch = Orchestrator::with_process_scanner(config, Arc::new(NoProcesses)).unwrap();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();

        orch.handle_message(register_msg("w-2", &["build"]));
        assert!(orch.agent("w-2").is_none());

        let mut parked = orch.router().claim_mailbox("w-2").unwrap();
        let reply = parked.try_recv().unwrap();
        assert_eq!(reply.message_type, MessageType::Error);
        let payload: ErrorPayload = reply.payload_as().unwrap();
        assert!(!payload.fatal);
        assert!(payload.message.contains("capacity"));
        assert!(!orch.router().has_mailbox("w-2"));
    }

    #[test]
    fn test_master_role_register_gets_error_reply() {
        let orch = orchestrator();
        orch.handle_message(Message::new(
            MessageType::Register,
            "w-9",
            "master",
            serde_json::json!({ "capabilities": ["build"], "role": "master" }),
        ));
        assert!(orch.agents().is_empty());
        let reply = orch.router().claim_mailbox("w-9").unwrap().try_recv().unwrap();
        let payload: ErrorPayload = reply.payload_as().unwrap();
        assert!(payload.message.contains("master role"));
    }

    #[test]
    fn test_duplicate_register_recovers_unavailable_agent() {
        let orch = orchestrator();
        let mut mailbox = orch.register_agent("w-1", ["build"]).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(60);
        orch.monitor().tick_at(later);
        assert_eq!(orch.agent("w-1").unwrap().status, AgentStatus::Unavailable);

        let mut events = orch.subscribe();
        orch.handle_message(register_msg("w-1", &["build"]));

        assert_eq!(orch.agent("w-1").unwrap().status, AgentStatus::Ready);
        assert!(drain(&mut events).contains(&OrchestratorEvent::AgentStatusChanged {
            agent_id: "w-1".into(),
            from: AgentStatus::Unavailable,
            to: AgentStatus::Ready,
        }));
        assert_eq!(mailbox.try_recv().unwrap().message_type, MessageType::Error);
    }

    #[test]
    fn test_eviction_event_reports_prior_status() {
        let orch = orchestrator();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();
        orch.assign_task(TaskDescriptor::with_id("t-1", "build")).unwrap();

        let mut events = orch.subscribe();
        orch.handle_message(Message::error("w-1", "master", "disk gone", true).unwrap());
        assert!(drain(&mut events).contains(&OrchestratorEvent::AgentStatusChanged {
            agent_id: "w-1".into(),
            from: AgentStatus::Busy,
            to: AgentStatus::Failed,
        }));
    }

    #[test]
    fn test_unknown_sender_is_dropped() {
        let orch = orchestrator();
        orch.handle_message(Message::heartbeat("ghost", "master"));
        assert!(orch.agents().is_empty());
    }

    #[test]
    fn test_health_report_updates_usage() {
        let orch = orchestrator();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();
        let report = Message::with_payload(
            MessageType::HealthReport,
            "w-1",
            "master",
            &HealthReportPayload {
                cpu_percent: 95.0,
                memory_mb: 100.0,
            },
        )
        .unwrap();
        orch.handle_message(report);
        let usage = orch.agent("w-1").unwrap().resource_usage;
        assert_eq!(usage.cpu_percent, 95.0);
        assert_eq!(usage.memory_mb, 100.0);
    }

    #[test]
    fn test_fatal_error_evicts_and_releases() {
        let orch = orchestrator();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();
        orch.assign_task(TaskDescriptor::with_id("t-1", "build")).unwrap();

        orch.handle_message(Message::error("w-1", "master", "GPU lost", true).unwrap());
        assert!(orch.agent("w-1").is_none());
        let status = orch.get_system_status();
        assert_eq!(status.failed_agents, 1);
        assert_eq!(status.active_task_count, 0);
        assert_eq!(orch.recent_outcomes(1)[0].task_id, "t-1");
    }

    #[test]
    fn test_unregister_message() {
        let orch = orchestrator();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();
        orch.handle_message(Message::new(
            MessageType::Unregister,
            "w-1",
            "master",
            serde_json::Value::Null,
        ));
        assert!(orch.agents().is_empty());
        assert!(!orch.router().has_mailbox("w-1"));
    }

    #[test]
    fn test_to_json_shape() {
        let orch = orchestrator();
        let _mb = orch.register_agent("w-1", ["build"]).unwrap();
        orch.assign_task(TaskDescriptor::with_id("t-1", "build"));
        let json = orch.to_json();
        assert_eq!(json["master_id"], "master");
        assert_eq!(json["status"]["busy_agents"], 1);
        assert_eq!(json["agents"][0]["status"], "BUSY");
        assert_eq!(json["assignments"][0]["agent_id"], "w-1");
    }

    #[tokio::test]
    async fn test_start_routes_inbox_and_stop_is_idempotent() {
        let orch = Arc::new(orchestrator());
        let mut worker = orch.register_agent("w-1", ["build"]).unwrap();
        orch.start().unwrap();
        assert!(orch.start().is_err());

        orch.assign_task(TaskDescriptor::with_id("t-1", "build")).unwrap();
        let assignment = worker.recv().await.unwrap();
        let task: TaskDescriptor = assignment.payload_as().unwrap();

        let done = Message::task_status(
            "w-1",
            "master",
            &TaskStatusPayload::completed(task.id, serde_json::json!("ok")),
        )
        .unwrap();
        assert!(orch.deliver(done).is_delivered());

        let mut freed = false;
        for _ in 0..100 {
            if orch.agent("w-1").unwrap().status == AgentStatus::Ready {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed);

        orch.stop().await;
        orch.stop().await;
        assert!(!orch.is_running());

        let shutdown = worker.recv().await.unwrap();
        assert_eq!(shutdown.message_type, MessageType::Shutdown);

        // Restartable after a stop.
        orch.start().unwrap();
        orch.stop().await;
    }
}
