//! Master orchestration engine for a pool of worker agents.
//!
//! Keeps an authoritative registry of workers, balances tasks across the
//! healthy idle ones, watches their heartbeats, and routes every message
//! through the master in a star topology.
//!
//! # Main types
//!
//! - [`Orchestrator`]: Owns the registry and runs the background loops.
//! - [`AgentRegistry`]: Agent records and the task assignment map under one lock.
//! - [`LoadBalancer`]: Deterministic pick of the healthiest READY agent.
//! - [`HealthMonitor`]: Heartbeat timeouts, scoring, restart probes, eviction.
//! - [`TaskDispatcher`]: Assignment, status updates, cancellation.
//! - [`MessageRouter`]: Bounded per-recipient mailboxes.
//! - [`Discovery`]: Finds worker processes already running on the host.

/// Agent selection.
pub mod balancer;
/// Orchestrator configuration.
pub mod config;
/// Host process discovery.
pub mod discovery;
/// Task assignment and completion.
pub mod dispatcher;
/// Orchestrator engine and lifecycle.
pub mod engine;
/// Broadcast event stream.
pub mod events;
/// Health scoring and the monitor loop.
pub mod health;
/// Finished task records and sinks.
pub mod outcome;
/// Agent registry and assignment map.
pub mod registry;
/// Star-topology message router.
pub mod router;
/// Agent records, statuses and aggregate status.
pub mod types;

pub use balancer::LoadBalancer;
pub use config::{DiscoveryConfig, HealthPolicy, OrchestratorConfig};
pub use discovery::{DiscoveredAgent, Discovery, DiscoveryReport, ProcessScanner, SysinfoScanner};
pub use dispatcher::{TaskDispatcher, UpdateDisposition};
pub use engine::Orchestrator;
pub use events::{EventBus, OrchestratorEvent, ReleaseReason};
pub use health::{compute_health_score, HealthMonitor, HealthTickReport, MonitorSettings};
pub use outcome::{OutcomeLog, OutcomeSink, OutcomeStatus, TaskOutcome};
pub use registry::{
    AgentRegistry, Assignment, Claim, HeartbeatResult, RegistrationError, ReleaseError, Released,
    Removal, Tally,
};
pub use router::{Delivery, Mailbox, MessageRouter, RouterStats};
pub use types::{AgentRecord, AgentStatus, InvalidTransition, ResourceUsage, StatusChange, SystemStatus};
