//! Boundary types shared by the Overseer master and its workers.
//!
//! Everything that crosses the master/worker process boundary lives here, so
//! a worker implementation can depend on this crate without pulling in the
//! orchestration engine.
//!
//! # Main types
//!
//! - [`Message`]: Envelope for all inter-process traffic.
//! - [`MessageType`]: The eight message kinds of the protocol.
//! - [`TaskDescriptor`]: A unit of work carried by `TASK_ASSIGNMENT`.
//! - [`TaskStatusPayload`]: Progress/completion report carried by `TASK_STATUS_UPDATE`.
//! - [`OverseerError`]: Unified error enum.
//! - [`OverseerResult`]: Convenience alias for `Result<T, OverseerError>`.

/// Error type and result alias.
pub mod error;
/// Message envelope and constructors.
pub mod message;
/// Typed payloads for each message kind.
pub mod payload;
/// Task descriptors and task states.
pub mod task;

pub use error::{OverseerError, OverseerResult};
pub use message::{Message, MessageType};
pub use payload::{
    AgentRole, ErrorPayload, HealthReportPayload, HeartbeatPayload, ProcessInfo, RegisterPayload,
    ShutdownPayload, TaskStatusPayload,
};
pub use task::{TaskDescriptor, TaskState};
