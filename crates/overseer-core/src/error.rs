use thiserror::Error;

/// A convenience `Result` alias using [`OverseerError`].
pub type OverseerResult<T> = Result<T, OverseerError>;

/// Top-level error type for the Overseer crates.
///
/// Only [`OverseerError::Config`] is meant to be fatal, and only at startup.
/// Everything that happens to an individual agent is handled as a state
/// transition or a logged drop, never by bubbling one of these up to the
/// process.
#[derive(Error, Debug)]
pub enum OverseerError {
    /// Invalid, unparseable or missing configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The host process scan failed.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Lifecycle misuse of the orchestrator (double start, etc.).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A message payload did not match the shape its type requires.
    #[error("Payload error: {0}")]
    Payload(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
