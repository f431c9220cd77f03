//! Error types for the agent pool.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// A malformed job request, rejected before any worker sees it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} is required and must be non-empty")]
    MissingField { field: &'static str },
}

/// Envelope encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Frame(#[from] tokio_util::codec::LinesCodecError),
}

/// Failures raised by the streaming agent-query call.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to spawn {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),

    #[error("Engine panicked: {0}")]
    Panicked(String),
}

/// Pool manager errors.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Pool is shutting down and no longer accepts jobs")]
    ShuttingDown,

    #[error("Pool manager is no longer running")]
    Closed,

    #[error("Worker {worker_id} failed to launch: {reason}")]
    LaunchFailed { worker_id: usize, reason: String },

    #[error("Workers not ready after {waited:?}")]
    ReadyTimeout { waited: Duration },
}

/// Session orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {session_id} not found")]
    NotFound { session_id: String },

    #[error(
        "Session {session_id} has no resume token yet; wait for the first streamed message before continuing"
    )]
    ResumeUnavailable { session_id: String },

    #[error("Session {session_id} is still running; cancel it or wait for completion")]
    Busy { session_id: String },

    #[error("Invalid skill name: {0:?}")]
    InvalidSkill(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result type alias for the agent pool.
pub type Result<T> = std::result::Result<T, Error>;
