//! Error types for the hoststats bridge.

use thiserror::Error;

/// Result type alias using [`AgentError`].
pub type Result<T> = std::result::Result<T, AgentError>;

/// Top-level errors of the bridge.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found.
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    /// Configuration parse error.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Malformed broker endpoint URL. Unrecoverable at startup.
    #[error("Invalid broker endpoint '{url}': {reason}")]
    Endpoint { url: String, reason: String },

    /// JSON serialization error.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR serialization error.
    #[error("CBOR serialization error: {0}")]
    Cbor(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A counter source failed for this tick.
    #[error(transparent)]
    Read(#[from] ReadError),

    /// Broker connection or publish failure.
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

impl AgentError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an endpoint error.
    pub fn endpoint(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Endpoint {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for AgentError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        AgentError::Cbor(e.to_string())
    }
}

impl From<json5::Error> for AgentError {
    fn from(e: json5::Error) -> Self {
        AgentError::ConfigParse(e.to_string())
    }
}

/// A counter source could not be opened or its format is unrecognized.
///
/// Fatal for the tick's `flush()`, never for the process: the next
/// scheduled tick retries from scratch.
#[derive(Debug, Error)]
#[error("failed to read {subsystem}: {kind}")]
pub struct ReadError {
    /// Which counter source failed ("cpu", "memory", "swap", "uptime",
    /// "network", "disk").
    pub subsystem: &'static str,
    #[source]
    pub kind: ReadErrorKind,
}

/// Cause of a [`ReadError`].
#[derive(Debug, Error)]
pub enum ReadErrorKind {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("unrecognized format: {0}")]
    Format(String),

    #[error("counter consistency violated: {0}")]
    Consistency(String),
}

impl ReadError {
    pub fn io(subsystem: &'static str, err: std::io::Error) -> Self {
        Self {
            subsystem,
            kind: ReadErrorKind::Io(err),
        }
    }

    pub fn format(subsystem: &'static str, msg: impl Into<String>) -> Self {
        Self {
            subsystem,
            kind: ReadErrorKind::Format(msg.into()),
        }
    }

    pub fn consistency(subsystem: &'static str, msg: impl Into<String>) -> Self {
        Self {
            subsystem,
            kind: ReadErrorKind::Consistency(msg.into()),
        }
    }
}

/// Broker connection errors. Surfaced to the scheduler, logged, and
/// retried on the next tick.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Broker unreachable or connection rejected.
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    /// A publish was attempted with no live connection.
    #[error("not connected")]
    NotConnected,

    /// Mid-session transport failure while publishing.
    #[error("failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },
}
