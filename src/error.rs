//! Error types for the harness.

use thiserror::Error;

/// Errors surfaced to test authors.
///
/// Structural failures (nothing registered, nothing matched, channel not
/// ready) are reported here. Failures inside user predicates and auto
/// responders never reach this type; they are logged and absorbed.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// No bucket exists for the request's route key.
    #[error("no handler found for {route_key}; register a mock for this route")]
    Unmocked { route_key: String },

    /// A bucket exists but no matcher and no fallback selected a record.
    #[error("no matching mock for {route_key} ({candidates} candidates checked)")]
    NoMatchingMock { route_key: String, candidates: usize },

    /// The channel was used before the handshake script was installed.
    #[error("message channel is not initialized: call TestEnvironment::setup() before {operation}")]
    ChannelNotInitialized { operation: &'static str },

    /// A facade operation that needs a live page ran before `setup()`.
    #[error("test environment is not set up: call setup() before {operation}")]
    NotSetUp { operation: &'static str },

    /// An awaited event did not arrive in time.
    #[error("timed out after {timeout_ms}ms waiting for event {topic}")]
    EventTimeout { topic: String, timeout_ms: u64 },

    /// The URL handed to a registration function cannot be keyed.
    #[error("invalid route url {url:?}: {reason}")]
    InvalidRoute { url: String, reason: String },

    /// The browser automation collaborator failed.
    #[error("page driver error: {0}")]
    Driver(#[source] anyhow::Error),

    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = HarnessError> = std::result::Result<T, E>;
