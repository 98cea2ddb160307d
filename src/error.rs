//! Error types for the pixel-pulse engine.

/// Top-level error type for the heartbeat engine and its host bridge.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    /// Malformed rule pattern.
    #[error("pattern error: {0}")]
    Pattern(String),

    /// Idle detection facility unavailable.
    #[error("idle query error: {0}")]
    IdleQuery(String),

    /// The in-page capability could not be installed in a tab.
    #[error("injection error: {0}")]
    Injection(String),

    /// Activity invocation failed or the tab disappeared mid-call.
    #[error("execution error: {0}")]
    Execution(String),

    /// Settings or local state persistence failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Host bridge call failed, was rejected, or timed out.
    #[error("host error: {0}")]
    Host(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Referenced rule or tab does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed command payload.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, PulseError>;
