use thiserror::Error;

/// A convenience `Result` alias using [`SwitchyardError`].
pub type SwitchyardResult<T> = Result<T, SwitchyardError>;

/// Top-level error type for the hub.
///
/// Each variant corresponds to the component that detected the failure.
/// Errors are surfaced as state (task error fields, health status, log
/// entries) at the boundary of the operation that produced them.
#[derive(Error, Debug)]
pub enum SwitchyardError {
    /// Connection registry or transport failure.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A task could not be placed, or a worker could not be reached.
    #[error("Routing error: {0}")]
    Routing(String),

    /// Task lifecycle violation (unknown id, invalid transition, retry budget spent).
    #[error("Task error: {0}")]
    Task(String),

    /// A health probe failed or timed out.
    #[error("Health error: {0}")]
    Health(String),

    /// A recovery action failed.
    #[error("Recovery error: {0}")]
    Recovery(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// Malformed or unexpected wire message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
