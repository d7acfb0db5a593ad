use thiserror::Error;

/// Convenience type alias for Results with CoScientistError
pub type Result<T> = std::result::Result<T, CoScientistError>;

/// Main error type for the co-scientist core
///
/// This enum represents all failure modes of the coordination substrate:
/// queue capacity, task state machine violations, unknown entities,
/// supervisor resource exhaustion, and persistence problems.
#[derive(Error, Debug)]
pub enum CoScientistError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Queue is full")]
    QueueFull,

    #[error("Queue is full for {band} priority")]
    BandFull { band: &'static str },

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Insufficient resources: {message}")]
    InsufficientResources { message: String },

    #[error("Incompatible snapshot version: found {found}, expected {expected}.x")]
    VersionMismatch { found: String, expected: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoScientistError {
    /// Whether this error came from a missing file, which recovery paths
    /// treat as an empty start rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CoScientistError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
