use thiserror::Error;

/// Reasons a submitted program is refused before any sandbox is created
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("source is empty")]
    Empty,

    #[error("source contains binary data")]
    Binary,

    #[error("source is {len} bytes, limit is {max}")]
    TooLarge { len: usize, max: usize },

    #[error("missing `{0}` marker")]
    MissingMarker(String),

    #[error("`{first}` must appear before `{second}`")]
    MarkersOutOfOrder { first: String, second: String },
}

/// Failures of the execution machinery itself
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("workspace error: {0}")]
    Workspace(std::io::Error),

    #[error("sandbox could not be started: {0}")]
    Spawn(String),
}

/// Rejections from the admission gate in front of the orchestrator
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("execution queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("execution service is shutting down")]
    ShuttingDown,
}
