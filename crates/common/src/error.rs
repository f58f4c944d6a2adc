use thiserror::Error;

/// Common error types used across the application.
///
/// Nothing on the delivery path is fatal: transport, data and state errors are
/// logged by the caller and the affected item is skipped or retried later.
#[derive(Debug, Error)]
pub enum AppError {
    /// Network failure, timeout or non-success status from the messaging endpoint.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A roster row that cannot be turned into a schedulable event.
    #[error("Data error: {0}")]
    Data(String),

    /// A tracker operation that referenced state that does not exist.
    #[error("State error: {0}")]
    State(String),

    #[error("Roster error: {0}")]
    Roster(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Whether the error originated at the transport boundary.
    pub fn is_transport(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
