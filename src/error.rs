use thiserror::Error;

/// Main error type for the supervisor
#[derive(Error, Debug)]
pub enum HatcheryError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Validation errors
    #[error("{0}")]
    Validation(String),

    // Worker errors
    #[error("Worker {id} failed to start: {reason}")]
    WorkerStart { id: String, reason: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Task errors
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Supervisor is shutting down")]
    ShuttingDown,
}

impl HatcheryError {
    /// True for errors caused by the caller's input rather than the system
    pub fn is_validation(&self) -> bool {
        matches!(self, HatcheryError::Validation(_))
    }
}

/// Result type alias for HatcheryError
pub type Result<T> = std::result::Result<T, HatcheryError>;
