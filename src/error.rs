use thiserror::Error;

/// Main error type for the supervision core
#[derive(Error, Debug)]
pub enum SupervisorError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // Worker lifecycle errors
    #[error("Failed to launch worker for slot {slot}: {reason}")]
    Launch { slot: usize, reason: String },

    #[error("Worker {id} exited abnormally (code: {code:?}, signal: {signal:?})")]
    WorkerExit {
        id: u64,
        code: Option<i32>,
        signal: Option<i32>,
    },

    #[error("Worker {id} unresponsive for {silent_ms}ms")]
    WorkerUnresponsive { id: u64, silent_ms: u64 },

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    // Health and recovery errors
    #[error("Health check failed for {component}: {reason}")]
    ComponentCheck { component: String, reason: String },

    #[error("Recovery action failed for {component}: {reason}")]
    RecoveryAction { component: String, reason: String },

    // Shutdown errors
    #[error("Shutdown deadline exceeded with {remaining} still running")]
    ShutdownTimeout { remaining: usize },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Startup errors
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SupervisorError
pub type Result<T> = std::result::Result<T, SupervisorError>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SupervisorError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SupervisorError::ChannelClosed("receiver dropped".to_string())
    }
}

impl SupervisorError {
    /// Whether this error should terminate the process
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SupervisorError::ShutdownTimeout { .. }
                | SupervisorError::Bootstrap(_)
                | SupervisorError::Config(_)
                | SupervisorError::InvalidConfig(_)
        )
    }
}
