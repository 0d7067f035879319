use thiserror::Error;

#[derive(Debug, Error)]
pub enum BorgUiError {
    #[error("registry error: {0}")]
    Registry(String),

    #[error("job not found: {0}")]
    JobNotFound(u64),

    #[error("mount not found: {0}")]
    MountNotFound(u64),

    #[error("schedule not found: {0}")]
    ScheduleNotFound(u64),

    #[error("invalid cadence '{expr}': {reason}")]
    InvalidCadence { expr: String, reason: String },

    #[error("cache backend error: {0}")]
    Cache(String),

    #[error("settings error: {0}")]
    Settings(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("external command '{command}' failed: {reason}")]
    Command { command: String, reason: String },

    #[error("background task failed: {0}")]
    Join(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<redis::RedisError> for BorgUiError {
    fn from(e: redis::RedisError) -> Self {
        BorgUiError::Cache(e.to_string())
    }
}

impl From<tokio::task::JoinError> for BorgUiError {
    fn from(e: tokio::task::JoinError) -> Self {
        BorgUiError::Join(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BorgUiError>;
