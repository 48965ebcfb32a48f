use std::time::Duration;

use crate::infrastructure::monitor::MonitorError;
use crate::infrastructure::storage::StorageError;
use crate::infrastructure::synthesizer::SynthesisError;

/// Main application error type
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid dialogue text: {0}")]
    Validation(String),

    #[error("Remote concurrency quota exceeded: {message}")]
    QuotaExceeded {
        message: String,
        /// Recommended backoff before the caller retries.
        retry_after: Duration,
    },

    #[error("Remote server error [{code}]: {payload}")]
    RemoteServer { code: i32, payload: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Task monitor error: {0}")]
    Monitor(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the caller is expected to retry after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}

impl From<SynthesisError> for AppError {
    fn from(err: SynthesisError) -> Self {
        match err {
            SynthesisError::QuotaExceeded(message) => AppError::QuotaExceeded {
                message,
                retry_after: crate::domain::task::QUOTA_BACKOFF,
            },
            SynthesisError::Server { code, payload } => AppError::RemoteServer { code, payload },
            SynthesisError::Transport(msg) => AppError::Transport(msg),
            SynthesisError::NoAudio => AppError::Transport("no audio received".to_string()),
            SynthesisError::Protocol(msg) => AppError::Transport(msg),
        }
    }
}

impl From<MonitorError> for AppError {
    fn from(err: MonitorError) -> Self {
        AppError::Monitor(err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => AppError::NotFound(what),
            other => AppError::Storage(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Custom result type for the application
pub type AppResult<T> = Result<T, AppError>;
