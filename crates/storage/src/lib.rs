//! Storage Layer
//!
//! The supported-PID cache keyed by vehicle identity and the single-writer
//! session logger.

mod cache;
mod logger;

pub use cache::{CacheKey, PidCache, SupportedPidSet};
pub use logger::{AsyncLogger, LogEvent, LoggerConfig, LoggerHandle, SessionSnapshot};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Lock error: {0}")]
    Lock(String),
    #[error("Logger has shut down")]
    LoggerClosed,
    #[error("Logger task failed: {0}")]
    Task(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}
