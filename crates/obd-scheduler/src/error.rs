//! Scheduler Error Types

use data_validator::ValidationError;
use obd_protocol::ObdError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// None of the configured PIDs can be polled
    #[error("Poll set is empty")]
    EmptyPollSet,

    #[error("Invalid acquisition settings: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Obd(#[from] ObdError),
}
