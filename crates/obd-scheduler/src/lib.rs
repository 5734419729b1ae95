//! OBD-II Acquisition Scheduling
//!
//! The sequential polling loop that turns PID queries into smoothed,
//! published readings, and the heartbeat that keeps the link alive.

mod error;
mod heartbeat;
mod scheduler;

pub use error::SchedulerError;
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatOutcome};
pub use scheduler::{AcquisitionConfig, AcquisitionLoop, PassSummary, ReadingFeed};
