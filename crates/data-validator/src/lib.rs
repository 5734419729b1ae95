//! Reading Validation and Smoothing
//!
//! Range checks for decoded values and the per-PID moving-average buffers
//! used by the acquisition loop.

mod error;
mod smoothing;
mod validator;

pub use error::ValidationError;
pub use smoothing::{SmoothingBuffer, SmoothingSet, DEFAULT_WINDOW};
pub use validator::{ValidationResult, Validator};
