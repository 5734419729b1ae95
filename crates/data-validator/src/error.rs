//! Validation Error Types

use thiserror::Error;

/// Errors during reading validation
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    /// Value outside the declared range; unbounded sides are infinite
    #[error("{field} value {value} is out of range [{min}, {max}]")]
    OutOfRange {
        field: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// NaN or infinite value
    #[error("{field} value {value} is not finite")]
    NotFinite { field: String, value: f64 },

    /// Smoothing window of size zero
    #[error("Smoothing window must hold at least one value, got {0}")]
    InvalidCapacity(usize),
}
