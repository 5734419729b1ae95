//! Range Checking for Decoded Readings

use crate::error::ValidationError;
use tracing::debug;

/// Outcome of validating a batch of values
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Whether all values are valid
    pub valid: bool,
    /// List of validation errors
    pub errors: Vec<ValidationError>,
    /// Number of fields validated
    pub fields_checked: usize,
}

impl ValidationResult {
    /// Create a valid result
    pub fn valid(fields_checked: usize) -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            fields_checked,
        }
    }

    /// Create a result from the errors found among `fields_checked` values
    pub fn from_errors(errors: Vec<ValidationError>, fields_checked: usize) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
            fields_checked,
        }
    }
}

/// Checks decoded values against their declared bounds
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a single value; a missing bound is unbounded on that side
    pub fn validate_range(
        &self,
        field: &str,
        value: f64,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Result<(), ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NotFinite {
                field: field.to_string(),
                value,
            });
        }

        let low = min.unwrap_or(f64::NEG_INFINITY);
        let high = max.unwrap_or(f64::INFINITY);
        if value < low || value > high {
            debug!("{} value {} outside [{}, {}]", field, value, low, high);
            Err(ValidationError::OutOfRange {
                field: field.to_string(),
                value,
                min: low,
                max: high,
            })
        } else {
            Ok(())
        }
    }

    /// Validate `(field, value, min, max)` tuples, collecting every failure
    pub fn validate_all<'a, I>(&self, values: I) -> ValidationResult
    where
        I: IntoIterator<Item = (&'a str, f64, Option<f64>, Option<f64>)>,
    {
        let mut checked = 0;
        let errors: Vec<ValidationError> = values
            .into_iter()
            .inspect(|_| checked += 1)
            .filter_map(|(field, value, min, max)| self.validate_range(field, value, min, max).err())
            .collect();

        ValidationResult::from_errors(errors, checked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_inside_range() {
        let validator = Validator::new();
        assert!(validator.validate_range("rpm", 3000.0, Some(0.0), Some(8000.0)).is_ok());
        assert!(validator.validate_range("rpm", 0.0, Some(0.0), Some(8000.0)).is_ok());
        assert!(validator.validate_range("rpm", 8000.0, Some(0.0), Some(8000.0)).is_ok());
    }

    #[test]
    fn test_value_outside_range() {
        let validator = Validator::new();
        let err = validator
            .validate_range("coolant", 250.0, Some(-40.0), Some(215.0))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::OutOfRange {
                field: "coolant".to_string(),
                value: 250.0,
                min: -40.0,
                max: 215.0,
            }
        );
    }

    #[test]
    fn test_open_bounds() {
        let validator = Validator::new();
        assert!(validator.validate_range("x", -1e12, None, Some(0.0)).is_ok());
        assert!(validator.validate_range("x", 1e12, Some(0.0), None).is_ok());
        assert!(validator.validate_range("x", -1.0, Some(0.0), None).is_err());
        assert!(validator.validate_range("x", f64::NAN, None, None).is_err());
    }

    #[test]
    fn test_validate_all_collects_failures() {
        let validator = Validator::new();
        let result = validator.validate_all(vec![
            ("rpm", 900.0, Some(0.0), Some(8000.0)),
            ("speed", 400.0, Some(0.0), Some(255.0)),
            ("load", -3.0, Some(0.0), Some(100.0)),
        ]);
        assert!(!result.valid);
        assert_eq!(result.fields_checked, 3);
        assert_eq!(result.errors.len(), 2);

        assert!(validator.validate_all(Vec::new()).valid);
    }
}
