//! Input validation utilities.
//!
//! Small helpers used by configuration validation and the confounds engine to
//! reject invalid numeric parameters before any computation runs.

use crate::core::errors::SpineError;

/// Validates that a float value is finite (not NaN or infinite).
#[inline]
pub fn validate_finite(value: f64, key: &str) -> Result<(), SpineError> {
    if !value.is_finite() {
        return Err(SpineError::config(
            key,
            format!("must be finite, got: {value}"),
        ));
    }
    Ok(())
}

/// Validates that a value is within a specified range (inclusive).
#[inline]
pub fn validate_range<T: PartialOrd + std::fmt::Display>(
    value: T,
    min: T,
    max: T,
    key: &str,
) -> Result<(), SpineError> {
    if value < min || value > max {
        return Err(SpineError::config(
            key,
            format!("must be in range [{min}, {max}], got: {value}"),
        ));
    }
    Ok(())
}

/// Validates that a value is positive (> 0).
#[inline]
pub fn validate_positive<T: PartialOrd + std::fmt::Display + Default>(
    value: T,
    key: &str,
) -> Result<(), SpineError> {
    if value <= T::default() {
        return Err(SpineError::config(
            key,
            format!("must be positive, got: {value}"),
        ));
    }
    Ok(())
}

/// Validates that two slices have the same length.
#[inline]
pub fn validate_same_length<T, U>(
    a: &[T],
    b: &[U],
    name_a: &str,
    name_b: &str,
) -> Result<(), SpineError> {
    if a.len() != b.len() {
        return Err(SpineError::degenerate(format!(
            "length mismatch: {} has {} elements, but {} has {}",
            name_a,
            a.len(),
            name_b,
            b.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_finite() {
        assert!(validate_finite(0.5, "x").is_ok());
        assert!(validate_finite(f64::NAN, "x").is_err());
        assert!(validate_finite(f64::INFINITY, "x").is_err());
    }

    #[test]
    fn test_validate_range() {
        assert!(validate_range(2.5, 0.0, 10.0, "z").is_ok());
        assert!(validate_range(-0.1, 0.0, 10.0, "z").is_err());
        assert!(validate_range(10.1, 0.0, 10.0, "z").is_err());
    }

    #[test]
    fn test_validate_same_length() {
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0];
        assert!(validate_same_length(&a, &a, "fd", "fd").is_ok());
        assert!(validate_same_length(&a, &b, "fd", "dvars").is_err());
    }
}
