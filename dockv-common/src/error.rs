//! # Validation Errors
//!
//! Errors raised while building request payloads locally, before anything
//! reaches the wire.

/// Result alias for payload validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// A request payload was rejected before dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// A field had the wrong JSON shape.
    #[error("{field} must be {expected}")]
    InvalidField {
        /// Path of the offending field, e.g. `requests[2].value`.
        field: String,
        /// Human-readable description of the accepted shape.
        expected: &'static str,
    },
    /// A numeric argument was out of range.
    #[error("{field} must be greater than zero")]
    NotPositive {
        /// Name of the argument.
        field: String,
    },
}
