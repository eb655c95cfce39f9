//! Error types for breath-cycle configuration and parameter validation.

use thiserror::Error;

/// Result type for breath-cycle operations.
pub type CycleResult<T> = Result<T, CycleError>;

/// Errors raised at configuration boundaries. The per-tick path never
/// errors; out-of-range signals are clamped instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CycleError {
    /// Invalid argument provided to a constructor or validator.
    #[error("Invalid argument: {what}")]
    InvalidArg { what: &'static str },
}
