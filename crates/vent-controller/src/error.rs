//! Error types for controller construction.

use thiserror::Error;

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised when building a controller. The per-tick path never
/// errors; actuator outputs are clamped instead.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControllerError {
    #[error(transparent)]
    Core(#[from] vent_core::CoreError),

    #[error(transparent)]
    Control(#[from] vent_control::ControlError),

    #[error(transparent)]
    Cycle(#[from] vent_cycle::CycleError),

    /// Invalid argument provided to a constructor.
    #[error("Invalid argument: {what}")]
    InvalidArg { what: &'static str },
}
