//! Scalar control blocks for the respiratory-control core.
//!
//! This crate provides the numeric building blocks the breath-cycle layer and
//! the actuator cascade are assembled from:
//! - **PID**: single-input/single-output controller with configurable
//!   proportional/derivative computation mode, output clamping, anti-windup,
//!   and live gain updates
//! - **FlowIntegrator**: net flow → cumulative volume, with breath-boundary
//!   drift correction
//! - **FlowTrigger**: dual exponentially-weighted moving averages of net flow,
//!   used to detect patient inspiratory and expiratory effort
//!
//! # Design Principles
//!
//! - Blocks operate on scalar `f64` signals or uom quantities; unit conversion
//!   happens at the caller's boundary
//! - Constructors validate configuration; the per-tick path never errors,
//!   it clamps
//! - All state is owned and mutated by the tick call; there is no interior
//!   mutability and no global state

pub mod error;
pub mod integrator;
pub mod pid;
pub mod trigger;

pub use error::{ControlError, ControlResult};
pub use integrator::FlowIntegrator;
pub use pid::{DifferentialTerm, Pid, PidGains, ProportionalTerm};
pub use trigger::FlowTrigger;
