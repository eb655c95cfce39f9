//! Top layer of the respiratory-control core: sensors in, actuators out.
//!
//! Each tick the [`Controller`] integrates net flow, asks the breath-cycle
//! layer for the desired physical state, runs the mode- and FiO2-dependent
//! PID cascade, and emits actuator commands plus diagnostics. The
//! communication-loss alarm lives here too; it watches message timestamps
//! independently of the breath pipeline.

pub mod actuators;
pub mod alarm;
pub mod config;
pub mod controller;
pub mod error;
pub mod sensors;

pub use actuators::{ActuatorCommand, ActuatorOverrides};
pub use alarm::CommFailAlarm;
pub use config::ControlConfig;
pub use controller::{Controller, ControllerDiagnostics};
pub use error::{ControllerError, ControllerResult};
pub use sensors::SensorReadings;
