//! Breath-cycle layer of the respiratory-control core.
//!
//! Given clinician-set ventilation parameters and the integrated patient
//! volume/net flow, this crate decides what the machine should be doing right
//! now: which setpoint is authoritative (pressure, volume, or flow), where in
//! the breath we are, and whether the breath just ended.
//!
//! One state machine exists per ventilation mode, enumerated exhaustively in
//! [`BreathFsm`]; [`BreathCycle`] owns the active machine and handles mode
//! switches and breath-to-breath reconstruction.

pub mod config;
pub mod cycle;
pub mod error;
pub mod fsm;
pub mod params;
pub mod state;

pub use config::CycleConfig;
pub use cycle::BreathCycle;
pub use error::{CycleError, CycleResult};
pub use fsm::{BreathFsm, PrvcCarry, Titration};
pub use params::{breath_durations, VentMode, VentParams};
pub use state::{BreathInputs, DesiredState, FlowDirection};
