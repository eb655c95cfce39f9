//! Controller tuning.
//!
//! Gains are re-read and pushed into the PIDs every tick, so edits to a live
//! config take effect immediately.

use serde::{Deserialize, Serialize};
use vent_control::PidGains;
use vent_cycle::CycleConfig;

/// Tuning for the control cascade plus the embedded breath-cycle config.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    pub cycle: CycleConfig,
    /// Outer-loop volume PID (air band, inspiratory half of volume modes).
    pub volume_gains: PidGains,
    /// Outer-loop pressure PID (air band).
    pub pressure_gains: PidGains,
    /// Oxygen-proportioning-valve PID (oxygen band).
    pub psol_gains: PidGains,
    /// FiO2 trim PID; its output is a bounded correction added to the
    /// feed-forward FiO2 term.
    pub fio2_gains: PidGains,
    /// Inner-loop flow PID.
    pub flow_gains: PidGains,
    /// FiO2 at which control switches from the air-dominant cascade to the
    /// oxygen-valve-dominant loop.
    pub fio2_crossover: f64,
    /// Constant valve opening added for response linearity.
    pub valve_bias: f64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            cycle: CycleConfig::default(),
            volume_gains: PidGains::new(0.75, 20.0, 0.075),
            pressure_gains: PidGains::new(0.4, 20.0, 0.0),
            psol_gains: PidGains::new(0.04, 20.0, 0.0),
            fio2_gains: PidGains::new(4.0, 1.0, 0.0),
            flow_gains: PidGains::new(0.1, 20.0, 0.0),
            fio2_crossover: 0.6,
            valve_bias: 0.05,
        }
    }
}
