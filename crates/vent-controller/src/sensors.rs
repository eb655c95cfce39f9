//! Sensor readings supplied by the caller each tick.

use vent_core::units::{Pressure, VolumeRate};

/// One tick's worth of sensor data. How these are read is the caller's
/// concern; the controller only consumes them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorReadings {
    /// Flow into the patient circuit.
    pub inflow: VolumeRate,
    /// Flow out of the patient circuit.
    pub outflow: VolumeRate,
    /// Patient airway pressure.
    pub patient_pressure: Pressure,
    /// Measured fraction of inspired oxygen in [0, 1].
    pub fio2: f64,
}
