//! Per-tick state exchanged between the breath machines and the cascade.

use vent_core::units::{cm_h2o, ml, Pressure, Volume, VolumeRate};

/// Which way gas should be moving through the patient circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    Inspiratory,
    Expiratory,
}

/// Inputs to patient-effort detection, derived from the corrected flow
/// integrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreathInputs {
    pub patient_volume: Volume,
    pub net_flow: VolumeRate,
}

/// What the machine should be doing at this instant.
///
/// Exactly the setpoints relevant to the active mode are populated; an unset
/// setpoint means that control axis is not authoritative this tick. The
/// remaining fields echo targets for diagnostics and flag where in the breath
/// we are.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DesiredState {
    pub pressure_setpoint: Option<Pressure>,
    pub volume_setpoint: Option<Volume>,
    pub flow_setpoint: Option<VolumeRate>,
    pub flow_direction: FlowDirection,
    pub pip: Pressure,
    pub peep: Pressure,
    pub psupp: Pressure,
    pub pstep: Pressure,
    pub viv: Volume,
    pub in_exhale: bool,
    pub end_of_breath: bool,
}

impl DesiredState {
    /// State reported while the ventilator is off: no axis is authoritative,
    /// so the cascade fails open.
    pub fn disabled() -> Self {
        Self {
            pressure_setpoint: None,
            volume_setpoint: None,
            flow_setpoint: None,
            flow_direction: FlowDirection::Expiratory,
            pip: cm_h2o(0.0),
            peep: cm_h2o(0.0),
            psupp: cm_h2o(0.0),
            pstep: cm_h2o(0.0),
            viv: ml(0.0),
            in_exhale: false,
            end_of_breath: false,
        }
    }
}
