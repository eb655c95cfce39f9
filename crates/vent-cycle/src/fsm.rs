//! Breath-phase state machines, one per ventilation mode.
//!
//! Each machine is constructed at the start of a breath from the clinician
//! parameters and exposes `desired_state(now, inputs, config)`. The common
//! shape: while `now < inspire_end` the machine ramps its setpoint from the
//! expiratory baseline to the inspiratory target over the configured rise
//! time and then holds; past `inspire_end` it holds the expiratory baseline
//! and reports end-of-breath at `expire_end` or on patient effort.
//!
//! Patient-trigger transitions move the phase deadlines explicitly inside
//! the step function; that is the only mutation a step performs.

use uom::si::ratio::ratio;
use vent_control::FlowTrigger;
use vent_core::units::{ml, ml_per_sec, Duration, Pressure, Volume, VolumeRate};
use vent_core::TimePoint;

use crate::config::CycleConfig;
use crate::params::{breath_durations, VentMode, VentParams};
use crate::state::{BreathInputs, DesiredState, FlowDirection};

/// Deadband around the volume target inside which PRVC leaves its pressure
/// unchanged.
const PRVC_DEADBAND_ML: f64 = 10.0;

fn rise_frac(now: TimePoint, start: TimePoint, rise_time: Duration) -> f64 {
    ((now - start) / rise_time).get::<ratio>().clamp(0.0, 1.0)
}

/// Patient-inspiration detection, shared by the assist-capable machines.
///
/// Only runs once inspiration is over and net flow is non-negative; a
/// detection counts only after the minimum expiratory dwell has elapsed.
fn patient_inspiring(
    trigger: &mut FlowTrigger,
    now: TimePoint,
    inputs: &BreathInputs,
    inspire_end: TimePoint,
    dwell: Duration,
) -> bool {
    if now < inspire_end || inputs.net_flow < ml_per_sec(0.0) {
        return false;
    }
    trigger.observe(inputs.net_flow);
    now >= inspire_end + dwell && trigger.inspiration_detected()
}

/// Patient-exhalation detection, used during inspiration by the
/// pressure-support-capable machines.
fn patient_exhaling(
    trigger: &mut FlowTrigger,
    now: TimePoint,
    inputs: &BreathInputs,
    start_time: TimePoint,
) -> bool {
    if now < start_time || inputs.net_flow < ml_per_sec(0.0) {
        return false;
    }
    trigger.observe(inputs.net_flow);
    trigger.exhalation_detected()
}

/// Outcome of effort detection in the SIMV modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimvTrigger {
    None,
    /// Effort close to the end of the mandatory window: deliver the next
    /// mandatory breath now instead of a support sub-breath.
    Mandatory,
    /// Effort with enough of the window left: run a pressure-support
    /// sub-breath within this cycle.
    PressureSupport,
}

/// Ventilator off. Reports no authoritative setpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct OffFsm;

impl OffFsm {
    pub fn desired_state(&mut self) -> DesiredState {
        DesiredState::disabled()
    }
}

/// Pressure Control: mandatory pressure breaths on a fixed schedule.
#[derive(Debug, Clone)]
pub struct PressureControlFsm {
    inspire_pressure: Pressure,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
}

impl PressureControlFsm {
    pub fn new(now: TimePoint, params: &VentParams) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_pressure: params.pip,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        _inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure
                        + (self.inspire_pressure - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                ..DesiredState::disabled()
            }
        } else {
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: now >= self.expire_end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Pressure Assist: like Pressure Control, but patient effort during
/// expiration starts the next breath early.
#[derive(Debug, Clone)]
pub struct PressureAssistFsm {
    inspire_pressure: Pressure,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_deadline: TimePoint,
    trigger: FlowTrigger,
}

impl PressureAssistFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_pressure: params.pip,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_deadline: now + inspire + expire,
            trigger,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure
                        + (self.inspire_pressure - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                ..DesiredState::disabled()
            }
        } else {
            let end = now >= self.expire_deadline
                || patient_inspiring(
                    &mut self.trigger,
                    now,
                    inputs,
                    self.inspire_end,
                    config.min_expire_dwell(),
                );
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// High-flow nasal cannula: constant flow, no pressure or volume axis.
#[derive(Debug, Clone)]
pub struct HfncFsm {
    needed_flow: VolumeRate,
    inspire_end: TimePoint,
    expire_end: TimePoint,
}

impl HfncFsm {
    pub fn new(now: TimePoint, params: &VentParams) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            needed_flow: params.flow,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
        }
    }

    pub fn desired_state(&mut self, now: TimePoint, _inputs: &BreathInputs) -> DesiredState {
        if now < self.inspire_end {
            DesiredState {
                flow_setpoint: Some(self.needed_flow),
                flow_direction: FlowDirection::Inspiratory,
                ..DesiredState::disabled()
            }
        } else {
            DesiredState {
                flow_setpoint: Some(self.needed_flow),
                flow_direction: FlowDirection::Expiratory,
                in_exhale: true,
                end_of_breath: now >= self.expire_end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Volume Control: mandatory volume breaths on a fixed schedule.
#[derive(Debug, Clone)]
pub struct VolumeControlFsm {
    inspire_volume: Volume,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
}

impl VolumeControlFsm {
    pub fn new(now: TimePoint, params: &VentParams) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_volume: params.viv,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        _inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                volume_setpoint: Some(self.inspire_volume * frac),
                flow_direction: FlowDirection::Inspiratory,
                viv: self.inspire_volume,
                ..DesiredState::disabled()
            }
        } else {
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                volume_setpoint: Some(self.inspire_volume),
                flow_direction: FlowDirection::Expiratory,
                peep: self.expire_pressure,
                viv: self.inspire_volume,
                in_exhale: true,
                end_of_breath: now >= self.expire_end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// CPAP: constant flow during inspiration, pressure held at PEEP during
/// expiration.
#[derive(Debug, Clone)]
pub struct CpapFsm {
    needed_flow: VolumeRate,
    expire_pressure: Pressure,
    inspire_end: TimePoint,
    expire_end: TimePoint,
}

impl CpapFsm {
    pub fn new(now: TimePoint, params: &VentParams) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            needed_flow: params.flow,
            expire_pressure: params.peep,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
        }
    }

    pub fn desired_state(&mut self, now: TimePoint, _inputs: &BreathInputs) -> DesiredState {
        if now < self.inspire_end {
            DesiredState {
                flow_setpoint: Some(self.needed_flow),
                flow_direction: FlowDirection::Inspiratory,
                ..DesiredState::disabled()
            }
        } else {
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_setpoint: Some(self.needed_flow),
                flow_direction: FlowDirection::Expiratory,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: now >= self.expire_end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Volume Assist: Volume Control plus patient triggering during expiration.
#[derive(Debug, Clone)]
pub struct VolumeAssistFsm {
    inspire_volume: Volume,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    trigger: FlowTrigger,
}

impl VolumeAssistFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_volume: params.viv,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            trigger,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                volume_setpoint: Some(self.inspire_volume * frac),
                flow_direction: FlowDirection::Inspiratory,
                viv: self.inspire_volume,
                ..DesiredState::disabled()
            }
        } else {
            let end = now >= self.expire_end
                || patient_inspiring(
                    &mut self.trigger,
                    now,
                    inputs,
                    self.inspire_end,
                    config.min_expire_dwell(),
                );
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                volume_setpoint: Some(self.inspire_volume),
                flow_direction: FlowDirection::Expiratory,
                peep: self.expire_pressure,
                viv: self.inspire_volume,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Pressure Support: pressure breaths at the support level, with patient
/// exhale shortening inspiration and patient effort triggering the next
/// breath.
#[derive(Debug, Clone)]
pub struct PressureSupportFsm {
    psupp: Pressure,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    trigger: FlowTrigger,
}

impl PressureSupportFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            psupp: params.psupp,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            trigger,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            if patient_exhaling(&mut self.trigger, now, inputs, self.start_time) {
                self.inspire_end = now;
            }
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure + (self.psupp - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.psupp,
                peep: self.expire_pressure,
                ..DesiredState::disabled()
            }
        } else {
            let end = now >= self.expire_end
                || patient_inspiring(
                    &mut self.trigger,
                    now,
                    inputs,
                    self.inspire_end,
                    config.min_expire_dwell(),
                );
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.psupp,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// SIMV pressure control: mandatory pressure breaths plus pressure-support
/// sub-breaths for patient effort mid-window.
#[derive(Debug, Clone)]
pub struct SimvPcFsm {
    inspire_pressure: Pressure,
    expire_pressure: Pressure,
    psupp: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    inspire_duration: Duration,
    trigger: FlowTrigger,
}

impl SimvPcFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_pressure: params.pip,
            expire_pressure: params.peep,
            psupp: params.psupp,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            inspire_duration: inspire,
            trigger,
        }
    }

    fn patient_effort(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> SimvTrigger {
        if now < self.inspire_end || inputs.net_flow < ml_per_sec(0.0) {
            return SimvTrigger::None;
        }
        self.trigger.observe(inputs.net_flow);
        if now >= self.inspire_end + config.min_expire_dwell()
            && self.trigger.inspiration_detected()
        {
            // Effort at the border of the mandatory window becomes the next
            // mandatory breath; a support sub-breath would not fit.
            if self.expire_end < now + self.inspire_duration + self.inspire_duration {
                SimvTrigger::Mandatory
            } else {
                SimvTrigger::PressureSupport
            }
        } else {
            SimvTrigger::None
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            if patient_exhaling(&mut self.trigger, now, inputs, self.start_time) {
                self.inspire_end = now;
            }
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure
                        + (self.inspire_pressure - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                psupp: self.psupp,
                ..DesiredState::disabled()
            }
        } else {
            let mut end = now >= self.expire_end;
            if !end {
                match self.patient_effort(now, inputs, config) {
                    SimvTrigger::Mandatory => end = true,
                    SimvTrigger::PressureSupport => {
                        self.inspire_end = now + self.inspire_duration;
                        self.inspire_pressure = self.psupp;
                    }
                    SimvTrigger::None => {}
                }
            }
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// SIMV volume control: mandatory volume breaths plus pressure-support
/// sub-breaths; a support sub-breath rides the pressure-support ramp while
/// the volume target stays echoed.
#[derive(Debug, Clone)]
pub struct SimvVcFsm {
    inspire_volume: Volume,
    expire_pressure: Pressure,
    psupp: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    inspire_duration: Duration,
    pressure_support: bool,
    trigger: FlowTrigger,
}

impl SimvVcFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_volume: params.viv,
            expire_pressure: params.peep,
            psupp: params.psupp,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            inspire_duration: inspire,
            pressure_support: false,
            trigger,
        }
    }

    fn patient_effort(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> SimvTrigger {
        if now < self.inspire_end || inputs.net_flow < ml_per_sec(0.0) {
            return SimvTrigger::None;
        }
        self.trigger.observe(inputs.net_flow);
        if now >= self.inspire_end + config.min_expire_dwell()
            && self.trigger.inspiration_detected()
        {
            if self.expire_end < now + self.inspire_duration + self.inspire_duration {
                SimvTrigger::Mandatory
            } else {
                SimvTrigger::PressureSupport
            }
        } else {
            SimvTrigger::None
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            if patient_exhaling(&mut self.trigger, now, inputs, self.start_time) {
                self.inspire_end = now;
            }
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(self.psupp * frac),
                volume_setpoint: Some(self.inspire_volume * frac),
                flow_direction: FlowDirection::Inspiratory,
                psupp: self.psupp,
                viv: self.inspire_volume,
                in_exhale: self.pressure_support,
                ..DesiredState::disabled()
            }
        } else {
            let mut end = now >= self.expire_end;
            if !end {
                match self.patient_effort(now, inputs, config) {
                    SimvTrigger::Mandatory => end = true,
                    SimvTrigger::PressureSupport => {
                        self.inspire_end = now + self.inspire_duration;
                        self.pressure_support = true;
                    }
                    SimvTrigger::None => {}
                }
            }
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                volume_setpoint: Some(self.inspire_volume),
                flow_direction: FlowDirection::Expiratory,
                peep: self.expire_pressure,
                viv: self.inspire_volume,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// BIPAP: pressure breaths where patient effort during expiration retriggers
/// a full breath immediately.
#[derive(Debug, Clone)]
pub struct BipapFsm {
    inspire_pressure: Pressure,
    expire_pressure: Pressure,
    psupp: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    trigger: FlowTrigger,
}

impl BipapFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            inspire_pressure: params.pip,
            expire_pressure: params.peep,
            psupp: params.psupp,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            trigger,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            if patient_exhaling(&mut self.trigger, now, inputs, self.start_time) {
                self.inspire_end = now;
            }
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure
                        + (self.inspire_pressure - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                psupp: self.psupp,
                ..DesiredState::disabled()
            }
        } else {
            // A patient trigger ends this breath; the supervisor starts the
            // next one at the current instant.
            let end = now >= self.expire_end
                || patient_inspiring(
                    &mut self.trigger,
                    now,
                    inputs,
                    self.inspire_end,
                    config.min_expire_dwell(),
                );
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.inspire_pressure,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Direction of the next PRVC pressure adjustment, decided once per breath
/// at the start of expiration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Titration {
    NotEvaluated,
    Within,
    Under,
    Over,
}

/// Titration state handed from one PRVC breath to the next across
/// reconstruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrvcCarry {
    pub user_pip: Pressure,
    pub correction: Pressure,
    pub titration: Titration,
}

/// Pressure-regulated volume control: pressure breaths whose inspiratory
/// pressure is auto-titrated one step per breath toward the volume target.
#[derive(Debug, Clone)]
pub struct PrvcFsm {
    user_pip: Pressure,
    expire_pressure: Pressure,
    pstep: Pressure,
    inspire_volume: Volume,
    correction: Pressure,
    titration: Titration,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
}

impl PrvcFsm {
    /// The carry from the previous breath, if any, seeds the titrated
    /// pressure; it is discarded when the clinician changed PIP in between.
    pub fn new(now: TimePoint, params: &VentParams, carry: Option<PrvcCarry>) -> Self {
        let (inspire, expire) = breath_durations(params);
        let user_pip = params.pip;
        let correction = match carry {
            Some(c) if c.user_pip == user_pip => match c.titration {
                Titration::Under => c.correction + params.pstep,
                Titration::Over => c.correction - params.pstep,
                Titration::Within | Titration::NotEvaluated => c.correction,
            },
            _ => user_pip,
        };
        Self {
            user_pip,
            expire_pressure: params.peep,
            pstep: params.pstep,
            inspire_volume: params.viv,
            correction,
            titration: Titration::NotEvaluated,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
        }
    }

    pub fn carry(&self) -> PrvcCarry {
        PrvcCarry {
            user_pip: self.user_pip,
            correction: self.correction,
            titration: self.titration,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure + (self.correction - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.user_pip,
                peep: self.expire_pressure,
                pstep: self.pstep,
                viv: self.inspire_volume,
                ..DesiredState::disabled()
            }
        } else {
            // Compare delivered volume to target once, at the first
            // expiratory tick, when lung volume peaks.
            if self.titration == Titration::NotEvaluated {
                self.titration = if inputs.patient_volume
                    > self.inspire_volume + ml(PRVC_DEADBAND_ML)
                {
                    Titration::Over
                } else if inputs.patient_volume < self.inspire_volume - ml(PRVC_DEADBAND_ML) {
                    Titration::Under
                } else {
                    Titration::Within
                };
            }
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.user_pip,
                peep: self.expire_pressure,
                pstep: self.pstep,
                viv: self.inspire_volume,
                in_exhale: true,
                end_of_breath: now >= self.expire_end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// Spontaneous ventilation: pressure support breaths where patient effort
/// during expiration retriggers a full breath immediately.
#[derive(Debug, Clone)]
pub struct SpontaneousFsm {
    psupp: Pressure,
    expire_pressure: Pressure,
    start_time: TimePoint,
    inspire_end: TimePoint,
    expire_end: TimePoint,
    trigger: FlowTrigger,
}

impl SpontaneousFsm {
    pub fn new(now: TimePoint, params: &VentParams, trigger: FlowTrigger) -> Self {
        let (inspire, expire) = breath_durations(params);
        Self {
            psupp: params.psupp,
            expire_pressure: params.peep,
            start_time: now,
            inspire_end: now + inspire,
            expire_end: now + inspire + expire,
            trigger,
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        if now < self.inspire_end {
            if patient_exhaling(&mut self.trigger, now, inputs, self.start_time) {
                self.inspire_end = now;
            }
            let frac = rise_frac(now, self.start_time, config.rise_time());
            DesiredState {
                pressure_setpoint: Some(
                    self.expire_pressure + (self.psupp - self.expire_pressure) * frac,
                ),
                flow_direction: FlowDirection::Inspiratory,
                pip: self.psupp,
                peep: self.expire_pressure,
                ..DesiredState::disabled()
            }
        } else {
            let end = now >= self.expire_end
                || patient_inspiring(
                    &mut self.trigger,
                    now,
                    inputs,
                    self.inspire_end,
                    config.min_expire_dwell(),
                );
            DesiredState {
                pressure_setpoint: Some(self.expire_pressure),
                flow_direction: FlowDirection::Expiratory,
                pip: self.psupp,
                peep: self.expire_pressure,
                in_exhale: true,
                end_of_breath: end,
                ..DesiredState::disabled()
            }
        }
    }
}

/// The active breath machine, one variant per ventilation mode.
///
/// The closed enum makes adding a mode a compile-time-checked change at
/// every dispatch site.
#[derive(Debug, Clone)]
pub enum BreathFsm {
    Off(OffFsm),
    PressureControl(PressureControlFsm),
    PressureAssist(PressureAssistFsm),
    Hfnc(HfncFsm),
    VolumeControl(VolumeControlFsm),
    Cpap(CpapFsm),
    VolumeAssist(VolumeAssistFsm),
    PressureSupport(PressureSupportFsm),
    SimvPc(SimvPcFsm),
    SimvVc(SimvVcFsm),
    Bipap(BipapFsm),
    Prvc(PrvcFsm),
    Spontaneous(SpontaneousFsm),
}

impl BreathFsm {
    pub fn off() -> Self {
        BreathFsm::Off(OffFsm)
    }

    /// Build the machine for a new breath starting at `now`. `trigger` is a
    /// fresh effort detector; `prvc_carry` threads titration state between
    /// consecutive PRVC breaths.
    pub fn for_mode(
        now: TimePoint,
        params: &VentParams,
        trigger: FlowTrigger,
        prvc_carry: Option<PrvcCarry>,
    ) -> Self {
        match params.mode {
            VentMode::Off => BreathFsm::Off(OffFsm),
            VentMode::PressureControl => {
                BreathFsm::PressureControl(PressureControlFsm::new(now, params))
            }
            VentMode::PressureAssist => {
                BreathFsm::PressureAssist(PressureAssistFsm::new(now, params, trigger))
            }
            VentMode::Hfnc => BreathFsm::Hfnc(HfncFsm::new(now, params)),
            VentMode::VolumeControl => {
                BreathFsm::VolumeControl(VolumeControlFsm::new(now, params))
            }
            VentMode::Cpap => BreathFsm::Cpap(CpapFsm::new(now, params)),
            VentMode::VolumeAssist => {
                BreathFsm::VolumeAssist(VolumeAssistFsm::new(now, params, trigger))
            }
            VentMode::PressureSupport => {
                BreathFsm::PressureSupport(PressureSupportFsm::new(now, params, trigger))
            }
            VentMode::SimvPc => BreathFsm::SimvPc(SimvPcFsm::new(now, params, trigger)),
            VentMode::SimvVc => BreathFsm::SimvVc(SimvVcFsm::new(now, params, trigger)),
            VentMode::Bipap => BreathFsm::Bipap(BipapFsm::new(now, params, trigger)),
            VentMode::Prvc => BreathFsm::Prvc(PrvcFsm::new(now, params, prvc_carry)),
            VentMode::Spontaneous => {
                BreathFsm::Spontaneous(SpontaneousFsm::new(now, params, trigger))
            }
        }
    }

    pub fn desired_state(
        &mut self,
        now: TimePoint,
        inputs: &BreathInputs,
        config: &CycleConfig,
    ) -> DesiredState {
        match self {
            BreathFsm::Off(f) => f.desired_state(),
            BreathFsm::PressureControl(f) => f.desired_state(now, inputs, config),
            BreathFsm::PressureAssist(f) => f.desired_state(now, inputs, config),
            BreathFsm::Hfnc(f) => f.desired_state(now, inputs),
            BreathFsm::VolumeControl(f) => f.desired_state(now, inputs, config),
            BreathFsm::Cpap(f) => f.desired_state(now, inputs),
            BreathFsm::VolumeAssist(f) => f.desired_state(now, inputs, config),
            BreathFsm::PressureSupport(f) => f.desired_state(now, inputs, config),
            BreathFsm::SimvPc(f) => f.desired_state(now, inputs, config),
            BreathFsm::SimvVc(f) => f.desired_state(now, inputs, config),
            BreathFsm::Bipap(f) => f.desired_state(now, inputs, config),
            BreathFsm::Prvc(f) => f.desired_state(now, inputs, config),
            BreathFsm::Spontaneous(f) => f.desired_state(now, inputs, config),
        }
    }

    pub fn is_off(&self) -> bool {
        matches!(self, BreathFsm::Off(_))
    }

    /// Titration state to thread into the next breath, present only for PRVC.
    pub fn prvc_carry(&self) -> Option<PrvcCarry> {
        match self {
            BreathFsm::Prvc(f) => Some(f.carry()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uom::si::pressure::centimeter_of_water;
    use vent_core::units::{cm_h2o, liters_per_min, ml_per_sec, secs};

    fn t(s: f64) -> TimePoint {
        TimePoint::from_startup(secs(s))
    }

    fn params(mode: VentMode) -> VentParams {
        VentParams {
            mode,
            pip: cm_h2o(20.0),
            peep: cm_h2o(5.0),
            psupp: cm_h2o(10.0),
            pstep: cm_h2o(1.0),
            viv: ml(500.0),
            flow: liters_per_min(30.0),
            breaths_per_min: 20.0,
            ie_ratio: 0.5,
            fio2: 0.21,
        }
    }

    fn quiet() -> BreathInputs {
        BreathInputs {
            patient_volume: ml(0.0),
            net_flow: ml_per_sec(0.0),
        }
    }

    fn inputs(flow_ml_per_sec: f64) -> BreathInputs {
        BreathInputs {
            patient_volume: ml(0.0),
            net_flow: ml_per_sec(flow_ml_per_sec),
        }
    }

    fn trigger() -> FlowTrigger {
        let c = CycleConfig::default();
        FlowTrigger::new(c.loop_period(), c.trigger_threshold(), c.exhale_threshold()).unwrap()
    }

    fn setpoint_cm_h2o(s: &DesiredState) -> f64 {
        s.pressure_setpoint.unwrap().get::<centimeter_of_water>()
    }

    #[test]
    fn pressure_control_phases_and_end_of_breath() {
        let config = CycleConfig::default();
        let p = params(VentMode::PressureControl);
        let mut fsm = PressureControlFsm::new(t(0.0), &p);

        // Mid-ramp at 50 ms: halfway from PEEP 5 to PIP 20.
        let s = fsm.desired_state(t(0.05), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 12.5).abs() < 1e-9);
        assert!(!s.in_exhale);

        // Past the 100 ms rise: held at PIP.
        let s = fsm.desired_state(t(0.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 20.0).abs() < 1e-9);

        // Expiration holds PEEP; breath ends at 3 s (bpm=20, I:E=0.5).
        let s = fsm.desired_state(t(1.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 5.0).abs() < 1e-9);
        assert!(s.in_exhale);
        assert!(!s.end_of_breath);
        let s = fsm.desired_state(t(3.0), &quiet(), &config);
        assert!(s.end_of_breath);
    }

    #[test]
    fn rise_ramp_is_monotonic_and_saturates() {
        let config = CycleConfig::default();
        let p = params(VentMode::PressureControl);
        let mut fsm = PressureControlFsm::new(t(0.0), &p);
        let mut prev = f64::NEG_INFINITY;
        for i in 0..20 {
            let s = fsm.desired_state(t(0.01 * i as f64), &quiet(), &config);
            let sp = setpoint_cm_h2o(&s);
            assert!(sp >= prev);
            prev = sp;
        }
        // From 100 ms on the ramp is exactly done.
        for i in 10..20 {
            let s = fsm.desired_state(t(0.01 * i as f64), &quiet(), &config);
            assert!((setpoint_cm_h2o(&s) - 20.0).abs() < 1e-9);
        }
    }

    #[test]
    fn volume_control_ramps_volume() {
        let config = CycleConfig::default();
        let p = params(VentMode::VolumeControl);
        let mut fsm = VolumeControlFsm::new(t(0.0), &p);
        let s = fsm.desired_state(t(0.05), &quiet(), &config);
        let v = s.volume_setpoint.unwrap();
        assert!((v.get::<uom::si::volume::milliliter>() - 250.0).abs() < 1e-9);
        assert!(s.pressure_setpoint.is_none());

        let s = fsm.desired_state(t(1.5), &quiet(), &config);
        assert_eq!(s.volume_setpoint, Some(ml(500.0)));
        assert!((setpoint_cm_h2o(&s) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn hfnc_only_uses_the_flow_axis() {
        let p = params(VentMode::Hfnc);
        let mut fsm = HfncFsm::new(t(0.0), &p);
        for at in [0.05, 1.5] {
            let s = fsm.desired_state(t(at), &quiet());
            assert!(s.pressure_setpoint.is_none());
            assert!(s.volume_setpoint.is_none());
            assert_eq!(s.flow_setpoint, Some(liters_per_min(30.0)));
        }
    }

    #[test]
    fn assist_trigger_respects_expiratory_dwell() {
        let config = CycleConfig::default();
        let p = params(VentMode::PressureAssist);
        let mut fsm = PressureAssistFsm::new(t(0.0), &p, trigger());

        // Expiration starts at 1.0 s. Settle the averages on a small dwell
        // flow, then step to strong inspiratory flow at 1.2 s. Detection
        // happens within a few ticks but must be held until 1.25 s.
        let mut triggered_at = None;
        for i in 0..60 {
            let now = t(1.0 + 0.01 * i as f64);
            let flow = if i < 20 { 50.0 } else { 600.0 };
            let s = fsm.desired_state(now, &inputs(flow), &config);
            if s.end_of_breath {
                triggered_at = Some(now);
                break;
            }
        }
        let fired = triggered_at.unwrap();
        assert!(fired >= t(1.25), "triggered before minimum dwell");
        assert!(fired < t(1.35), "trigger too slow");
    }

    #[test]
    fn assist_never_triggers_on_flat_flow() {
        let config = CycleConfig::default();
        let p = params(VentMode::VolumeAssist);
        let mut fsm = VolumeAssistFsm::new(t(0.0), &p, trigger());
        for i in 0..190 {
            let s = fsm.desired_state(t(1.0 + 0.01 * i as f64), &inputs(50.0), &config);
            assert!(!s.end_of_breath);
        }
        // Scheduled end still happens.
        let s = fsm.desired_state(t(3.0), &inputs(50.0), &config);
        assert!(s.end_of_breath);
    }

    #[test]
    fn pressure_support_exhale_ends_inspiration_early() {
        let config = CycleConfig::default();
        let p = params(VentMode::PressureSupport);
        let mut fsm = PressureSupportFsm::new(t(0.0), &p, trigger());

        // Strong sustained inspiratory flow settles both averages high.
        for i in 0..50 {
            let s = fsm.desired_state(t(0.01 * i as f64), &inputs(800.0), &config);
            assert!(!s.in_exhale);
        }
        // Flow collapses: the machine should cut inspiration short well
        // before the scheduled 1.0 s.
        let mut exhaled = false;
        for i in 50..70 {
            let s = fsm.desired_state(t(0.01 * i as f64), &inputs(0.0), &config);
            if s.in_exhale {
                exhaled = true;
                break;
            }
        }
        assert!(exhaled, "inspiration never shortened");
    }

    // SIMV timing for the tie-break tests: bpm=6, I:E=0.25 gives a 10 s
    // breath with 2 s inspiration and 8 s expiration.
    fn simv_params(mode: VentMode) -> VentParams {
        let mut p = params(mode);
        p.breaths_per_min = 6.0;
        p.ie_ratio = 0.25;
        p
    }

    fn run_simv_effort(fsm: &mut SimvPcFsm, config: &CycleConfig, step_at: f64) -> Vec<(f64, DesiredState)> {
        // Settle on dwell flow from 2.0 s, step to strong flow at `step_at`,
        // recording states for 0.5 s past the step.
        let mut out = Vec::new();
        let mut now = 2.0;
        while now < step_at + 0.5 {
            let flow = if now < step_at { 50.0 } else { 600.0 };
            let s = fsm.desired_state(t(now), &inputs(flow), config);
            out.push((now, s));
            if s.end_of_breath {
                break;
            }
            now += 0.01;
        }
        out
    }

    #[test]
    fn simv_mid_window_effort_starts_support_sub_breath() {
        let config = CycleConfig::default();
        let p = simv_params(VentMode::SimvPc);
        let mut fsm = SimvPcFsm::new(t(0.0), &p, trigger());
        let states = run_simv_effort(&mut fsm, &config, 3.0);

        // Effort at ~3 s: expire_end (10 s) is not within two inspiratory
        // durations (3 + 4 = 7 s), so this becomes a support sub-breath, not
        // an end of breath.
        assert!(states.iter().all(|(_, s)| !s.end_of_breath));
        // The sub-breath delivers the support pressure on the pressure axis.
        let (_, last) = states.last().unwrap();
        assert!(!last.in_exhale);
        assert!((setpoint_cm_h2o(last) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn simv_effort_at_window_border_becomes_mandatory_breath() {
        let config = CycleConfig::default();
        let p = simv_params(VentMode::SimvPc);
        let mut fsm = SimvPcFsm::new(t(0.0), &p, trigger());
        // Effort at ~8 s: 10 < 8 + 4, so the trigger ends the breath and the
        // supervisor will start the next mandatory cycle.
        let states = run_simv_effort(&mut fsm, &config, 8.0);
        let (at, last) = states.last().unwrap();
        assert!(last.end_of_breath);
        assert!(*at >= 8.0 && *at < 8.2);
    }

    #[test]
    fn simv_vc_support_sub_breath_rides_the_support_ramp() {
        let config = CycleConfig::default();
        let p = simv_params(VentMode::SimvVc);
        let mut fsm = SimvVcFsm::new(t(0.0), &p, trigger());
        // Settle, then effort at 3 s.
        let mut now = 2.0;
        let mut state = None;
        while now < 3.5 {
            let flow = if now < 3.0 { 50.0 } else { 600.0 };
            let s = fsm.desired_state(t(now), &inputs(flow), &config);
            assert!(!s.end_of_breath);
            state = Some(s);
            now += 0.01;
        }
        let s = state.unwrap();
        // Back in the inspiratory branch, flagged as a support sub-breath.
        assert!(s.in_exhale);
        assert_eq!(s.flow_direction, FlowDirection::Inspiratory);
        assert!((setpoint_cm_h2o(&s) - 10.0).abs() < 1e-9);
        assert_eq!(s.volume_setpoint, Some(ml(500.0)));
    }

    #[test]
    fn prvc_titrates_one_step_per_breath() {
        let config = CycleConfig::default();
        let p = params(VentMode::Prvc);

        // Breath 1: under-delivery (450 ml < 500 - 10).
        let mut fsm = PrvcFsm::new(t(0.0), &p, None);
        let s = fsm.desired_state(t(0.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 20.0).abs() < 1e-9);
        let under = BreathInputs {
            patient_volume: ml(450.0),
            net_flow: ml_per_sec(0.0),
        };
        fsm.desired_state(t(1.5), &under, &config);

        // Breath 2: pressure stepped up by one pstep.
        let mut fsm2 = PrvcFsm::new(t(3.0), &p, Some(fsm.carry()));
        let s = fsm2.desired_state(t(3.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 21.0).abs() < 1e-9);

        // Breath 2 over-delivers: breath 3 steps back down.
        let over = BreathInputs {
            patient_volume: ml(540.0),
            net_flow: ml_per_sec(0.0),
        };
        fsm2.desired_state(t(4.5), &over, &config);
        let mut fsm3 = PrvcFsm::new(t(6.0), &p, Some(fsm2.carry()));
        let s = fsm3.desired_state(t(6.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn prvc_within_deadband_holds_pressure() {
        let config = CycleConfig::default();
        let p = params(VentMode::Prvc);
        let mut fsm = PrvcFsm::new(t(0.0), &p, None);
        let on_target = BreathInputs {
            patient_volume: ml(505.0),
            net_flow: ml_per_sec(0.0),
        };
        fsm.desired_state(t(1.5), &on_target, &config);
        let mut next = PrvcFsm::new(t(3.0), &p, Some(fsm.carry()));
        let s = next.desired_state(t(3.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn prvc_carry_discarded_when_clinician_changes_pip() {
        let config = CycleConfig::default();
        let p = params(VentMode::Prvc);
        let mut fsm = PrvcFsm::new(t(0.0), &p, None);
        let under = BreathInputs {
            patient_volume: ml(400.0),
            net_flow: ml_per_sec(0.0),
        };
        fsm.desired_state(t(1.5), &under, &config);

        let mut changed = p;
        changed.pip = cm_h2o(25.0);
        let mut next = PrvcFsm::new(t(3.0), &changed, Some(fsm.carry()));
        let s = next.desired_state(t(3.5), &quiet(), &config);
        assert!((setpoint_cm_h2o(&s) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn exhaustive_construction_per_mode() {
        let modes = [
            VentMode::Off,
            VentMode::PressureControl,
            VentMode::PressureAssist,
            VentMode::Hfnc,
            VentMode::VolumeControl,
            VentMode::Cpap,
            VentMode::VolumeAssist,
            VentMode::PressureSupport,
            VentMode::SimvPc,
            VentMode::SimvVc,
            VentMode::Bipap,
            VentMode::Prvc,
            VentMode::Spontaneous,
        ];
        let config = CycleConfig::default();
        for mode in modes {
            let p = params(mode);
            let mut fsm = BreathFsm::for_mode(t(0.0), &p, trigger(), None);
            assert_eq!(fsm.is_off(), mode == VentMode::Off);
            let s = fsm.desired_state(t(0.05), &quiet(), &config);
            if mode == VentMode::Off {
                assert_eq!(s, DesiredState::disabled());
            } else {
                assert!(
                    s.pressure_setpoint.is_some()
                        || s.volume_setpoint.is_some()
                        || s.flow_setpoint.is_some()
                );
            }
        }
    }
}
