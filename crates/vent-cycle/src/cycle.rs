//! Breath-cycle supervisor.
//!
//! Owns the active breath machine and replaces it, never mutates it across a
//! mode boundary, when the requested mode changes or the current breath ends.

use tracing::debug;
use vent_control::FlowTrigger;
use vent_core::TimePoint;

use crate::config::CycleConfig;
use crate::error::{CycleError, CycleResult};
use crate::fsm::BreathFsm;
use crate::params::{VentMode, VentParams};
use crate::state::{BreathInputs, DesiredState};

/// Supervisor over the per-mode breath machines.
pub struct BreathCycle {
    config: CycleConfig,
    /// Validated effort-detector prototype; each new breath clones it so the
    /// flow averages start fresh.
    trigger_template: FlowTrigger,
    fsm: BreathFsm,
}

impl BreathCycle {
    pub fn new(config: CycleConfig) -> CycleResult<Self> {
        config.validate()?;
        let trigger_template = FlowTrigger::new(
            config.loop_period(),
            config.trigger_threshold(),
            config.exhale_threshold(),
        )
        .map_err(|_| CycleError::InvalidArg {
            what: "effort trigger configuration",
        })?;
        Ok(Self {
            config,
            trigger_template,
            fsm: BreathFsm::off(),
        })
    }

    pub fn config(&self) -> &CycleConfig {
        &self.config
    }

    /// Evaluate the active machine, then handle mode switches in priority
    /// order: off-to-on (rebuild and recompute this same tick, so the first
    /// tick of the session already reflects the new mode), any request for
    /// off, or end of breath (rebuild for the requested mode at `now`).
    pub fn desired_state(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        inputs: &BreathInputs,
    ) -> DesiredState {
        let mut state = self.fsm.desired_state(now, inputs, &self.config);

        let switching_on = self.fsm.is_off() && params.mode != VentMode::Off;
        let switching_off = params.mode == VentMode::Off;

        if switching_on || switching_off || state.end_of_breath {
            // Titration state survives only PRVC-to-PRVC reconstruction.
            let carry = if params.mode == VentMode::Prvc {
                self.fsm.prvc_carry()
            } else {
                None
            };
            debug!(mode = ?params.mode, switching_on, switching_off, "replacing breath machine");
            self.fsm = BreathFsm::for_mode(now, params, self.trigger_template.clone(), carry);
        }
        if switching_on {
            state = self.fsm.desired_state(now, inputs, &self.config);
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uom::si::pressure::centimeter_of_water;
    use vent_core::units::{cm_h2o, liters_per_min, ml, ml_per_sec, secs};

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

    #[test]
    fn starts_off_and_reports_no_setpoint() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        let s = cycle.desired_state(t(0.0), &VentParams::off(), &quiet());
        assert_eq!(s, DesiredState::disabled());
    }

    #[test]
    fn off_to_on_is_authoritative_on_the_same_tick() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        cycle.desired_state(t(0.0), &VentParams::off(), &quiet());
        let s = cycle.desired_state(t(1.0), &params(VentMode::PressureControl), &quiet());
        // No one-tick lag: the new mode's setpoint is already populated.
        assert!(s.pressure_setpoint.is_some());
        assert!(!s.in_exhale);
    }

    #[test]
    fn on_to_off_disables_the_next_tick() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        cycle.desired_state(t(0.0), &params(VentMode::PressureControl), &quiet());
        cycle.desired_state(t(0.01), &VentParams::off(), &quiet());
        let s = cycle.desired_state(t(0.02), &VentParams::off(), &quiet());
        assert_eq!(s, DesiredState::disabled());
    }

    #[test]
    fn end_of_breath_rebuilds_and_restarts_the_ramp() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        let p = params(VentMode::PressureControl);
        cycle.desired_state(t(0.0), &p, &quiet());

        // Full breath is 3 s; the tick at 3.0 flags end of breath.
        let s = cycle.desired_state(t(3.0), &p, &quiet());
        assert!(s.end_of_breath);

        // Next tick is the start of a fresh breath: back on the rise ramp.
        let s = cycle.desired_state(t(3.05), &p, &quiet());
        assert!(!s.in_exhale);
        let sp = s.pressure_setpoint.unwrap().get::<centimeter_of_water>();
        assert!((sp - 12.5).abs() < 1e-9);
    }

    #[test]
    fn mode_change_takes_effect_at_the_breath_boundary() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        cycle.desired_state(t(0.0), &params(VentMode::PressureControl), &quiet());

        // Requesting a different mode mid-breath does not interrupt it.
        let s = cycle.desired_state(t(1.5), &params(VentMode::Hfnc), &quiet());
        assert!(s.pressure_setpoint.is_some());
        assert!(s.flow_setpoint.is_none());

        // At the boundary the new mode's machine takes over.
        let s = cycle.desired_state(t(3.0), &params(VentMode::Hfnc), &quiet());
        assert!(s.end_of_breath);
        let s = cycle.desired_state(t(3.05), &params(VentMode::Hfnc), &quiet());
        assert!(s.flow_setpoint.is_some());
        assert!(s.pressure_setpoint.is_none());
    }

    #[test]
    fn prvc_titration_persists_across_supervised_breaths() {
        let mut cycle = BreathCycle::new(CycleConfig::default()).unwrap();
        let p = params(VentMode::Prvc);
        cycle.desired_state(t(0.0), &p, &quiet());

        // Under-deliver during expiration of breath 1.
        let under = BreathInputs {
            patient_volume: ml(450.0),
            net_flow: ml_per_sec(0.0),
        };
        cycle.desired_state(t(1.5), &p, &under);

        // The boundary at 3 s rebuilds the machine with the carried
        // titration; the next breath runs one pressure step higher.
        cycle.desired_state(t(3.0), &p, &under);
        let s = cycle.desired_state(t(3.5), &p, &quiet());
        let sp = s.pressure_setpoint.unwrap().get::<centimeter_of_water>();
        assert!((sp - 21.0).abs() < 1e-9);
    }
}
