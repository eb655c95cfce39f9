//! Control cascade and actuator mixer.
//!
//! Per tick: integrate net flow, obtain the desired physical state from the
//! breath-cycle layer, then run the PID topology selected by mode family and
//! FiO2 band. Below the crossover the air path dominates: an outer pressure
//! or volume loop produces a flow command consumed by the inner flow loop
//! driving the blower pinch valve, with the oxygen valve as feed-forward
//! trim. At or above the crossover a single loop drives the oxygen valve and
//! the air path becomes the trim.

use tracing::debug;
use uom::si::pressure::kilopascal;
use uom::si::volume::milliliter;
use uom::si::volume_rate::liter_per_second;
use vent_control::{DifferentialTerm, FlowIntegrator, Pid, ProportionalTerm};
use vent_core::units::{kpa, ml, Pressure, Volume, VolumeRate};
use vent_core::{ensure_finite, TimePoint};
use vent_cycle::{BreathCycle, BreathInputs, DesiredState, VentMode, VentParams};

use crate::actuators::{ActuatorCommand, ActuatorOverrides};
use crate::config::ControlConfig;
use crate::error::ControllerResult;
use crate::sensors::SensorReadings;

/// The inner flow loop may command slightly past fully open; the final
/// actuator clamp brings it back.
const FLOW_OUT_MAX: f64 = 1.2;

// Exhale pinch-valve couplings, affine in the active branch's command.
const PRESSURE_EXHALE_GAIN: f64 = 0.55;
const PRESSURE_EXHALE_OFFSET: f64 = 0.4;
const VOLUME_EXHALE_GAIN: f64 = 0.60;
const PSOL_EXHALE_GAIN: f64 = 0.6;
const PSOL_EXHALE_OFFSET: f64 = 0.4;

/// Diagnostics emitted alongside every actuator command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerDiagnostics {
    pub pressure_setpoint: Pressure,
    pub patient_volume: Volume,
    pub net_flow: VolumeRate,
    pub flow_correction: VolumeRate,
    /// Twin of `patient_volume` without drift correction, for judging how
    /// much the correction is doing.
    pub uncorrected_volume: Volume,
    /// Monotonically distinct per breath; derived from the instant the
    /// breath started.
    pub breath_id: u64,
}

/// Cascade topology family for a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlFamily {
    Off,
    /// Pressure on the outer loop throughout the breath.
    Pressure,
    /// Pure flow control (HFNC).
    Flow,
    /// Volume on the outer loop while inspiring, pressure while exhaling.
    Volume,
    /// Flow while inspiring, pressure while exhaling.
    Cpap,
}

fn control_family(mode: VentMode) -> ControlFamily {
    match mode {
        VentMode::Off => ControlFamily::Off,
        VentMode::PressureControl
        | VentMode::PressureAssist
        | VentMode::PressureSupport
        | VentMode::SimvPc
        | VentMode::Bipap
        | VentMode::Prvc
        | VentMode::Spontaneous => ControlFamily::Pressure,
        VentMode::Hfnc => ControlFamily::Flow,
        VentMode::VolumeControl | VentMode::VolumeAssist | VentMode::SimvVc => {
            ControlFamily::Volume
        }
        VentMode::Cpap => ControlFamily::Cpap,
    }
}

/// The respiratory controller.
pub struct Controller {
    config: ControlConfig,
    cycle: BreathCycle,
    air_volume_pid: Pid,
    air_pressure_pid: Pid,
    psol_pid: Pid,
    fio2_pid: Pid,
    air_flow_pid: Pid,
    flow_integrator: FlowIntegrator,
    uncorrected_flow_integrator: FlowIntegrator,
    ventilator_was_on: bool,
    breath_id: u64,
}

impl Controller {
    pub fn new(config: ControlConfig) -> ControllerResult<Self> {
        ensure_finite(config.fio2_crossover, "fio2 crossover")?;
        ensure_finite(config.valve_bias, "valve bias")?;
        let cycle = BreathCycle::new(config.cycle)?;
        let air_volume_pid = Pid::new(
            config.volume_gains,
            ProportionalTerm::OnError,
            DifferentialTerm::OnMeasurement,
            0.0,
            1.0,
        )?;
        let air_pressure_pid = Pid::new(
            config.pressure_gains,
            ProportionalTerm::OnError,
            DifferentialTerm::OnMeasurement,
            0.0,
            1.0,
        )?;
        let psol_pid = Pid::new(
            config.psol_gains,
            ProportionalTerm::OnError,
            DifferentialTerm::OnMeasurement,
            0.0,
            1.0,
        )?;
        let fio2_pid = Pid::new(
            config.fio2_gains,
            ProportionalTerm::OnError,
            DifferentialTerm::OnMeasurement,
            -1.0,
            1.0,
        )?;
        let air_flow_pid = Pid::new(
            config.flow_gains,
            ProportionalTerm::OnError,
            DifferentialTerm::OnMeasurement,
            0.0,
            FLOW_OUT_MAX,
        )?;
        Ok(Self {
            config,
            cycle,
            air_volume_pid,
            air_pressure_pid,
            psol_pid,
            fio2_pid,
            air_flow_pid,
            flow_integrator: FlowIntegrator::new(),
            uncorrected_flow_integrator: FlowIntegrator::new(),
            ventilator_was_on: false,
            breath_id: 0,
        })
    }

    pub fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Run one control tick. Overrides, if any, are applied as the very last
    /// step before the command is returned.
    pub fn run(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        overrides: &ActuatorOverrides,
    ) -> (ActuatorCommand, ControllerDiagnostics) {
        let uncorrected_net_flow = readings.inflow - readings.outflow;
        if self
            .flow_integrator
            .add_flow(now, uncorrected_net_flow)
            .and_then(|()| {
                self.uncorrected_flow_integrator
                    .add_flow(now, uncorrected_net_flow)
            })
            .is_err()
        {
            debug!("non-monotonic tick, flow sample dropped");
        }

        let patient_volume = self.flow_integrator.volume();
        let net_flow = uncorrected_net_flow + self.flow_integrator.flow_correction();

        let desired = self.cycle.desired_state(
            now,
            params,
            &BreathInputs {
                patient_volume,
                net_flow,
            },
        );

        if desired.end_of_breath {
            // Lung volume is back at baseline between breaths.
            self.flow_integrator.note_expected_volume(ml(0.0));
            self.breath_id = now.micros_since_startup();
            debug!(breath_id = self.breath_id, "end of breath");
        }

        // Push gains every tick so live config edits take effect immediately.
        self.air_volume_pid.set_gains(self.config.volume_gains);
        self.air_pressure_pid.set_gains(self.config.pressure_gains);
        self.psol_pid.set_gains(self.config.psol_gains);
        self.fio2_pid.set_gains(self.config.fio2_gains);
        self.air_flow_pid.set_gains(self.config.flow_gains);

        let mut command = match control_family(params.mode) {
            ControlFamily::Off => self.disabled(),
            ControlFamily::Pressure => self.pressure_family(now, params, readings, &desired),
            ControlFamily::Flow => self.flow_family(now, params, readings, &desired, net_flow),
            ControlFamily::Volume => self.volume_family(now, params, readings, &desired),
            ControlFamily::Cpap => self.cpap_family(now, params, readings, &desired),
        };

        let diagnostics = ControllerDiagnostics {
            pressure_setpoint: desired.pressure_setpoint.unwrap_or(kpa(0.0)),
            patient_volume,
            net_flow,
            flow_correction: self.flow_integrator.flow_correction(),
            uncorrected_volume: self.uncorrected_flow_integrator.volume(),
            breath_id: self.breath_id,
        };

        overrides.apply(&mut command);
        (command, diagnostics)
    }

    /// No authoritative setpoint, or the machine is off: reset every loop so
    /// no stale integral survives into the next session, and fail open.
    fn disabled(&mut self) -> ActuatorCommand {
        self.air_volume_pid.reset();
        self.air_pressure_pid.reset();
        self.psol_pid.reset();
        self.fio2_pid.reset();
        self.air_flow_pid.reset();
        self.ventilator_was_on = false;
        ActuatorCommand::fail_open()
    }

    /// On the off-to-on edge, fresh integrators: residual drift from the
    /// previous session must not leak into the new breath.
    fn note_running(&mut self) {
        if !self.ventilator_was_on {
            self.flow_integrator = FlowIntegrator::new();
            self.uncorrected_flow_integrator = FlowIntegrator::new();
        }
        self.ventilator_was_on = true;
    }

    /// Feed-forward FiO2 base plus a bounded PID trim.
    fn fio2_coupling(&mut self, now: TimePoint, params: &VentParams, readings: &SensorReadings) -> f64 {
        (params.fio2 + self.fio2_pid.compute(now, readings.fio2, params.fio2)).clamp(0.0, 1.0)
    }

    /// Oxygen-dominant band, shared by every family: single loop on the
    /// oxygen valve with the air path as trim. The caller picks the process
    /// variable and setpoint the oxygen loop closes on.
    fn oxygen_band(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        measurement: f64,
        setpoint: f64,
    ) -> ActuatorCommand {
        let psol = self.psol_pid.compute(now, measurement, setpoint);
        let coupling = self.fio2_coupling(now, params, readings);
        let blower_valve = self.air_flow_pid.compute(
            now,
            readings.inflow.get::<liter_per_second>(),
            psol * (1.0 - coupling),
        );
        ActuatorCommand {
            // Keep the oxygen valve slightly open to avoid hysteresis at very
            // low command; the exhale valve compensates for the leakage.
            oxygen_valve: (psol + self.config.valve_bias).clamp(0.0, 1.0),
            blower_power: 1.0,
            blower_valve: blower_valve.clamp(0.0, 1.0),
            exhale_valve: (1.0 - PSOL_EXHALE_GAIN * psol - PSOL_EXHALE_OFFSET).clamp(0.0, 1.0),
        }
    }

    fn pressure_family(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        desired: &DesiredState,
    ) -> ActuatorCommand {
        let Some(setpoint) = desired.pressure_setpoint else {
            return self.disabled();
        };
        self.note_running();

        let measurement = readings.patient_pressure.get::<kilopascal>();
        let setpoint = setpoint.get::<kilopascal>();

        if params.fio2 < self.config.fio2_crossover {
            self.psol_pid.reset();

            // Successive loop closure: pressure command, flow command,
            // actuator command.
            let flow_cmd = self.air_pressure_pid.compute(now, measurement, setpoint);
            let blower_valve =
                self.air_flow_pid
                    .compute(now, readings.inflow.get::<liter_per_second>(), flow_cmd);
            let coupling = self.fio2_coupling(now, params, readings);

            ActuatorCommand {
                oxygen_valve: (readings.inflow.get::<liter_per_second>() * coupling)
                    .clamp(0.0, 1.0),
                // Blower at full power; pressure is controlled by the pinch
                // valve.
                blower_power: 1.0,
                blower_valve: (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
                exhale_valve: (1.0 - PRESSURE_EXHALE_GAIN * flow_cmd - PRESSURE_EXHALE_OFFSET)
                    .clamp(0.0, 1.0),
            }
        } else {
            self.air_pressure_pid.reset();
            self.oxygen_band(now, params, readings, measurement, setpoint)
        }
    }

    fn flow_family(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        desired: &DesiredState,
        net_flow: VolumeRate,
    ) -> ActuatorCommand {
        let Some(flow_setpoint) = desired.flow_setpoint else {
            return self.disabled();
        };
        self.note_running();

        if params.fio2 < self.config.fio2_crossover {
            self.psol_pid.reset();

            let blower_valve = self.air_flow_pid.compute(
                now,
                readings.inflow.get::<liter_per_second>(),
                flow_setpoint.get::<liter_per_second>(),
            );
            let coupling = self.fio2_coupling(now, params, readings);

            ActuatorCommand {
                oxygen_valve: (readings.inflow.get::<liter_per_second>() * coupling)
                    .clamp(0.0, 1.0),
                blower_power: 1.0,
                blower_valve: (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
                exhale_valve: (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
            }
        } else {
            // The oxygen loop closes on corrected net flow here; there is no
            // dedicated oxygen-path flow sensor.
            self.air_flow_pid.reset();
            self.oxygen_band(
                now,
                params,
                readings,
                net_flow.get::<liter_per_second>(),
                flow_setpoint.get::<liter_per_second>(),
            )
        }
    }

    fn volume_family(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        desired: &DesiredState,
    ) -> ActuatorCommand {
        let Some(volume_setpoint) = desired.volume_setpoint else {
            return self.disabled();
        };
        self.note_running();

        let volume_ml = self.flow_integrator.volume().get::<milliliter>();
        let pressure_kpa = readings.patient_pressure.get::<kilopascal>();
        // The expiratory half always carries a pressure setpoint (PEEP).
        let pressure_setpoint_kpa = desired
            .pressure_setpoint
            .unwrap_or(desired.peep)
            .get::<kilopascal>();

        if params.fio2 < self.config.fio2_crossover {
            self.psol_pid.reset();

            let flow_cmd = if !desired.in_exhale {
                self.air_pressure_pid.reset();
                // Volume on the outer loop while delivering the breath.
                self.air_volume_pid
                    .compute(now, volume_ml, volume_setpoint.get::<milliliter>())
            } else {
                self.air_volume_pid.reset();
                // Pressure on the outer loop while holding PEEP.
                self.air_pressure_pid
                    .compute(now, pressure_kpa, pressure_setpoint_kpa)
            };
            let blower_valve =
                self.air_flow_pid
                    .compute(now, readings.inflow.get::<liter_per_second>(), flow_cmd);
            let coupling = self.fio2_coupling(now, params, readings);
            let oxygen_valve =
                (readings.inflow.get::<liter_per_second>() * coupling).clamp(0.0, 1.0);

            if !desired.in_exhale {
                ActuatorCommand {
                    oxygen_valve,
                    blower_power: 1.0,
                    blower_valve: blower_valve.clamp(0.0, 1.0),
                    exhale_valve: (1.0 - VOLUME_EXHALE_GAIN * blower_valve).clamp(0.0, 1.0),
                }
            } else {
                ActuatorCommand {
                    oxygen_valve,
                    blower_power: 1.0,
                    blower_valve: (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
                    exhale_valve: (1.0
                        - PRESSURE_EXHALE_GAIN * flow_cmd
                        - PRESSURE_EXHALE_OFFSET)
                        .clamp(0.0, 1.0),
                }
            }
        } else {
            self.air_pressure_pid.reset();
            self.air_volume_pid.reset();
            let (measurement, setpoint) = if !desired.in_exhale {
                (volume_ml, volume_setpoint.get::<milliliter>())
            } else {
                (pressure_kpa, pressure_setpoint_kpa)
            };
            self.oxygen_band(now, params, readings, measurement, setpoint)
        }
    }

    fn cpap_family(
        &mut self,
        now: TimePoint,
        params: &VentParams,
        readings: &SensorReadings,
        desired: &DesiredState,
    ) -> ActuatorCommand {
        let Some(flow_setpoint) = desired.flow_setpoint else {
            return self.disabled();
        };
        self.note_running();

        let inflow_lps = readings.inflow.get::<liter_per_second>();
        let pressure_kpa = readings.patient_pressure.get::<kilopascal>();
        let pressure_setpoint_kpa = desired
            .pressure_setpoint
            .unwrap_or(desired.peep)
            .get::<kilopascal>();

        if params.fio2 < self.config.fio2_crossover {
            self.psol_pid.reset();

            let (blower_valve, exhale_valve) = if !desired.in_exhale {
                self.air_pressure_pid.reset();
                let blower_valve =
                    self.air_flow_pid
                        .compute(now, inflow_lps, flow_setpoint.get::<liter_per_second>());
                (
                    blower_valve,
                    (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
                )
            } else {
                let flow_cmd =
                    self.air_pressure_pid
                        .compute(now, pressure_kpa, pressure_setpoint_kpa);
                let blower_valve = self.air_flow_pid.compute(now, inflow_lps, flow_cmd);
                (
                    blower_valve,
                    (1.0 - PRESSURE_EXHALE_GAIN * flow_cmd - PRESSURE_EXHALE_OFFSET)
                        .clamp(0.0, 1.0),
                )
            };
            let coupling = self.fio2_coupling(now, params, readings);

            ActuatorCommand {
                oxygen_valve: (inflow_lps * coupling).clamp(0.0, 1.0),
                blower_power: 1.0,
                blower_valve: (blower_valve + self.config.valve_bias).clamp(0.0, 1.0),
                exhale_valve,
            }
        } else {
            self.air_flow_pid.reset();
            self.air_pressure_pid.reset();
            let (measurement, setpoint) = if !desired.in_exhale {
                (inflow_lps, flow_setpoint.get::<liter_per_second>())
            } else {
                (pressure_kpa, pressure_setpoint_kpa)
            };
            self.oxygen_band(now, params, readings, measurement, setpoint)
        }
    }
}
