//! Single-input/single-output PID controller.
//!
//! Five independent instances of this controller drive the actuator cascade
//! (volume, pressure, oxygen-proportioning valve, FiO2 trim, inner flow loop).
//! The controller is stateful: `compute` derives its own sample time from the
//! previous call's timestamp, so callers just hand it the current instant.

use serde::{Deserialize, Serialize};
use uom::si::time::second;
use vent_core::TimePoint;

use crate::error::{ControlError, ControlResult};

/// How the proportional term is computed.
///
/// `OnMeasurement` folds the proportional action into the integral sum
/// (a bumpless form that avoids proportional kick on setpoint changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProportionalTerm {
    OnError,
    OnMeasurement,
}

/// How the derivative term is computed.
///
/// `OnMeasurement` differentiates the process variable instead of the error,
/// so a setpoint step does not produce a derivative kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DifferentialTerm {
    OnError,
    OnMeasurement,
}

/// Gain triple for a PID loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64) -> Self {
        Self { kp, ki, kd }
    }
}

#[derive(Debug, Clone, Copy)]
struct PidSample {
    at: TimePoint,
    measurement: f64,
    error: f64,
}

/// PID controller with clamped output and clamped integral accumulator.
#[derive(Debug, Clone)]
pub struct Pid {
    gains: PidGains,
    p_term: ProportionalTerm,
    d_term: DifferentialTerm,
    out_min: f64,
    out_max: f64,
    /// Integral accumulator, held in output units (gains already applied per
    /// sample, so a live `ki` change affects only future accumulation).
    integral_sum: f64,
    last: Option<PidSample>,
}

impl Pid {
    /// Create a new PID controller.
    ///
    /// # Arguments
    ///
    /// * `gains` - kp/ki/kd (must be finite)
    /// * `p_term` - proportional computation mode
    /// * `d_term` - derivative computation mode
    /// * `out_min` - minimum output
    /// * `out_max` - maximum output
    pub fn new(
        gains: PidGains,
        p_term: ProportionalTerm,
        d_term: DifferentialTerm,
        out_min: f64,
        out_max: f64,
    ) -> ControlResult<Self> {
        if !(gains.kp.is_finite() && gains.ki.is_finite() && gains.kd.is_finite()) {
            return Err(ControlError::InvalidArg {
                what: "gains must be finite",
            });
        }
        if out_min >= out_max {
            return Err(ControlError::InvalidArg {
                what: "out_min must be less than out_max",
            });
        }
        Ok(Self {
            gains,
            p_term,
            d_term,
            out_min,
            out_max,
            integral_sum: 0.0,
            last: None,
        })
    }

    /// Current gains.
    pub fn gains(&self) -> PidGains {
        self.gains
    }

    /// Update gains without touching accumulated state. Takes effect on the
    /// next `compute`; supports live re-tuning and gain scheduling.
    pub fn set_gains(&mut self, gains: PidGains) {
        self.gains = gains;
    }

    /// Compute the controller output for this sample.
    ///
    /// The sample time is `now` minus the previous call's timestamp; the first
    /// call after construction or `reset` contributes no integral and no
    /// derivative action.
    ///
    /// Anti-windup: the integral accumulator is clamped to the output range
    /// every sample, so the integral contribution alone can never push the
    /// total past saturation, and the final output is clamped again.
    pub fn compute(&mut self, now: TimePoint, measurement: f64, setpoint: f64) -> f64 {
        let error = setpoint - measurement;

        let (dt, d_measurement, d_error) = match self.last {
            Some(prev) if now > prev.at => {
                let dt = (now - prev.at).get::<second>();
                (dt, measurement - prev.measurement, error - prev.error)
            }
            _ => (0.0, 0.0, 0.0),
        };

        self.integral_sum += self.gains.ki * error * dt;
        if self.p_term == ProportionalTerm::OnMeasurement {
            self.integral_sum -= self.gains.kp * d_measurement;
        }
        self.integral_sum = self.integral_sum.clamp(self.out_min, self.out_max);

        let mut output = self.integral_sum;
        if self.p_term == ProportionalTerm::OnError {
            output += self.gains.kp * error;
        }
        if dt > 0.0 {
            output += match self.d_term {
                DifferentialTerm::OnMeasurement => -self.gains.kd * d_measurement / dt,
                DifferentialTerm::OnError => self.gains.kd * d_error / dt,
            };
        }

        self.last = Some(PidSample {
            at: now,
            measurement,
            error,
        });
        output.clamp(self.out_min, self.out_max)
    }

    /// Clear integral and sample memory. Gains and limits are untouched.
    pub fn reset(&mut self) {
        self.integral_sum = 0.0;
        self.last = None;
    }
}
