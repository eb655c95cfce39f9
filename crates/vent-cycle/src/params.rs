//! Clinician-set ventilation parameters and breath timing.

use serde::{Deserialize, Serialize};
use vent_core::units::{cm_h2o, liters_per_min, ml, secs, Duration, Pressure, Volume, VolumeRate};

use crate::error::{CycleError, CycleResult};

/// Ventilation modes. `Off` means the machine delivers nothing and the
/// control cascade fails open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VentMode {
    Off,
    PressureControl,
    PressureAssist,
    Hfnc,
    VolumeControl,
    Cpap,
    VolumeAssist,
    PressureSupport,
    SimvPc,
    SimvVc,
    Bipap,
    Prvc,
    Spontaneous,
}

/// Parameters supplied externally each tick; immutable within a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VentParams {
    pub mode: VentMode,
    /// Peak inspiratory pressure target.
    pub pip: Pressure,
    /// Positive end-expiratory pressure target.
    pub peep: Pressure,
    /// Pressure-support level above PEEP for patient-initiated breaths.
    pub psupp: Pressure,
    /// Auto-titration pressure step (PRVC).
    pub pstep: Pressure,
    /// Target tidal volume.
    pub viv: Volume,
    /// Target flow (HFNC, CPAP).
    pub flow: VolumeRate,
    pub breaths_per_min: f64,
    /// Inspiratory:expiratory duration ratio.
    pub ie_ratio: f64,
    /// Fraction of inspired oxygen in [0, 1].
    pub fio2: f64,
}

/// Floors applied inside the duration math so degenerate rate/ratio values
/// cannot produce infinite or NaN deadlines. `validate` rejects such values
/// at the boundary; these only guard the arithmetic.
pub const MIN_BREATHS_PER_MIN: f64 = 0.1;
pub const MIN_IE_RATIO: f64 = 1e-3;

impl VentParams {
    /// Baseline parameter set: everything zero, mode off.
    pub fn off() -> Self {
        Self {
            mode: VentMode::Off,
            pip: cm_h2o(0.0),
            peep: cm_h2o(0.0),
            psupp: cm_h2o(0.0),
            pstep: cm_h2o(0.0),
            viv: ml(0.0),
            flow: liters_per_min(0.0),
            breaths_per_min: 0.0,
            ie_ratio: 0.0,
            fio2: 0.0,
        }
    }

    /// Admission check for externally supplied parameters. Modes other than
    /// `Off` need a positive breath rate and I:E ratio for the timing math.
    pub fn validate(&self) -> CycleResult<()> {
        if self.mode == VentMode::Off {
            return Ok(());
        }
        if !(self.breaths_per_min.is_finite() && self.breaths_per_min > 0.0) {
            return Err(CycleError::InvalidArg {
                what: "breaths_per_min must be positive and finite",
            });
        }
        if !(self.ie_ratio.is_finite() && self.ie_ratio > 0.0) {
            return Err(CycleError::InvalidArg {
                what: "ie_ratio must be positive and finite",
            });
        }
        if !(self.fio2.is_finite() && (0.0..=1.0).contains(&self.fio2)) {
            return Err(CycleError::InvalidArg {
                what: "fio2 must be within [0, 1]",
            });
        }
        let pressures = [self.pip, self.peep, self.psupp, self.pstep];
        if pressures.iter().any(|p| !p.value.is_finite() || p.value < 0.0) {
            return Err(CycleError::InvalidArg {
                what: "pressure targets must be non-negative and finite",
            });
        }
        if !self.viv.value.is_finite() || self.viv.value < 0.0 {
            return Err(CycleError::InvalidArg {
                what: "tidal volume must be non-negative and finite",
            });
        }
        if !self.flow.value.is_finite() || self.flow.value < 0.0 {
            return Err(CycleError::InvalidArg {
                what: "target flow must be non-negative and finite",
            });
        }
        Ok(())
    }
}

/// Inspiration and expiration durations for one breath.
///
/// With t = seconds per breath and r = I:E ratio:
///
///   t = I + E
///   r = I / E
///
/// gives I = t*r/(1+r) and E = t/(1+r).
pub fn breath_durations(params: &VentParams) -> (Duration, Duration) {
    let bpm = params.breaths_per_min.max(MIN_BREATHS_PER_MIN);
    let r = params.ie_ratio.max(MIN_IE_RATIO);
    let t = 60.0 / bpm;
    (secs(t * r / (1.0 + r)), secs(t / (1.0 + r)))
}
