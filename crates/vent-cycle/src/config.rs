//! Breath-cycle tuning.
//!
//! All tunables live in one plain-`f64` struct so they can be serialized and
//! edited as a unit; typed accessors convert to uom quantities at the read
//! site. Defaults are the values the trigger machinery was tuned with on a
//! 10 ms control loop.

use serde::{Deserialize, Serialize};
use vent_core::units::{ml_per_sec, ms, Duration, VolumeRate};

use crate::error::{CycleError, CycleResult};

/// Tuning for breath timing and patient-effort detection.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Ramp duration from expiratory baseline to inspiratory target.
    pub rise_time_ms: f64,
    /// Fast-over-slow flow-average gap that counts as patient inspiration.
    pub trigger_threshold_ml_per_sec: f64,
    /// Slow-over-fast flow-average gap that counts as start of exhalation.
    pub exhale_threshold_ml_per_sec: f64,
    /// Time after end of inspiration before a patient trigger is eligible.
    pub min_expire_dwell_ms: f64,
    /// Control-loop period; the flow-average smoothing scales with it.
    pub loop_period_ms: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            rise_time_ms: 100.0,
            trigger_threshold_ml_per_sec: 200.0,
            exhale_threshold_ml_per_sec: 300.0,
            min_expire_dwell_ms: 250.0,
            loop_period_ms: 10.0,
        }
    }
}

impl CycleConfig {
    pub fn validate(&self) -> CycleResult<()> {
        let fields = [
            self.rise_time_ms,
            self.trigger_threshold_ml_per_sec,
            self.exhale_threshold_ml_per_sec,
            self.min_expire_dwell_ms,
            self.loop_period_ms,
        ];
        if fields.iter().any(|v| !v.is_finite()) {
            return Err(CycleError::InvalidArg {
                what: "cycle config fields must be finite",
            });
        }
        if self.rise_time_ms <= 0.0 {
            return Err(CycleError::InvalidArg {
                what: "rise time must be positive",
            });
        }
        if self.loop_period_ms <= 0.0 {
            return Err(CycleError::InvalidArg {
                what: "loop period must be positive",
            });
        }
        if self.trigger_threshold_ml_per_sec < 0.0
            || self.exhale_threshold_ml_per_sec < 0.0
            || self.min_expire_dwell_ms < 0.0
        {
            return Err(CycleError::InvalidArg {
                what: "thresholds and dwell must be non-negative",
            });
        }
        Ok(())
    }

    pub fn rise_time(&self) -> Duration {
        ms(self.rise_time_ms)
    }

    pub fn trigger_threshold(&self) -> VolumeRate {
        ml_per_sec(self.trigger_threshold_ml_per_sec)
    }

    pub fn exhale_threshold(&self) -> VolumeRate {
        ml_per_sec(self.exhale_threshold_ml_per_sec)
    }

    pub fn min_expire_dwell(&self) -> Duration {
        ms(self.min_expire_dwell_ms)
    }

    pub fn loop_period(&self) -> Duration {
        ms(self.loop_period_ms)
    }
}
