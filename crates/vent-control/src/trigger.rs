//! Patient-effort detection from net flow.
//!
//! Two exponentially weighted moving averages track the net flow signal: a
//! slow one that follows the breath's baseline and a fast one that follows
//! the instantaneous flow. A patient pulling air in drives the fast average
//! above the slow one; the gap crossing a threshold is the trigger. The same
//! structure, with the averages swapped, detects the start of exhalation.

use uom::si::time::second;
use uom::si::volume_rate::cubic_centimeter_per_second;
use vent_core::units::{Duration, VolumeRate};

use crate::error::{ControlError, ControlResult};

/// Loop period the EWMA smoothing factors are tuned for.
const REFERENCE_PERIOD_SECS: f64 = 0.010;
const SLOW_ALPHA_AT_REFERENCE: f64 = 0.01;
const FAST_ALPHA_AT_REFERENCE: f64 = 0.2;

/// Dual-EWMA flow trigger.
#[derive(Debug, Clone)]
pub struct FlowTrigger {
    slow_alpha: f64,
    fast_alpha: f64,
    inspire_threshold: VolumeRate,
    exhale_threshold: VolumeRate,
    slow_avg: Option<f64>,
    fast_avg: Option<f64>,
}

impl FlowTrigger {
    /// Build a trigger for the given control-loop period.
    ///
    /// The smoothing factors scale linearly with the period so the averages'
    /// time constants stay fixed in wall time regardless of tick rate.
    pub fn new(
        loop_period: Duration,
        inspire_threshold: VolumeRate,
        exhale_threshold: VolumeRate,
    ) -> ControlResult<Self> {
        let period = loop_period.get::<second>();
        if !(period > 0.0) {
            return Err(ControlError::InvalidArg {
                what: "loop period must be positive",
            });
        }
        let scale = period / REFERENCE_PERIOD_SECS;
        let slow_alpha = (SLOW_ALPHA_AT_REFERENCE * scale).min(1.0);
        let fast_alpha = (FAST_ALPHA_AT_REFERENCE * scale).min(1.0);
        Ok(Self {
            slow_alpha,
            fast_alpha,
            inspire_threshold,
            exhale_threshold,
            slow_avg: None,
            fast_avg: None,
        })
    }

    /// Fold one net-flow sample into both averages. The first sample seeds
    /// both averages directly.
    pub fn observe(&mut self, net_flow: VolumeRate) {
        let f = net_flow.get::<cubic_centimeter_per_second>();
        let slow = self.slow_avg.unwrap_or(f);
        let fast = self.fast_avg.unwrap_or(f);
        self.slow_avg = Some(self.slow_alpha * f + (1.0 - self.slow_alpha) * slow);
        self.fast_avg = Some(self.fast_alpha * f + (1.0 - self.fast_alpha) * fast);
    }

    /// True when the fast average exceeds the slow one by the inspiratory
    /// threshold, i.e. the patient has started pulling air in.
    pub fn inspiration_detected(&self) -> bool {
        match (self.fast_avg, self.slow_avg) {
            (Some(fast), Some(slow)) => {
                fast > slow + self.inspire_threshold.get::<cubic_centimeter_per_second>()
            }
            _ => false,
        }
    }

    /// True when the slow average exceeds the fast one by the expiratory
    /// threshold, i.e. inspiratory flow has collapsed and the patient is
    /// starting to exhale.
    pub fn exhalation_detected(&self) -> bool {
        match (self.fast_avg, self.slow_avg) {
            (Some(fast), Some(slow)) => {
                slow > fast + self.exhale_threshold.get::<cubic_centimeter_per_second>()
            }
            _ => false,
        }
    }
}
