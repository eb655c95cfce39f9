//! Net-flow integration with breath-boundary drift correction.
//!
//! Tidal volume is the time integral of net flow through the patient circuit.
//! Flow-sensor bias integrates into an ever-growing volume error, so at each
//! breath boundary the caller tells the integrator what the volume should have
//! been and the integrator starts adding a constant correction flow chosen to
//! have cancelled the drift accumulated since the previous note.

use uom::si::time::second;
use vent_core::units::{ml, Volume, VolumeRate};
use vent_core::TimePoint;

use crate::error::{ControlError, ControlResult};

#[derive(Debug, Clone, Copy)]
struct FlowSample {
    at: TimePoint,
    flow: VolumeRate,
}

/// Trapezoidal integrator of net flow into cumulative volume.
#[derive(Debug, Clone)]
pub struct FlowIntegrator {
    volume: Volume,
    correction: VolumeRate,
    last_sample: Option<FlowSample>,
    last_note: Option<TimePoint>,
}

impl FlowIntegrator {
    /// Start a fresh integration at zero volume with no correction.
    pub fn new() -> Self {
        Self {
            volume: ml(0.0),
            correction: vent_core::units::ml_per_sec(0.0),
            last_sample: None,
            last_note: None,
        }
    }

    /// Integrate one flow sample. Samples must be fed in time order; a sample
    /// at or before the previous one is rejected.
    pub fn add_flow(&mut self, now: TimePoint, flow: VolumeRate) -> ControlResult<()> {
        if let Some(prev) = self.last_sample {
            if now <= prev.at {
                return Err(ControlError::InvalidArg {
                    what: "flow samples must be strictly time ordered",
                });
            }
            let dt = now - prev.at;
            self.volume += ((prev.flow + flow) * 0.5 + self.correction) * dt;
        }
        self.last_sample = Some(FlowSample { at: now, flow });
        Ok(())
    }

    /// Record that the integrated volume should currently equal `expected`
    /// (typically zero at end of breath, when lung volume has returned to
    /// baseline). Re-derives the correction flow so the same drift over the
    /// next inter-note interval would cancel exactly.
    pub fn note_expected_volume(&mut self, expected: Volume) {
        if let (Some(sample), Some(note_at)) = (self.last_sample, self.last_note) {
            let window = sample.at - note_at;
            if window.get::<second>() > 0.0 {
                self.correction += (expected - self.volume) / window;
            }
        }
        if let Some(sample) = self.last_sample {
            self.last_note = Some(sample.at);
        }
    }

    /// Cumulative volume, corrections included.
    pub fn volume(&self) -> Volume {
        self.volume
    }

    /// Current correction flow. Exposed for diagnostics.
    pub fn flow_correction(&self) -> VolumeRate {
        self.correction
    }
}

impl Default for FlowIntegrator {
    fn default() -> Self {
        Self::new()
    }
}
