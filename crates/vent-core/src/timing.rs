//! Monotonic control-loop time.
//!
//! The controller never reads a wall clock: the external scheduler hands it a
//! `TimePoint` each tick. A `TimePoint` is an instant measured from controller
//! startup; subtracting two of them yields a `Duration` (a uom `Time`), and a
//! `Duration` can be added back to shift a deadline.

use core::ops::{Add, Sub};

use crate::units::{micros, Duration};
use uom::si::time::microsecond;

/// An instant on the controller's monotonic clock.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct TimePoint(Duration);

impl TimePoint {
    /// Instant at the given elapsed time since controller startup.
    pub fn from_startup(elapsed: Duration) -> Self {
        Self(elapsed)
    }

    /// Instant at the given number of microseconds since startup.
    pub fn from_micros(us: u64) -> Self {
        Self(micros(us as f64))
    }

    /// Microseconds since startup, rounded. Used to derive breath identifiers.
    pub fn micros_since_startup(self) -> u64 {
        self.0.get::<microsecond>().round() as u64
    }

    /// Elapsed time since an earlier instant.
    pub fn elapsed_since(self, earlier: TimePoint) -> Duration {
        self.0 - earlier.0
    }
}

impl Add<Duration> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 + rhs)
    }
}

impl Sub<Duration> for TimePoint {
    type Output = TimePoint;

    fn sub(self, rhs: Duration) -> TimePoint {
        TimePoint(self.0 - rhs)
    }
}

impl Sub<TimePoint> for TimePoint {
    type Output = Duration;

    fn sub(self, rhs: TimePoint) -> Duration {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{ms, secs};
    use uom::si::time::second;

    #[test]
    fn ordering_and_arithmetic() {
        let t0 = TimePoint::from_startup(secs(1.0));
        let t1 = t0 + ms(10.0);
        assert!(t1 > t0);
        assert!((t1 - t0).get::<second>() - 0.01 < 1e-12);
        assert_eq!(t1 - ms(10.0), t0);
    }

    #[test]
    fn micros_round_trip() {
        let t = TimePoint::from_micros(1_234_567);
        assert_eq!(t.micros_since_startup(), 1_234_567);
    }

    #[test]
    fn elapsed_since_matches_sub() {
        let t0 = TimePoint::from_startup(secs(0.5));
        let t1 = TimePoint::from_startup(secs(2.0));
        assert_eq!(t1.elapsed_since(t0), t1 - t0);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Bounded to a few weeks of runtime so the f64 seconds
            // representation stays well under microsecond resolution.
            #[test]
            fn micros_survive_the_round_trip(us in 0u64..(1u64 << 40)) {
                let t = TimePoint::from_micros(us);
                prop_assert_eq!(t.micros_since_startup(), us);
            }
        }
    }
}
