//! Communication-loss alarm.
//!
//! The GUI processor is expected to send a message every few tens of
//! milliseconds. Sustained silence raises the alarm; it clears the instant a
//! fresh message timestamp arrives, with no hysteresis.

use tracing::{debug, warn};
use vent_core::units::ms;
use vent_core::TimePoint;

const COMM_TIMEOUT_MS: f64 = 100.0;
/// Failed checks required before the alarm raises. One: this is a
/// high-priority alarm.
const TRIGGER_COUNT_THRESHOLD: u8 = 1;

/// Alarm over the GUI communication link.
#[derive(Debug, Clone)]
pub struct CommFailAlarm {
    triggered: bool,
    trigger_count: u8,
    /// When the alarm last raised or cleared.
    last_event: TimePoint,
}

impl CommFailAlarm {
    pub fn new(start_time: TimePoint) -> Self {
        Self {
            triggered: false,
            trigger_count: 0,
            last_event: start_time,
        }
    }

    /// Evaluate the link given the current time and the timestamp of the
    /// most recently received message. Returns whether the alarm is active.
    pub fn check(&mut self, now: TimePoint, last_rx: TimePoint) -> bool {
        if now > last_rx {
            if now - last_rx > ms(COMM_TIMEOUT_MS) {
                self.communication_failed(now)
            } else {
                self.communication_resumed(now)
            }
        } else {
            self.triggered = false;
            false
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// When the alarm last changed state.
    pub fn last_event_time(&self) -> TimePoint {
        self.last_event
    }

    fn communication_failed(&mut self, at: TimePoint) -> bool {
        if !self.triggered && self.trigger_count < TRIGGER_COUNT_THRESHOLD {
            self.trigger_count += 1;
            if self.trigger_count == TRIGGER_COUNT_THRESHOLD {
                self.last_event = at;
                self.triggered = true;
                warn!("communication failed, alarm raised");
            }
        }
        self.triggered
    }

    fn communication_resumed(&mut self, at: TimePoint) -> bool {
        if self.triggered {
            self.last_event = at;
            self.triggered = false;
            self.trigger_count = 0;
            debug!("communication resumed, alarm cleared");
        }
        self.triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vent_core::units::secs;

    fn t(s: f64) -> TimePoint {
        TimePoint::from_startup(secs(s))
    }

    #[test]
    fn silence_below_timeout_does_not_raise() {
        let mut alarm = CommFailAlarm::new(t(0.0));
        assert!(!alarm.check(t(0.099), t(0.0)));
        assert!(!alarm.is_triggered());
    }

    #[test]
    fn silence_past_timeout_raises_on_first_check() {
        let mut alarm = CommFailAlarm::new(t(0.0));
        assert!(alarm.check(t(0.101), t(0.0)));
        assert!(alarm.is_triggered());
        assert_eq!(alarm.last_event_time(), t(0.101));
    }

    #[test]
    fn fresh_traffic_clears_immediately() {
        let mut alarm = CommFailAlarm::new(t(0.0));
        assert!(alarm.check(t(0.2), t(0.0)));
        // A new message arrived 10 ms ago: alarm drops on the next check.
        assert!(!alarm.check(t(0.21), t(0.2)));
        assert!(!alarm.is_triggered());

        // And it can raise again after another long silence.
        assert!(alarm.check(t(0.5), t(0.2)));
    }

    #[test]
    fn clock_not_past_last_rx_is_inert() {
        let mut alarm = CommFailAlarm::new(t(0.0));
        alarm.check(t(0.2), t(0.0));
        assert!(alarm.is_triggered());
        // Message timestamp at/after the current time: suppress.
        assert!(!alarm.check(t(0.3), t(0.3)));
        assert!(!alarm.is_triggered());
    }
}
