//! Actuator commands and debug overrides.

/// Positions for the four actuators, each a fraction in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActuatorCommand {
    /// Oxygen-proportioning valve.
    pub oxygen_valve: f64,
    /// Blower fan power.
    pub blower_power: f64,
    /// Blower (inspiratory) pinch valve.
    pub blower_valve: f64,
    /// Exhale pinch valve.
    pub exhale_valve: f64,
}

impl ActuatorCommand {
    /// Safe state while the ventilator is off: blower stopped, inspiratory
    /// branch pinched shut, expiratory branch wide open so a spontaneously
    /// breathing patient is never trapped.
    pub fn fail_open() -> Self {
        Self {
            oxygen_valve: 0.0,
            blower_power: 0.0,
            blower_valve: 0.0,
            exhale_valve: 1.0,
        }
    }
}

/// Forced actuator values, applied as the very last step before a command is
/// returned. A value outside [0, 1] means "no override".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ActuatorOverrides {
    pub oxygen_valve: Option<f64>,
    pub blower_power: Option<f64>,
    pub blower_valve: Option<f64>,
    pub exhale_valve: Option<f64>,
}

impl ActuatorOverrides {
    pub fn apply(&self, command: &mut ActuatorCommand) {
        fn force(forced: Option<f64>, slot: &mut f64) {
            if let Some(v) = forced {
                if (0.0..=1.0).contains(&v) {
                    *slot = v;
                }
            }
        }
        force(self.oxygen_valve, &mut command.oxygen_valve);
        force(self.blower_power, &mut command.blower_power);
        force(self.blower_valve, &mut command.blower_valve);
        force(self.exhale_valve, &mut command.exhale_valve);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_in_range_replace_computed_values() {
        let mut cmd = ActuatorCommand::fail_open();
        let overrides = ActuatorOverrides {
            blower_power: Some(0.5),
            exhale_valve: Some(0.0),
            ..ActuatorOverrides::default()
        };
        overrides.apply(&mut cmd);
        assert_eq!(cmd.blower_power, 0.5);
        assert_eq!(cmd.exhale_valve, 0.0);
        assert_eq!(cmd.oxygen_valve, 0.0);
    }

    #[test]
    fn out_of_range_overrides_are_ignored() {
        let mut cmd = ActuatorCommand::fail_open();
        let overrides = ActuatorOverrides {
            blower_power: Some(1.5),
            blower_valve: Some(-0.1),
            oxygen_valve: Some(f64::NAN),
            ..ActuatorOverrides::default()
        };
        overrides.apply(&mut cmd);
        assert_eq!(cmd, ActuatorCommand::fail_open());
    }

    #[test]
    fn boundary_values_count_as_overrides() {
        let mut cmd = ActuatorCommand::fail_open();
        let overrides = ActuatorOverrides {
            blower_valve: Some(1.0),
            exhale_valve: Some(0.0),
            ..ActuatorOverrides::default()
        };
        overrides.apply(&mut cmd);
        assert_eq!(cmd.blower_valve, 1.0);
        assert_eq!(cmd.exhale_valve, 0.0);
    }
}
