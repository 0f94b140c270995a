//! Climate automation for `AUTOMATIC` system mode.
//!
//! | Actuator     | Switched on when              | Switched off when                     |
//! |--------------|-------------------------------|---------------------------------------|
//! | AC           | temperature above `max`       | temperature at or below mid-band      |
//! | air purifier | humidity above `max`          | humidity at or below mid-band         |
//!
//! Mid-band is `(min + max) / 2` of the metric's range; readings between
//! mid-band and `max` leave the actuator as it is. A command is only issued
//! when the device reports a different actuator state, and only once until
//! the device echoes it back. An engaged emergency stop suspends automation.

use std::collections::HashMap;

use fleetsync_kernel::{RangeThreshold, SystemMode, ThresholdSet};
use fleetsync_middleware::Command;
use fleetsync_types::DeviceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Actuator {
    Ac,
    AirPurifier,
}

impl Actuator {
    fn command(self, power: bool) -> Command {
        match self {
            Actuator::Ac => Command::Ac { power },
            Actuator::AirPurifier => Command::AirPurifier { power },
        }
    }

    fn reported(self, device: &DeviceState) -> Option<bool> {
        match self {
            Actuator::Ac => device.controls.ac,
            Actuator::AirPurifier => device.controls.air_purifier,
        }
    }
}

fn wanted(reading: Option<f64>, range: &RangeThreshold) -> Option<bool> {
    let value = reading.filter(|v| v.is_finite())?;
    if value > range.max {
        Some(true)
    } else if value <= (range.min + range.max) / 2.0 {
        Some(false)
    } else {
        None
    }
}

/// Remembers commands issued but not yet confirmed by the device.
#[derive(Debug, Default)]
pub struct AutomationPolicy {
    pending: HashMap<(String, Actuator), bool>,
}

impl AutomationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commands to send for `device` given its latest state.
    pub fn evaluate(
        &mut self,
        mode: SystemMode,
        device: &DeviceState,
        thresholds: &ThresholdSet,
    ) -> Vec<Command> {
        if mode != SystemMode::Automatic || device.controls.emergency_stop == Some(true) {
            self.forget(&device.id);
            return Vec::new();
        }
        let env = &device.environment;
        [
            (Actuator::Ac, wanted(env.temperature, &thresholds.temperature)),
            (Actuator::AirPurifier, wanted(env.humidity, &thresholds.humidity)),
        ]
        .into_iter()
        .filter_map(|(actuator, want)| {
            let want = want?;
            let key = (device.id.clone(), actuator);
            if actuator.reported(device) == Some(want) {
                self.pending.remove(&key);
                return None;
            }
            if self.pending.get(&key) == Some(&want) {
                return None;
            }
            self.pending.insert(key, want);
            Some(actuator.command(want))
        })
        .collect()
    }

    /// Drop the pending entry for a command that never reached the broker,
    /// so the next reading tries again.
    pub fn publish_failed(&mut self, device_id: &str, command: &Command) {
        let actuator = match command {
            Command::Ac { .. } => Actuator::Ac,
            Command::AirPurifier { .. } => Actuator::AirPurifier,
            _ => return,
        };
        self.pending.remove(&(device_id.to_string(), actuator));
    }

    pub fn forget(&mut self, device_id: &str) {
        self.pending.retain(|(id, _), _| id != device_id);
    }
}
