//! Versioned operator settings.
//!
//! Settings reach the engine from an external key-value store that has seen
//! several shapes over time: flat threshold keys, JSON-encoded strings in
//! place of objects, lower-case mode names, snake-case robot settings. They
//! are brought to [`SETTINGS_SCHEMA_VERSION`] once, on load, by
//! [`migrate_settings`]; nothing downstream re-derives defaults.
//!
//! Migration never fails. Every field it had to discard is reported as a
//! [`FleetError::Config`] warning and replaced by its default.

use std::collections::BTreeMap;

use fleetsync_types::{FieldError, FleetError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::thresholds::{Metric, ThresholdSet, decode_embedded, number, resolve_with_warnings};

/// Current settings schema.
pub const SETTINGS_SCHEMA_VERSION: u32 = 2;

/// Who drives the actuators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SystemMode {
    /// Operators toggle actuators by hand.
    #[default]
    Manual,
    /// The engine may toggle AC and air purifier in response to readings.
    Automatic,
}

impl SystemMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Manual => "MANUAL",
            SystemMode::Automatic => "AUTOMATIC",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MANUAL" => Some(SystemMode::Manual),
            "AUTOMATIC" | "AUTO" => Some(SystemMode::Automatic),
            _ => None,
        }
    }
}

/// Per-robot operator preferences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(default, alias = "battery_low", skip_serializing_if = "Option::is_none")]
    pub battery_low: Option<f64>,
    #[serde(default, alias = "battery_critical", skip_serializing_if = "Option::is_none")]
    pub battery_critical: Option<f64>,
}

/// The complete, current-schema settings record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub version: u32,
    pub thresholds: ThresholdSet,
    pub system_mode: SystemMode,
    pub robot_settings: BTreeMap<String, RobotSettings>,
    pub selected_device: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            thresholds: ThresholdSet::default(),
            system_mode: SystemMode::Manual,
            robot_settings: BTreeMap::new(),
            selected_device: None,
        }
    }
}

/// Result of [`migrate_settings`].
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub settings: Settings,
    /// Schema version found in the input; `0` when it carried none.
    pub from_version: u32,
    pub warnings: Vec<FleetError>,
}

impl Migration {
    /// `true` when the stored record needs rewriting.
    pub fn changed(&self) -> bool {
        self.from_version != SETTINGS_SCHEMA_VERSION || !self.warnings.is_empty()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Migration
// ────────────────────────────────────────────────────────────────────────────

fn lookup<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| raw.get(*k)).filter(|v| !v.is_null())
}

/// Bring any historical settings shape to the current schema.
///
/// Accepts an object keyed the way the settings store keys it (`thresholds`,
/// `systemMode`, `robotSettings`, `selectedDevice`, `settingsVersion`), plus
/// the legacy flat and snake-case spellings.
pub fn migrate_settings(raw: &Value) -> Migration {
    let mut notes: Vec<String> = Vec::new();

    if !raw.is_object() && !raw.is_null() {
        notes.push("settings: expected an object".to_string());
    }

    let from_version = match lookup(raw, &["settingsVersion", "version"]) {
        None => 0,
        Some(v) => match number(v) {
            Some(n) if n >= 0.0 && n.fract() == 0.0 && n <= u32::MAX as f64 => n as u32,
            _ => {
                notes.push("settingsVersion: not a version number".to_string());
                0
            }
        },
    };
    if from_version > SETTINGS_SCHEMA_VERSION {
        notes.push(format!(
            "settingsVersion: {from_version} is newer than supported {SETTINGS_SCHEMA_VERSION}"
        ));
    }

    let mut thresholds = resolve_with_warnings(raw, &mut notes);
    if let Err(FleetError::Validation(errors)) = validate_thresholds(&thresholds) {
        for metric in metrics_named_in(&errors) {
            notes.push(format!("thresholds.{}: inconsistent, using defaults", metric.key()));
            thresholds.reset_metric(metric);
        }
    }

    let system_mode = match lookup(raw, &["systemMode", "system_mode", "mode"]) {
        None => SystemMode::default(),
        Some(v) => match v.as_str().and_then(SystemMode::parse) {
            Some(mode) => mode,
            None => {
                notes.push(format!("systemMode: unrecognised value {v}"));
                SystemMode::default()
            }
        },
    };

    let robot_settings = match lookup(raw, &["robotSettings", "robot_settings"]) {
        None => BTreeMap::new(),
        Some(v) => migrate_robot_settings(&decode_embedded(v), &mut notes),
    };

    let selected_device = match lookup(raw, &["selectedDevice", "selected_device", "deviceId"]) {
        None => None,
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(v) => {
            notes.push(format!("selectedDevice: unusable value {v}"));
            None
        }
    };

    for note in &notes {
        warn!(warning = %note, from_version, "settings migration");
    }

    Migration {
        settings: Settings {
            version: SETTINGS_SCHEMA_VERSION,
            thresholds,
            system_mode,
            robot_settings,
            selected_device,
        },
        from_version,
        warnings: notes.into_iter().map(FleetError::Config).collect(),
    }
}

fn migrate_robot_settings(v: &Value, notes: &mut Vec<String>) -> BTreeMap<String, RobotSettings> {
    let Some(map) = v.as_object() else {
        notes.push("robotSettings: expected an object".to_string());
        return BTreeMap::new();
    };
    let mut out = BTreeMap::new();
    for (robot_id, entry) in map {
        let entry = decode_embedded(entry);
        if !entry.is_object() {
            notes.push(format!("robotSettings.{robot_id}: expected an object"));
            continue;
        }
        let alias = lookup(&entry, &["alias", "name", "nickname"])
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut battery = |keys: &[&str], field: &str| match lookup(&entry, keys) {
            None => None,
            Some(v) => match number(v).filter(|n| (0.0..=100.0).contains(n)) {
                Some(n) => Some(n),
                None => {
                    notes.push(format!("robotSettings.{robot_id}.{field}: not a percentage"));
                    None
                }
            },
        };
        let battery_low = battery(&["batteryLow", "battery_low", "lowBattery"], "batteryLow");
        let battery_critical = battery(
            &["batteryCritical", "battery_critical", "criticalBattery"],
            "batteryCritical",
        );
        out.insert(
            robot_id.clone(),
            RobotSettings {
                alias,
                battery_low,
                battery_critical,
            },
        );
    }
    out
}

fn metrics_named_in(errors: &[FieldError]) -> Vec<Metric> {
    Metric::ALL
        .into_iter()
        .filter(|m| {
            errors
                .iter()
                .any(|e| e.field.split('.').next() == Some(m.key()))
        })
        .collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

/// Check an operator-supplied threshold set.
///
/// Returns [`FleetError::Validation`] with one [`FieldError`] per problem so
/// that each can be shown next to its input.
pub fn validate_thresholds(set: &ThresholdSet) -> Result<(), FleetError> {
    let mut errors = Vec::new();

    for metric in [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::RobotTemp,
    ] {
        let Some(t) = set.range(metric) else { continue };
        let key = metric.key();
        let values = [("min", t.min), ("max", t.max), ("critical", t.critical)];
        let mut finite = true;
        for (field, v) in values {
            if !v.is_finite() {
                errors.push(FieldError::new(format!("{key}.{field}"), "must be a number"));
                finite = false;
            }
        }
        if !finite {
            continue;
        }
        if t.min >= t.max {
            errors.push(FieldError::new(format!("{key}.min"), "must be less than max"));
        }
        if t.max > t.critical {
            errors.push(FieldError::new(
                format!("{key}.max"),
                "must not exceed critical",
            ));
        }
        if metric == Metric::Humidity {
            for (field, v) in values {
                if !(0.0..=100.0).contains(&v) {
                    errors.push(FieldError::new(
                        format!("{key}.{field}"),
                        "must be within 0-100",
                    ));
                }
            }
        }
    }

    let b = &set.battery;
    let mut battery_in_range = true;
    for (field, v) in [("low", b.low), ("critical", b.critical)] {
        if !v.is_finite() || !(0.0..=100.0).contains(&v) {
            errors.push(FieldError::new(
                format!("battery.{field}"),
                "must be within 0-100",
            ));
            battery_in_range = false;
        }
    }
    if battery_in_range && b.critical >= b.low {
        errors.push(FieldError::new("battery.critical", "must be less than low"));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(FleetError::Validation(errors))
    }
}
