//! [`ThresholdResolver`] – metric severity classification.
//!
//! A range metric is **critical** above its `critical` bound or below its
//! absolute safety floor, **warning** outside `[min, max]`, and **normal**
//! otherwise. Battery is critical at or below `critical` and warning below
//! `low`. Missing or NaN readings are always normal: absence of data is
//! reported through liveness, not through severity.
//!
//! | Metric        | min | max  | critical | safety floor |
//! |---------------|-----|------|----------|--------------|
//! | temperature   | 18  | 28   | 32       | 10           |
//! | humidity      | 30  | 60   | 80       | 10           |
//! | pressure      | 980 | 1030 | 1050     | 950          |
//! | robot temp    | 10  | 45   | 60       | −10          |
//!
//! Battery defaults to `low = 30`, `critical = 15`.
//!
//! # Example
//!
//! ```rust
//! use fleetsync_kernel::thresholds::ThresholdResolver;
//! use fleetsync_types::Severity;
//!
//! let resolver = ThresholdResolver::default();
//! assert_eq!(resolver.temperature_status(Some(30.0)), Severity::Warning);
//! assert_eq!(resolver.temperature_status(Some(33.0)), Severity::Critical);
//! assert_eq!(resolver.temperature_status(None), Severity::Normal);
//! ```

use std::collections::{BTreeMap, HashMap};

use fleetsync_types::Severity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::settings::RobotSettings;

// ────────────────────────────────────────────────────────────────────────────
// Threshold types
// ────────────────────────────────────────────────────────────────────────────

/// Bounds for a two-sided metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeThreshold {
    pub min: f64,
    pub max: f64,
    pub critical: f64,
}

impl RangeThreshold {
    pub const fn new(min: f64, max: f64, critical: f64) -> Self {
        Self { min, max, critical }
    }
}

/// Bounds for battery charge, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryThreshold {
    pub low: f64,
    pub critical: f64,
}

impl BatteryThreshold {
    pub const fn new(low: f64, critical: f64) -> Self {
        Self { low, critical }
    }
}

/// A fully populated threshold configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdSet {
    pub temperature: RangeThreshold,
    pub humidity: RangeThreshold,
    pub pressure: RangeThreshold,
    pub battery: BatteryThreshold,
    #[serde(alias = "robot_temp")]
    pub robot_temp: RangeThreshold,
}

impl Default for ThresholdSet {
    fn default() -> Self {
        Self {
            temperature: RangeThreshold::new(18.0, 28.0, 32.0),
            humidity: RangeThreshold::new(30.0, 60.0, 80.0),
            pressure: RangeThreshold::new(980.0, 1030.0, 1050.0),
            battery: BatteryThreshold::new(30.0, 15.0),
            robot_temp: RangeThreshold::new(10.0, 45.0, 60.0),
        }
    }
}

impl ThresholdSet {
    pub fn range(&self, metric: Metric) -> Option<&RangeThreshold> {
        match metric {
            Metric::Temperature => Some(&self.temperature),
            Metric::Humidity => Some(&self.humidity),
            Metric::Pressure => Some(&self.pressure),
            Metric::RobotTemp => Some(&self.robot_temp),
            Metric::Battery => None,
        }
    }

    fn range_mut(&mut self, metric: Metric) -> Option<&mut RangeThreshold> {
        match metric {
            Metric::Temperature => Some(&mut self.temperature),
            Metric::Humidity => Some(&mut self.humidity),
            Metric::Pressure => Some(&mut self.pressure),
            Metric::RobotTemp => Some(&mut self.robot_temp),
            Metric::Battery => None,
        }
    }

    /// Reset one metric to its default bounds.
    pub fn reset_metric(&mut self, metric: Metric) {
        let defaults = ThresholdSet::default();
        match metric {
            Metric::Battery => self.battery = defaults.battery,
            m => {
                if let (Some(slot), Some(default)) = (self.range_mut(m), defaults.range(m)) {
                    *slot = *default;
                }
            }
        }
    }
}

/// The metrics the resolver classifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    Pressure,
    Battery,
    RobotTemp,
}

impl Metric {
    pub const ALL: [Metric; 5] = [
        Metric::Temperature,
        Metric::Humidity,
        Metric::Pressure,
        Metric::Battery,
        Metric::RobotTemp,
    ];

    /// Key used in persisted settings and validation messages.
    pub fn key(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Pressure => "pressure",
            Metric::Battery => "battery",
            Metric::RobotTemp => "robotTemp",
        }
    }

    /// Human-readable name used in alert messages.
    pub fn label(&self) -> &'static str {
        match self {
            Metric::Temperature => "Temperature",
            Metric::Humidity => "Humidity",
            Metric::Pressure => "Pressure",
            Metric::Battery => "Battery",
            Metric::RobotTemp => "Robot temperature",
        }
    }

    /// Absolute lower bound below which a reading is critical regardless of
    /// configuration. Battery has none.
    pub fn safety_floor(&self) -> Option<f64> {
        match self {
            Metric::Temperature => Some(10.0),
            Metric::Humidity => Some(10.0),
            Metric::Pressure => Some(950.0),
            Metric::RobotTemp => Some(-10.0),
            Metric::Battery => None,
        }
    }

    /// Legacy flat-key prefixes, snake case. Camel-case variants are derived.
    fn legacy_prefixes(&self) -> &'static [&'static str] {
        match self {
            Metric::Temperature => &["temperature", "temp"],
            Metric::Humidity => &["humidity", "hum"],
            Metric::Pressure => &["pressure"],
            Metric::Battery => &["battery"],
            Metric::RobotTemp => &["robot_temp", "robot_temperature"],
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Classification
// ────────────────────────────────────────────────────────────────────────────

fn usable(value: Option<f64>) -> Option<f64> {
    value.filter(|v| !v.is_nan())
}

fn classify_range(value: Option<f64>, t: &RangeThreshold, floor: Option<f64>) -> Severity {
    let Some(v) = usable(value) else {
        return Severity::Normal;
    };
    if v > t.critical || floor.is_some_and(|f| v < f) {
        Severity::Critical
    } else if v < t.min || v > t.max {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

fn classify_battery(value: Option<f64>, t: &BatteryThreshold) -> Severity {
    let Some(v) = usable(value) else {
        return Severity::Normal;
    };
    if v <= t.critical {
        Severity::Critical
    } else if v < t.low {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

/// Coarse robot health bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthLabel {
    Critical,
    Low,
    Fair,
    Good,
}

impl HealthLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLabel::Critical => "Critical",
            HealthLabel::Low => "Low",
            HealthLabel::Fair => "Fair",
            HealthLabel::Good => "Good",
        }
    }
}

/// Battery-derived health of a robot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RobotHealth {
    pub label: HealthLabel,
    /// `battery / 100`, clamped to `[0, 1]`.
    pub score: f64,
}

/// Classifies readings against a [`ThresholdSet`], honouring per-robot
/// battery overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdResolver {
    thresholds: ThresholdSet,
    battery_overrides: HashMap<String, BatteryThreshold>,
}

impl ThresholdResolver {
    pub fn new(thresholds: ThresholdSet) -> Self {
        Self {
            thresholds,
            battery_overrides: HashMap::new(),
        }
    }

    /// Install per-robot battery overrides. A partial override inherits the
    /// missing bound from the global set.
    pub fn with_robot_settings(mut self, robots: &BTreeMap<String, RobotSettings>) -> Self {
        self.battery_overrides = robots
            .iter()
            .filter(|(_, s)| s.battery_low.is_some() || s.battery_critical.is_some())
            .map(|(id, s)| {
                let low = s.battery_low.unwrap_or(self.thresholds.battery.low);
                let critical = s.battery_critical.unwrap_or(self.thresholds.battery.critical);
                (id.clone(), BatteryThreshold::new(low, critical))
            })
            .collect();
        self
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    /// Battery bounds in force for `robot_id`.
    pub fn battery_for(&self, robot_id: Option<&str>) -> &BatteryThreshold {
        robot_id
            .and_then(|id| self.battery_overrides.get(id))
            .unwrap_or(&self.thresholds.battery)
    }

    pub fn temperature_status(&self, value: Option<f64>) -> Severity {
        self.classify(Metric::Temperature, value)
    }

    pub fn humidity_status(&self, value: Option<f64>) -> Severity {
        self.classify(Metric::Humidity, value)
    }

    pub fn pressure_status(&self, value: Option<f64>) -> Severity {
        self.classify(Metric::Pressure, value)
    }

    pub fn battery_status(&self, value: Option<f64>) -> Severity {
        self.classify(Metric::Battery, value)
    }

    pub fn robot_temp_status(&self, value: Option<f64>) -> Severity {
        self.classify(Metric::RobotTemp, value)
    }

    /// Battery severity for a specific robot.
    pub fn robot_battery_status(&self, robot_id: &str, value: Option<f64>) -> Severity {
        classify_battery(value, self.battery_for(Some(robot_id)))
    }

    /// Classify `value` for `metric` against the global thresholds.
    pub fn classify(&self, metric: Metric, value: Option<f64>) -> Severity {
        match self.thresholds.range(metric) {
            Some(range) => classify_range(value, range, metric.safety_floor()),
            None => classify_battery(value, &self.thresholds.battery),
        }
    }

    /// Health bucket for a battery reading. `None` when there is no reading.
    pub fn robot_health(&self, battery_pct: Option<f64>) -> Option<RobotHealth> {
        health(battery_pct, &self.thresholds.battery)
    }

    pub fn robot_health_for(&self, robot_id: &str, battery_pct: Option<f64>) -> Option<RobotHealth> {
        health(battery_pct, self.battery_for(Some(robot_id)))
    }
}

fn health(battery_pct: Option<f64>, t: &BatteryThreshold) -> Option<RobotHealth> {
    let pct = usable(battery_pct)?;
    let label = if pct <= t.critical {
        HealthLabel::Critical
    } else if pct < t.low {
        HealthLabel::Low
    } else if pct < t.low * 2.0 {
        HealthLabel::Fair
    } else {
        HealthLabel::Good
    };
    Some(RobotHealth {
        label,
        score: (pct / 100.0).clamp(0.0, 1.0),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Layered resolution
// ────────────────────────────────────────────────────────────────────────────

/// Resolve a loosely shaped settings object into a complete [`ThresholdSet`].
///
/// Sources in priority order:
/// 1. a pre-built `thresholds` object (`{"temperature": {"min": …}, …}`),
/// 2. flat per-field keys such as `temperature_min` or `tempMin`,
/// 3. the defaults.
///
/// Numbers may arrive as JSON numbers or numeric strings. Anything else is
/// ignored.
pub fn resolve_thresholds(raw: &Value) -> ThresholdSet {
    resolve_with_warnings(raw, &mut Vec::new())
}

/// [`resolve_thresholds`], also collecting a message for every field that was
/// present but unusable.
pub(crate) fn resolve_with_warnings(raw: &Value, warnings: &mut Vec<String>) -> ThresholdSet {
    let mut set = ThresholdSet::default();
    if !raw.is_object() {
        return set;
    }

    for metric in Metric::ALL {
        for field in fields_of(metric) {
            let keys = flat_keys(metric, field);
            if let Some(v) = first_number(raw, &keys, warnings) {
                set_field(&mut set, metric, field, v);
            }
        }
    }

    if let Some(obj) = raw.get("thresholds") {
        let obj = decode_embedded(obj);
        if obj.is_object() {
            for metric in Metric::ALL {
                let section = obj
                    .get(metric.key())
                    .or_else(|| obj.get(metric.legacy_prefixes()[0]));
                let Some(section) = section else { continue };
                for field in fields_of(metric) {
                    let label = format!("thresholds.{}.{field}", metric.key());
                    if let Some(v) = section.get(field) {
                        match number(v) {
                            Some(n) => set_field(&mut set, metric, field, n),
                            None => warnings.push(format!("{label}: not a number")),
                        }
                    }
                }
            }
        } else if !obj.is_null() {
            warnings.push("thresholds: expected an object".to_string());
        }
    }
    set
}

fn fields_of(metric: Metric) -> &'static [&'static str] {
    match metric {
        Metric::Battery => &["low", "critical"],
        _ => &["min", "max", "critical"],
    }
}

fn set_field(set: &mut ThresholdSet, metric: Metric, field: &str, v: f64) {
    if metric == Metric::Battery {
        match field {
            "low" => set.battery.low = v,
            "critical" => set.battery.critical = v,
            _ => {}
        }
        return;
    }
    if let Some(range) = set.range_mut(metric) {
        match field {
            "min" => range.min = v,
            "max" => range.max = v,
            "critical" => range.critical = v,
            _ => {}
        }
    }
}

fn flat_keys(metric: Metric, field: &str) -> Vec<String> {
    metric
        .legacy_prefixes()
        .iter()
        .flat_map(|prefix| {
            let snake = format!("{prefix}_{field}");
            let camel = camel_case(&snake);
            [snake, camel]
        })
        .collect()
}

fn camel_case(snake: &str) -> String {
    let mut out = String::with_capacity(snake.len());
    for (i, part) in snake.split('_').enumerate() {
        if i == 0 {
            out.push_str(part);
            continue;
        }
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

fn first_number(raw: &Value, keys: &[String], warnings: &mut Vec<String>) -> Option<f64> {
    for key in keys {
        if let Some(v) = raw.get(key) {
            match number(v) {
                Some(n) => return Some(n),
                None => warnings.push(format!("{key}: not a number")),
            }
        }
    }
    None
}

/// A finite number from a JSON number or numeric string.
pub(crate) fn number(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

/// Persistence wrappers sometimes store objects as JSON-encoded strings.
pub(crate) fn decode_embedded(v: &Value) -> Value {
    match v {
        Value::String(s) => serde_json::from_str(s).unwrap_or(Value::Null),
        other => other.clone(),
    }
}
