use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ────────────────────────────────────────────────────────────────────────────
// Severity
// ────────────────────────────────────────────────────────────────────────────

/// Classification of a single metric against its configured thresholds.
///
/// Ordered so that `Normal < Warning < Critical`, which lets callers fold a
/// set of metric severities with `max()`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Normal,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// `true` for `Warning` and `Critical`.
    pub fn is_alerting(&self) -> bool {
        *self != Severity::Normal
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity carried by an [`Alert`]. Alerts are never raised for normal
/// readings, so this is the alerting subset of [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

impl AlertLevel {
    /// Map a metric severity onto an alert level; `Normal` has none.
    pub fn from_severity(severity: Severity) -> Option<Self> {
        match severity {
            Severity::Normal => None,
            Severity::Warning => Some(AlertLevel::Warning),
            Severity::Critical => Some(AlertLevel::Critical),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Geometry
// ────────────────────────────────────────────────────────────────────────────

/// A WGS-84 coordinate pair in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GpsPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// `true` when both components are finite numbers.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Devices
// ────────────────────────────────────────────────────────────────────────────

/// Roster entry for a fixed device. The roster is loaded once at start-up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSpec {
    pub id: String,
    #[serde(default)]
    pub zone: String,
}

impl DeviceSpec {
    pub fn new(id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            zone: zone.into(),
        }
    }
}

/// Ambient readings reported by a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
}

/// Actuator and health flags reported on the device `state/` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceControls {
    pub ac: Option<bool>,
    pub air_purifier: Option<bool>,
    pub status: Option<String>,
    pub gateway_health: Option<String>,
    pub active_alert: Option<String>,
    pub signal: Option<i64>,
    pub emergency_stop: Option<bool>,
}

/// Counts of robot tasks under a device, derived from the robot map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub active: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Canonical state of a fixed device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub id: String,
    pub zone: String,
    pub environment: Environment,
    pub controls: DeviceControls,
    pub task_summary: TaskSummary,
    /// Worst severity across the environment metrics.
    pub severity: Severity,
    /// Ingestion time of the last event that touched this record.
    pub last_update: Option<DateTime<Utc>>,
}

impl DeviceState {
    pub fn new(spec: &DeviceSpec) -> Self {
        Self {
            id: spec.id.clone(),
            zone: spec.zone.clone(),
            environment: Environment::default(),
            controls: DeviceControls::default(),
            task_summary: TaskSummary::default(),
            severity: Severity::Normal,
            last_update: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Robots
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotEnvironment {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotStatus {
    /// Battery charge in percent (0–100).
    pub battery: Option<f64>,
    /// Carried load, in whatever unit the robot reports.
    pub load: Option<f64>,
    /// Free-form controller state (e.g. `"IDLE"`, `"MOVING"`, `"ERROR"`).
    pub state: Option<String>,
}

/// Canonical state of a mobile robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotState {
    pub id: String,
    /// The device this robot currently reports under.
    pub device_id: String,
    pub location: Option<GpsPoint>,
    pub elevation: Option<f64>,
    pub heading: Option<f64>,
    pub environment: RobotEnvironment,
    pub status: RobotStatus,
    pub task: Option<Task>,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
}

impl RobotState {
    /// A robot with no telemetry yet.
    pub fn new(id: impl Into<String>, device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            location: None,
            elevation: None,
            heading: None,
            environment: RobotEnvironment::default(),
            status: RobotStatus::default(),
            task: None,
            severity: Severity::Normal,
            first_seen: now,
            last_update: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tasks
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle phase of a delivery task, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    Assigned,
    EnRouteToSource,
    PickingUp,
    EnRouteToDestination,
    Delivering,
    Completed,
    Failed,
}

impl TaskPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPhase::Assigned => "ASSIGNED",
            TaskPhase::EnRouteToSource => "EN_ROUTE_TO_SOURCE",
            TaskPhase::PickingUp => "PICKING_UP",
            TaskPhase::EnRouteToDestination => "EN_ROUTE_TO_DESTINATION",
            TaskPhase::Delivering => "DELIVERING",
            TaskPhase::Completed => "COMPLETED",
            TaskPhase::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` freeze the task.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Completed | TaskPhase::Failed)
    }

    /// Parse a phase name as producers actually send it: case-insensitive,
    /// with `-` or spaces in place of `_`, plus a handful of common aliases.
    pub fn parse(raw: &str) -> Option<Self> {
        let key: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();
        match key.as_str() {
            "ASSIGNED" | "PENDING" | "QUEUED" | "NEW" => Some(TaskPhase::Assigned),
            "EN_ROUTE_TO_SOURCE" | "ENROUTE_TO_SOURCE" | "TO_SOURCE" => {
                Some(TaskPhase::EnRouteToSource)
            }
            "PICKING_UP" | "PICKUP" | "PICKING" | "LOADING" => Some(TaskPhase::PickingUp),
            "EN_ROUTE_TO_DESTINATION" | "ENROUTE_TO_DESTINATION" | "TO_DESTINATION"
            | "IN_TRANSIT" => Some(TaskPhase::EnRouteToDestination),
            "DELIVERING" | "DROPPING_OFF" | "UNLOADING" => Some(TaskPhase::Delivering),
            "COMPLETED" | "COMPLETE" | "DONE" | "DELIVERED" => Some(TaskPhase::Completed),
            "FAILED" | "ERROR" | "CANCELLED" | "CANCELED" | "ABORTED" => Some(TaskPhase::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A multi-phase delivery task carried by a robot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Producer-defined type, e.g. `"Deliver"`.
    pub task_type: String,
    pub phase: TaskPhase,
    /// Room name of the pickup location.
    pub source: String,
    /// Room name of the drop-off location.
    pub destination: String,
    pub source_gps: Option<GpsPoint>,
    pub destination_gps: Option<GpsPoint>,
    /// Integer progress, 0–100.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the current phase was entered.
    pub phase_started_at: DateTime<Utc>,
    /// When the robot entered the geofence relevant to the current phase.
    pub geofence_entered_at: Option<DateTime<Utc>>,
    /// Robot position when the current phase was entered.
    pub leg_origin: Option<GpsPoint>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            phase: TaskPhase::Assigned,
            source: source.into(),
            destination: destination.into(),
            source_gps: None,
            destination_gps: None,
            progress: 0,
            created_at: now,
            updated_at: now,
            phase_started_at: now,
            geofence_entered_at: None,
            leg_origin: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Alerts
// ────────────────────────────────────────────────────────────────────────────

/// An operator-facing alert raised by a threshold transition or a fault flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertLevel,
    pub device_id: String,
    pub robot_id: Option<String>,
    /// Deduplication key: identical messages inside the window collapse.
    pub message: String,
    /// The metric reading that triggered the alert, when there is one.
    pub value: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Normalized events
// ────────────────────────────────────────────────────────────────────────────

/// Which record an event addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTarget {
    pub device_id: String,
    pub robot_id: Option<String>,
}

impl EventTarget {
    pub fn device(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            robot_id: None,
        }
    }

    pub fn robot(device_id: impl Into<String>, robot_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            robot_id: Some(robot_id.into()),
        }
    }
}

/// A message after normalization: one target, one kind, ingestion time set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub id: Uuid,
    /// Topic the raw message arrived on.
    pub source_topic: String,
    pub target: EventTarget,
    /// Timestamp embedded by the producer, if any. Informational only.
    pub produced_at: Option<DateTime<Utc>>,
    /// Ingestion time. Drives `last_update` and liveness.
    pub received_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl TelemetryEvent {
    pub fn new(
        source_topic: impl Into<String>,
        target: EventTarget,
        received_at: DateTime<Utc>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_topic: source_topic.into(),
            target,
            produced_at: None,
            received_at,
            payload,
        }
    }

    pub fn with_produced_at(mut self, produced_at: Option<DateTime<Utc>>) -> Self {
        self.produced_at = produced_at;
        self
    }
}

/// Variants of normalized telemetry that the store knows how to merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    Environment(EnvironmentUpdate),
    Ac { power: bool },
    AirPurifier { power: bool },
    Status(StatusUpdate),
    RobotDiscovery { robot_ids: Vec<String> },
    RobotLocation(LocationUpdate),
    RobotTemperature(RobotEnvironmentUpdate),
    RobotStatus(RobotStatusUpdate),
    RobotBattery { battery: f64 },
    RobotTask(TaskUpdate),
    /// Best-effort wrapper for a payload that could not be interpreted.
    Raw { payload: String, reason: String },
}

impl EventPayload {
    /// Short kind label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Environment(_) => "environment",
            EventPayload::Ac { .. } => "ac",
            EventPayload::AirPurifier { .. } => "air_purifier",
            EventPayload::Status(_) => "status",
            EventPayload::RobotDiscovery { .. } => "robot_discovery",
            EventPayload::RobotLocation(_) => "robot_location",
            EventPayload::RobotTemperature(_) => "robot_temperature",
            EventPayload::RobotStatus(_) => "robot_status",
            EventPayload::RobotBattery { .. } => "robot_battery",
            EventPayload::RobotTask(_) => "robot_task",
            EventPayload::Raw { .. } => "raw",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentUpdate {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
}

impl EnvironmentUpdate {
    pub fn is_empty(&self) -> bool {
        self.temperature.is_none() && self.humidity.is_none() && self.pressure.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: Option<String>,
    pub gateway_health: Option<String>,
    pub active_alert: Option<String>,
    pub signal: Option<i64>,
    pub emergency_stop: Option<bool>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.gateway_health.is_none()
            && self.active_alert.is_none()
            && self.signal.is_none()
            && self.emergency_stop.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationUpdate {
    pub point: GpsPoint,
    pub elevation: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotEnvironmentUpdate {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotStatusUpdate {
    pub battery: Option<f64>,
    pub load: Option<f64>,
    pub state: Option<String>,
}

/// Partial task information as carried on a `tasks` topic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: Option<String>,
    pub task_type: Option<String>,
    pub phase: Option<TaskPhase>,
    pub source: Option<String>,
    pub destination: Option<String>,
    pub source_gps: Option<GpsPoint>,
    pub destination_gps: Option<GpsPoint>,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// A validation message attached to a single input field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type shared by every FleetSync crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FleetError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connect timed out after {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation failed: {}", join_field_errors(.0))]
    Validation(Vec<FieldError>),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Channel error: {0}")]
    Channel(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_by_urgency() {
        assert!(Severity::Normal < Severity::Warning);
        assert!(Severity::Warning < Severity::Critical);
        let worst = [Severity::Warning, Severity::Normal, Severity::Critical]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, Severity::Critical);
    }

    #[test]
    fn severity_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), "\"warning\"");
        assert_eq!(Severity::Critical.to_string(), "critical");
    }

    #[test]
    fn alert_level_has_no_normal() {
        assert_eq!(AlertLevel::from_severity(Severity::Normal), None);
        assert_eq!(
            AlertLevel::from_severity(Severity::Critical),
            Some(AlertLevel::Critical)
        );
    }

    #[test]
    fn task_phase_parse_accepts_producer_spellings() {
        assert_eq!(TaskPhase::parse("en-route-to-source"), Some(TaskPhase::EnRouteToSource));
        assert_eq!(TaskPhase::parse(" picking up "), Some(TaskPhase::PickingUp));
        assert_eq!(TaskPhase::parse("delivered"), Some(TaskPhase::Completed));
        assert_eq!(TaskPhase::parse("cancelled"), Some(TaskPhase::Failed));
        assert_eq!(TaskPhase::parse("teleporting"), None);
    }

    #[test]
    fn task_phase_serde_uses_wire_names() {
        let json = serde_json::to_string(&TaskPhase::EnRouteToDestination).unwrap();
        assert_eq!(json, "\"EN_ROUTE_TO_DESTINATION\"");
        let back: TaskPhase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TaskPhase::EnRouteToDestination);
    }

    #[test]
    fn terminal_phases() {
        assert!(TaskPhase::Completed.is_terminal());
        assert!(TaskPhase::Failed.is_terminal());
        assert!(!TaskPhase::Delivering.is_terminal());
    }

    #[test]
    fn new_task_starts_assigned_at_zero() {
        let now = Utc::now();
        let task = Task::new("TASK-1", "Deliver", "Cleanroom A", "Storage", now);
        assert_eq!(task.phase, TaskPhase::Assigned);
        assert_eq!(task.progress, 0);
        assert_eq!(task.phase_started_at, now);
    }

    #[test]
    fn event_payload_is_tagged_by_kind() {
        let payload = EventPayload::RobotBattery { battery: 42.0 };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "robot_battery");
        assert_eq!(payload.kind(), "robot_battery");
    }

    #[test]
    fn validation_error_lists_fields() {
        let err = FleetError::Validation(vec![
            FieldError::new("temperature.min", "must be less than max"),
            FieldError::new("battery.low", "must be within 0-100"),
        ]);
        let text = err.to_string();
        assert!(text.contains("temperature.min: must be less than max"));
        assert!(text.contains("battery.low"));
    }

    #[test]
    fn fleet_error_display() {
        let err = FleetError::ConnectTimeout { timeout_ms: 15_000 };
        assert!(err.to_string().contains("15000 ms"));
        let err = FleetError::UnknownDevice("dev-9".to_string());
        assert!(err.to_string().contains("dev-9"));
    }
}
