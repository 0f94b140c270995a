//! Canonical device and robot state.
//!
//! [`TelemetryStore`] is the reconciliation core. It owns one record per
//! rostered device and one per discovered robot, merges normalized events
//! into them field by field, classifies the affected metrics and keeps the
//! alert log. It is deliberately synchronous: one owner (the reconciliation
//! loop) mutates it, readers take short read locks and walk away with `Arc`
//! clones of the records they asked for.
//!
//! # Merge rules
//!
//! - A field absent from an event keeps its previous value.
//! - `last_update` is the ingestion time, never the producer's timestamp.
//! - A robot belongs to exactly one device. Seeing it under another device
//!   moves the record there.
//! - Alerts fire on a transition into warning or critical, per record and
//!   per signal. Falling back to normal is silent.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use fleetsync_store::TelemetryStore;
//! use fleetsync_types::{DeviceSpec, EventPayload, EventTarget, TelemetryEvent};
//!
//! let mut store = TelemetryStore::with_defaults(&[DeviceSpec::new("dev-1", "Zone A")]);
//! let event = TelemetryEvent::new(
//!     "stream/dev-1",
//!     EventTarget::device("dev-1"),
//!     Utc::now(),
//!     EventPayload::RobotDiscovery { robot_ids: vec!["R1".into()] },
//! );
//! let outcome = store.apply(&event).unwrap();
//! assert_eq!(outcome.discovered.len(), 1);
//! assert_eq!(store.robots("dev-1").len(), 1);
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fleetsync_kernel::liveness::millis;
use fleetsync_kernel::{AlertLog, Liveness, Metric, ThresholdResolver, ThresholdSet};
use fleetsync_spatial::{
    PhaseTiming, RoomRegistry, enter_phase, generate_task_id, reconcile_task, refresh_progress,
    track_geofence,
};
use fleetsync_types::{
    Alert, AlertLevel, DeviceSpec, DeviceState, EnvironmentUpdate, EventPayload, FleetError,
    LocationUpdate, RobotEnvironmentUpdate, RobotState, RobotStatusUpdate, Severity,
    StatusUpdate, Task, TaskPhase, TaskSummary, TaskUpdate, TelemetryEvent,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Task type assumed when an assignment does not name one.
const DEFAULT_TASK_TYPE: &str = "Deliver";
/// Raw events kept for inspection.
const RAW_HISTORY: usize = 20;

/// Device `active_alert` values that mean "no alert".
const CLEAR_ALERT_VALUES: &[&str] = &["", "none", "null", "ok", "normal", "false", "0", "clear"];
/// Robot states that count as a fault.
const ROBOT_FAULT_STATES: &[&str] = &[
    "ERROR",
    "FAULT",
    "EMERGENCY",
    "EMERGENCY_STOP",
    "ESTOP",
    "E_STOP",
    "STUCK",
];

// ─────────────────────────────────────────────────────────────────────────────
// Options and outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for a [`TelemetryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub liveness_ms: u64,
    pub alert_capacity: usize,
    pub alert_dedup_secs: u64,
    /// Evict robots silent for this long. `None` keeps them forever.
    pub robot_ttl_secs: Option<u64>,
    /// Period of the elapsed-time phase fallback.
    pub tick_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            liveness_ms: fleetsync_kernel::liveness::DEFAULT_LIVENESS_MS,
            alert_capacity: fleetsync_kernel::alerts::DEFAULT_ALERT_CAPACITY,
            alert_dedup_secs: fleetsync_kernel::alerts::DEFAULT_DEDUP_WINDOW_SECS,
            robot_ttl_secs: None,
            tick_ms: 1_000,
        }
    }
}

/// A robot under a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RobotRef {
    pub device_id: String,
    pub robot_id: String,
}

impl RobotRef {
    pub fn new(device_id: impl Into<String>, robot_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            robot_id: robot_id.into(),
        }
    }
}

/// A task entering a new phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseChange {
    pub robot: RobotRef,
    pub task_id: String,
    pub phase: TaskPhase,
}

/// What applying one event did beyond the merge itself.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyOutcome {
    /// Alerts appended to the log.
    pub alerts: Vec<Alert>,
    /// Robots created or moved to a new device. Their topics need
    /// subscribing.
    pub discovered: Vec<RobotRef>,
    pub phase_changes: Vec<PhaseChange>,
}

/// Persisted state of one device and its robots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub device: DeviceState,
    pub robots: Vec<RobotState>,
    pub taken_at: DateTime<Utc>,
}

/// What [`TelemetryStore::hydrate`] filled in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HydrateOutcome {
    pub device_filled: bool,
    pub robots_filled: Vec<String>,
    /// Robots that did not exist before hydration.
    pub discovered: Vec<RobotRef>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signal tracking
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Device(String),
    Robot(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Signal {
    Metric(Metric),
    ActiveAlert,
    EmergencyStop,
    RobotFault,
}

fn subject(device_id: &str, robot_id: Option<&str>) -> String {
    match robot_id {
        Some(robot_id) => format!("{robot_id} ({device_id})"),
        None => device_id.to_string(),
    }
}

fn alert_message(
    signal: Signal,
    severity: Severity,
    device_id: &str,
    robot_id: Option<&str>,
    detail: Option<&str>,
) -> String {
    let subject = subject(device_id, robot_id);
    match signal {
        Signal::Metric(metric) => format!("{} {severity} on {subject}", metric.label()),
        Signal::ActiveAlert => format!("Alert on {subject}: {}", detail.unwrap_or("active")),
        Signal::EmergencyStop => format!("Emergency stop engaged on {subject}"),
        Signal::RobotFault => format!("Robot fault on {subject}: {}", detail.unwrap_or("fault")),
    }
}

fn active_alert_text(raw: Option<&str>) -> Option<&str> {
    let raw = raw?.trim();
    let cleared = CLEAR_ALERT_VALUES
        .iter()
        .any(|v| v.eq_ignore_ascii_case(raw));
    (!cleared).then_some(raw)
}

fn is_fault_state(state: Option<&str>) -> bool {
    state.is_some_and(|s| {
        let key = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        ROBOT_FAULT_STATES.contains(&key.as_str())
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// TelemetryStore
// ─────────────────────────────────────────────────────────────────────────────

pub struct TelemetryStore {
    devices: BTreeMap<String, Arc<DeviceState>>,
    robots: HashMap<String, BTreeMap<String, Arc<RobotState>>>,
    robot_owner: HashMap<String, String>,
    signals: HashMap<(Scope, Signal), Severity>,
    alerts: AlertLog,
    resolver: ThresholdResolver,
    rooms: Arc<RoomRegistry>,
    liveness: Liveness,
    timing: PhaseTiming,
    robot_ttl: Option<Duration>,
    raw_count: u64,
    recent_raw: VecDeque<Arc<TelemetryEvent>>,
}

impl TelemetryStore {
    pub fn new(
        roster: &[DeviceSpec],
        resolver: ThresholdResolver,
        rooms: Arc<RoomRegistry>,
        options: &StoreOptions,
        timing: PhaseTiming,
    ) -> Self {
        let devices: BTreeMap<String, Arc<DeviceState>> = roster
            .iter()
            .map(|spec| (spec.id.clone(), Arc::new(DeviceState::new(spec))))
            .collect();
        let robots = devices
            .keys()
            .map(|id| (id.clone(), BTreeMap::new()))
            .collect();
        info!(devices = devices.len(), rooms = rooms.len(), "telemetry store created");
        Self {
            devices,
            robots,
            robot_owner: HashMap::new(),
            signals: HashMap::new(),
            alerts: AlertLog::new(options.alert_capacity, options.alert_dedup_secs),
            resolver,
            rooms,
            liveness: Liveness::new(options.liveness_ms),
            timing,
            robot_ttl: options
                .robot_ttl_secs
                .map(|secs| millis(secs.saturating_mul(1_000))),
            raw_count: 0,
            recent_raw: VecDeque::with_capacity(RAW_HISTORY),
        }
    }

    /// A store with default thresholds, the default facility and default
    /// options.
    pub fn with_defaults(roster: &[DeviceSpec]) -> Self {
        Self::new(
            roster,
            ThresholdResolver::new(ThresholdSet::default()),
            Arc::new(RoomRegistry::default_facility()),
            &StoreOptions::default(),
            PhaseTiming::default(),
        )
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn device(&self, device_id: &str) -> Option<Arc<DeviceState>> {
        self.devices.get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<DeviceState>> {
        self.devices.values().cloned().collect()
    }

    pub fn has_device(&self, device_id: &str) -> bool {
        self.devices.contains_key(device_id)
    }

    /// Robots under `device_id`, ordered by id.
    pub fn robots(&self, device_id: &str) -> Vec<Arc<RobotState>> {
        self.robots
            .get(device_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn robot(&self, device_id: &str, robot_id: &str) -> Option<Arc<RobotState>> {
        self.robots.get(device_id)?.get(robot_id).cloned()
    }

    /// The device a robot currently reports under.
    pub fn owner_of(&self, robot_id: &str) -> Option<&str> {
        self.robot_owner.get(robot_id).map(String::as_str)
    }

    /// Most recent first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.list()
    }

    pub fn clear_alert(&mut self, id: Uuid) -> bool {
        self.alerts.clear(id)
    }

    pub fn clear_alerts(&mut self) {
        self.alerts.clear_all();
    }

    /// Append an alert raised outside event processing. Subject to the same
    /// deduplication as threshold alerts.
    pub fn post_alert(
        &mut self,
        severity: AlertLevel,
        device_id: &str,
        robot_id: Option<&str>,
        message: impl Into<String>,
        value: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<Alert> {
        self.alerts.push(Alert {
            id: Uuid::new_v4(),
            severity,
            device_id: device_id.to_string(),
            robot_id: robot_id.map(str::to_string),
            message: message.into(),
            value,
            timestamp: now,
        })
    }

    pub fn is_device_live(&self, device_id: &str, now: DateTime<Utc>) -> bool {
        self.devices
            .get(device_id)
            .is_some_and(|d| self.liveness.is_live(d.last_update, now))
    }

    pub fn is_robot_live(&self, device_id: &str, robot_id: &str, now: DateTime<Utc>) -> bool {
        self.robot(device_id, robot_id)
            .is_some_and(|r| self.liveness.is_live(r.last_update, now))
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn resolver(&self) -> &ThresholdResolver {
        &self.resolver
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Number of events that could not be interpreted.
    pub fn raw_event_count(&self) -> u64 {
        self.raw_count
    }

    /// The most recent uninterpretable events, newest first.
    pub fn recent_raw(&self) -> Vec<Arc<TelemetryEvent>> {
        self.recent_raw.iter().cloned().collect()
    }

    /// Swap thresholds and re-derive every record's severity. No alerts are
    /// raised for the re-derivation itself.
    pub fn set_resolver(&mut self, resolver: ThresholdResolver) {
        self.resolver = resolver;
        let device_ids: Vec<String> = self.devices.keys().cloned().collect();
        for device_id in &device_ids {
            self.refresh_device_severity(device_id);
            let robot_ids: Vec<String> = self
                .robots
                .get(device_id)
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            for robot_id in &robot_ids {
                self.refresh_robot_severity(device_id, robot_id);
            }
        }
        info!("thresholds updated");
    }

    // ── Apply ─────────────────────────────────────────────────────────────────

    /// Merge one normalized event.
    ///
    /// Returns [`FleetError::UnknownDevice`] for devices outside the roster
    /// and [`FleetError::Parse`] for a robot-scoped payload without a robot.
    /// Raw events are counted and kept, never rejected.
    pub fn apply(&mut self, event: &TelemetryEvent) -> Result<ApplyOutcome, FleetError> {
        let mut out = ApplyOutcome::default();
        if let EventPayload::Raw { reason, .. } = &event.payload {
            self.record_raw(event, reason);
            return Ok(out);
        }

        let device_id = event.target.device_id.as_str();
        if !self.devices.contains_key(device_id) {
            return Err(FleetError::UnknownDevice(device_id.to_string()));
        }
        let now = event.received_at;

        match &event.payload {
            EventPayload::Environment(update) => {
                self.apply_environment(device_id, update, now, &mut out)
            }
            EventPayload::Ac { power } => self.with_device(device_id, now, |d| {
                d.controls.ac = Some(*power);
            }),
            EventPayload::AirPurifier { power } => self.with_device(device_id, now, |d| {
                d.controls.air_purifier = Some(*power);
            }),
            EventPayload::Status(update) => self.apply_status(device_id, update, now, &mut out),
            EventPayload::RobotDiscovery { robot_ids } => {
                self.with_device(device_id, now, |_| {});
                for robot_id in robot_ids {
                    self.ensure_robot(device_id, robot_id, now, &mut out);
                }
            }
            payload => {
                let Some(robot_id) = event.target.robot_id.as_deref() else {
                    return Err(FleetError::Parse(format!(
                        "{} event on {} carries no robot id",
                        payload.kind(),
                        event.source_topic
                    )));
                };
                self.ensure_robot(device_id, robot_id, now, &mut out);
                self.apply_robot(device_id, robot_id, payload, now, &mut out);
            }
        }
        Ok(out)
    }

    fn record_raw(&mut self, event: &TelemetryEvent, reason: &str) {
        self.raw_count += 1;
        debug!(
            topic = %event.source_topic,
            reason,
            total = self.raw_count,
            "raw event recorded"
        );
        self.recent_raw.push_front(Arc::new(event.clone()));
        self.recent_raw.truncate(RAW_HISTORY);
    }

    fn with_device(&mut self, device_id: &str, now: DateTime<Utc>, f: impl FnOnce(&mut DeviceState)) {
        if let Some(entry) = self.devices.get_mut(device_id) {
            let device = Arc::make_mut(entry);
            f(device);
            device.last_update = Some(now);
        }
    }

    fn with_robot(
        &mut self,
        device_id: &str,
        robot_id: &str,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut RobotState),
    ) {
        if let Some(entry) = self
            .robots
            .get_mut(device_id)
            .and_then(|m| m.get_mut(robot_id))
        {
            let robot = Arc::make_mut(entry);
            f(robot);
            robot.last_update = Some(now);
        }
    }

    fn apply_environment(
        &mut self,
        device_id: &str,
        update: &EnvironmentUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        self.with_device(device_id, now, |d| {
            let env = &mut d.environment;
            env.temperature = update.temperature.or(env.temperature);
            env.humidity = update.humidity.or(env.humidity);
            env.pressure = update.pressure.or(env.pressure);
        });
        let readings = [
            (Metric::Temperature, update.temperature),
            (Metric::Humidity, update.humidity),
            (Metric::Pressure, update.pressure),
        ];
        for (metric, value) in readings {
            if value.is_some() {
                let severity = self.resolver.classify(metric, value);
                self.observe(device_id, None, Signal::Metric(metric), severity, value, None, now, out);
            }
        }
        self.refresh_device_severity(device_id);
    }

    fn apply_status(
        &mut self,
        device_id: &str,
        update: &StatusUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        self.with_device(device_id, now, |d| {
            let c = &mut d.controls;
            if update.status.is_some() {
                c.status.clone_from(&update.status);
            }
            if update.gateway_health.is_some() {
                c.gateway_health.clone_from(&update.gateway_health);
            }
            if update.active_alert.is_some() {
                c.active_alert.clone_from(&update.active_alert);
            }
            c.signal = update.signal.or(c.signal);
            c.emergency_stop = update.emergency_stop.or(c.emergency_stop);
        });

        if update.active_alert.is_some() {
            let text = active_alert_text(update.active_alert.as_deref());
            let severity = if text.is_some() {
                Severity::Critical
            } else {
                Severity::Normal
            };
            self.observe(device_id, None, Signal::ActiveAlert, severity, None, text, now, out);
        }
        if let Some(engaged) = update.emergency_stop {
            let severity = if engaged {
                Severity::Critical
            } else {
                Severity::Normal
            };
            self.observe(device_id, None, Signal::EmergencyStop, severity, None, None, now, out);
        }
        self.refresh_device_severity(device_id);
    }

    /// Make sure `robot_id` exists under `device_id`, creating or moving the
    /// record as needed. Existing fields are never reset.
    fn ensure_robot(
        &mut self,
        device_id: &str,
        robot_id: &str,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        let previous_owner = self.robot_owner.get(robot_id).cloned();
        let record = match previous_owner.as_deref() {
            Some(owner) if owner == device_id => return,
            Some(owner) => {
                let moved = self.robots.get_mut(owner).and_then(|m| m.remove(robot_id));
                info!(robot_id, from = owner, to = device_id, "robot moved to another device");
                let mut record =
                    moved.unwrap_or_else(|| Arc::new(RobotState::new(robot_id, device_id, now)));
                Arc::make_mut(&mut record).device_id = device_id.to_string();
                record
            }
            None => {
                info!(robot_id, device_id, "robot discovered");
                Arc::new(RobotState::new(robot_id, device_id, now))
            }
        };
        self.robots
            .entry(device_id.to_string())
            .or_default()
            .insert(robot_id.to_string(), record);
        self.robot_owner
            .insert(robot_id.to_string(), device_id.to_string());
        if let Some(owner) = previous_owner {
            self.refresh_task_summary(&owner);
        }
        self.refresh_task_summary(device_id);
        out.discovered.push(RobotRef::new(device_id, robot_id));
    }

    fn apply_robot(
        &mut self,
        device_id: &str,
        robot_id: &str,
        payload: &EventPayload,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        match payload {
            EventPayload::RobotLocation(update) => {
                self.apply_location(device_id, robot_id, update, now, out)
            }
            EventPayload::RobotTemperature(update) => {
                self.apply_robot_environment(device_id, robot_id, update, now, out)
            }
            EventPayload::RobotStatus(update) => {
                self.apply_robot_status(device_id, robot_id, update, now, out)
            }
            EventPayload::RobotBattery { battery } => {
                let update = RobotStatusUpdate {
                    battery: Some(*battery),
                    ..RobotStatusUpdate::default()
                };
                self.apply_robot_status(device_id, robot_id, &update, now, out)
            }
            EventPayload::RobotTask(update) => {
                self.apply_task(device_id, robot_id, update, now, out)
            }
            other => debug!(kind = other.kind(), robot_id, "device payload on robot target ignored"),
        }
    }

    fn apply_location(
        &mut self,
        device_id: &str,
        robot_id: &str,
        update: &LocationUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        if !update.point.is_valid() {
            warn!(robot_id, lat = update.point.lat, lng = update.point.lng, "invalid position ignored");
            return;
        }
        let rooms = Arc::clone(&self.rooms);
        let timing = self.timing;
        let mut change = None;
        self.with_robot(device_id, robot_id, now, |r| {
            r.location = Some(update.point);
            r.elevation = update.elevation.or(r.elevation);
            r.heading = update.heading.or(r.heading);
            if let Some(task) = r.task.as_mut() {
                if let Some(phase) = reconcile_task(task, r.location, &rooms, now, &timing) {
                    change = Some((task.id.clone(), phase));
                }
            }
        });
        if let Some((task_id, phase)) = change {
            self.record_phase_change(device_id, robot_id, task_id, phase, out);
        }
    }

    fn apply_robot_environment(
        &mut self,
        device_id: &str,
        robot_id: &str,
        update: &RobotEnvironmentUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        self.with_robot(device_id, robot_id, now, |r| {
            r.environment.temperature = update.temperature.or(r.environment.temperature);
            r.environment.humidity = update.humidity.or(r.environment.humidity);
        });
        if update.temperature.is_some() {
            let severity = self.resolver.robot_temp_status(update.temperature);
            self.observe(
                device_id,
                Some(robot_id),
                Signal::Metric(Metric::RobotTemp),
                severity,
                update.temperature,
                None,
                now,
                out,
            );
        }
        self.refresh_robot_severity(device_id, robot_id);
    }

    fn apply_robot_status(
        &mut self,
        device_id: &str,
        robot_id: &str,
        update: &RobotStatusUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        self.with_robot(device_id, robot_id, now, |r| {
            r.status.battery = update.battery.or(r.status.battery);
            r.status.load = update.load.or(r.status.load);
            if update.state.is_some() {
                r.status.state.clone_from(&update.state);
            }
        });
        if update.battery.is_some() {
            let severity = self.resolver.robot_battery_status(robot_id, update.battery);
            self.observe(
                device_id,
                Some(robot_id),
                Signal::Metric(Metric::Battery),
                severity,
                update.battery,
                None,
                now,
                out,
            );
        }
        if let Some(state) = update.state.as_deref() {
            let severity = if is_fault_state(Some(state)) {
                Severity::Critical
            } else {
                Severity::Normal
            };
            self.observe(
                device_id,
                Some(robot_id),
                Signal::RobotFault,
                severity,
                None,
                Some(state),
                now,
                out,
            );
        }
        self.refresh_robot_severity(device_id, robot_id);
    }

    fn apply_task(
        &mut self,
        device_id: &str,
        robot_id: &str,
        update: &TaskUpdate,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        let rooms = Arc::clone(&self.rooms);
        let mut change = None;
        self.with_robot(device_id, robot_id, now, |r| {
            let position = r.location;
            let replace = match (&r.task, &update.task_id) {
                (None, _) => true,
                (Some(current), Some(id)) => current.id != *id,
                // Without an id, an update after a finished task starts the next one.
                (Some(current), None) => current.phase.is_terminal(),
            };
            if replace {
                let id = update.task_id.clone().unwrap_or_else(generate_task_id);
                let task_type = update
                    .task_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string());
                info!(robot_id, task_id = %id, task_type = %task_type, "task assigned");
                let mut task = Task::new(
                    id,
                    task_type,
                    update.source.clone().unwrap_or_default(),
                    update.destination.clone().unwrap_or_default(),
                    now,
                );
                task.leg_origin = position;
                r.task = Some(task);
            }
            let Some(task) = r.task.as_mut() else { return };
            if task.phase.is_terminal() {
                debug!(robot_id, task_id = %task.id, phase = %task.phase, "update for finished task ignored");
                return;
            }

            if let Some(task_type) = &update.task_type {
                task.task_type.clone_from(task_type);
            }
            if let Some(source) = &update.source {
                task.source.clone_from(source);
            }
            if let Some(destination) = &update.destination {
                task.destination.clone_from(destination);
            }
            task.source_gps = update.source_gps.or(task.source_gps);
            task.destination_gps = update.destination_gps.or(task.destination_gps);
            task.updated_at = now;

            if let Some(phase) = update.phase {
                if enter_phase(task, phase, now, position) {
                    change = Some((task.id.clone(), phase));
                }
            }
            if !task.phase.is_terminal() {
                track_geofence(task, position, &rooms, now);
            }
            refresh_progress(task, position, &rooms);
        });
        if let Some((task_id, phase)) = change {
            self.record_phase_change(device_id, robot_id, task_id, phase, out);
        }
        self.refresh_task_summary(device_id);
    }

    fn record_phase_change(
        &mut self,
        device_id: &str,
        robot_id: &str,
        task_id: String,
        phase: TaskPhase,
        out: &mut ApplyOutcome,
    ) {
        info!(device_id, robot_id, task_id = %task_id, phase = %phase, "task phase changed");
        self.refresh_task_summary(device_id);
        out.phase_changes.push(PhaseChange {
            robot: RobotRef::new(device_id, robot_id),
            task_id,
            phase,
        });
    }

    /// Record the latest severity of one signal and raise an alert if it
    /// moved into warning or critical.
    #[allow(clippy::too_many_arguments)]
    fn observe(
        &mut self,
        device_id: &str,
        robot_id: Option<&str>,
        signal: Signal,
        severity: Severity,
        value: Option<f64>,
        detail: Option<&str>,
        now: DateTime<Utc>,
        out: &mut ApplyOutcome,
    ) {
        let scope = match robot_id {
            Some(robot_id) => Scope::Robot(robot_id.to_string()),
            None => Scope::Device(device_id.to_string()),
        };
        let previous = self
            .signals
            .insert((scope, signal), severity)
            .unwrap_or(Severity::Normal);
        if previous == severity {
            return;
        }
        let Some(level) = AlertLevel::from_severity(severity) else {
            debug!(device_id, robot_id, signal = ?signal, "signal back to normal");
            return;
        };
        let message = alert_message(signal, severity, device_id, robot_id, detail);
        if let Some(alert) = self.post_alert(level, device_id, robot_id, message, value, now) {
            warn!(
                device_id,
                robot_id,
                severity = %severity,
                message = %alert.message,
                "alert raised"
            );
            out.alerts.push(alert);
        }
    }

    // ── Derived fields ────────────────────────────────────────────────────────

    fn refresh_device_severity(&mut self, device_id: &str) {
        let Some(entry) = self.devices.get_mut(device_id) else {
            return;
        };
        let env = &entry.environment;
        let controls = &entry.controls;
        let fault = if active_alert_text(controls.active_alert.as_deref()).is_some()
            || controls.emergency_stop == Some(true)
        {
            Severity::Critical
        } else {
            Severity::Normal
        };
        let severity = [
            self.resolver.temperature_status(env.temperature),
            self.resolver.humidity_status(env.humidity),
            self.resolver.pressure_status(env.pressure),
            fault,
        ]
        .into_iter()
        .max()
        .unwrap_or_default();
        if entry.severity != severity {
            Arc::make_mut(entry).severity = severity;
        }
    }

    fn refresh_robot_severity(&mut self, device_id: &str, robot_id: &str) {
        let Some(entry) = self
            .robots
            .get_mut(device_id)
            .and_then(|m| m.get_mut(robot_id))
        else {
            return;
        };
        let fault = if is_fault_state(entry.status.state.as_deref()) {
            Severity::Critical
        } else {
            Severity::Normal
        };
        let severity = [
            self.resolver.robot_temp_status(entry.environment.temperature),
            self.resolver.robot_battery_status(robot_id, entry.status.battery),
            fault,
        ]
        .into_iter()
        .max()
        .unwrap_or_default();
        if entry.severity != severity {
            Arc::make_mut(entry).severity = severity;
        }
    }

    fn refresh_task_summary(&mut self, device_id: &str) {
        let mut summary = TaskSummary::default();
        if let Some(robots) = self.robots.get(device_id) {
            for task in robots.values().filter_map(|r| r.task.as_ref()) {
                match task.phase {
                    TaskPhase::Completed => summary.completed += 1,
                    TaskPhase::Failed => summary.failed += 1,
                    _ => summary.active += 1,
                }
            }
        }
        if let Some(entry) = self.devices.get_mut(device_id) {
            if entry.task_summary != summary {
                Arc::make_mut(entry).task_summary = summary;
            }
        }
    }

    // ── Time-driven maintenance ───────────────────────────────────────────────

    /// Run the elapsed-time phase fallback for every active task.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<PhaseChange> {
        let rooms = Arc::clone(&self.rooms);
        let timing = self.timing;
        let mut changes = Vec::new();
        for (device_id, robots) in self.robots.iter_mut() {
            for (robot_id, record) in robots.iter_mut() {
                let Some(current) = record.task.as_ref() else {
                    continue;
                };
                if current.phase.is_terminal() {
                    continue;
                }
                let mut task = current.clone();
                let next = reconcile_task(&mut task, record.location, &rooms, now, &timing);
                if record.task.as_ref() != Some(&task) {
                    if let Some(phase) = next {
                        changes.push(PhaseChange {
                            robot: RobotRef::new(device_id.as_str(), robot_id.as_str()),
                            task_id: task.id.clone(),
                            phase,
                        });
                    }
                    Arc::make_mut(record).task = Some(task);
                }
            }
        }
        for change in &changes {
            info!(
                device_id = %change.robot.device_id,
                robot_id = %change.robot.robot_id,
                task_id = %change.task_id,
                phase = %change.phase,
                "task phase advanced by fallback"
            );
        }
        let mut touched: Vec<String> = changes.iter().map(|c| c.robot.device_id.clone()).collect();
        touched.sort();
        touched.dedup();
        for device_id in touched {
            self.refresh_task_summary(&device_id);
        }
        changes
    }

    /// Drop robots silent for longer than the configured TTL. Does nothing
    /// when no TTL is configured.
    pub fn evict_stale_robots(&mut self, now: DateTime<Utc>) -> Vec<RobotRef> {
        let Some(ttl) = self.robot_ttl else {
            return Vec::new();
        };
        let liveness = self.liveness;
        let mut evicted = Vec::new();
        for (device_id, robots) in self.robots.iter_mut() {
            robots.retain(|robot_id, record| {
                let last_seen = record.last_update.unwrap_or(record.first_seen);
                let stale = liveness.is_stale(last_seen, now, ttl);
                if stale {
                    evicted.push(RobotRef::new(device_id.as_str(), robot_id.as_str()));
                }
                !stale
            });
        }
        for robot in &evicted {
            info!(device_id = %robot.device_id, robot_id = %robot.robot_id, "stale robot evicted");
            self.robot_owner.remove(&robot.robot_id);
            self.signals
                .retain(|(scope, _), _| !matches!(scope, Scope::Robot(id) if *id == robot.robot_id));
        }
        let mut touched: Vec<String> = evicted.iter().map(|r| r.device_id.clone()).collect();
        touched.sort();
        touched.dedup();
        for device_id in touched {
            self.refresh_task_summary(&device_id);
        }
        evicted
    }

    // ── Warm start ────────────────────────────────────────────────────────────

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        let device = self.devices.get(device_id)?;
        Some(DeviceSnapshot {
            device: DeviceState::clone(device),
            robots: self
                .robots(device_id)
                .iter()
                .map(|r| RobotState::clone(r))
                .collect(),
            taken_at: Utc::now(),
        })
    }

    /// Fill records from a persisted snapshot. Only records that have not
    /// received live data are touched; robots owned by another device are
    /// left where they are.
    pub fn hydrate(&mut self, snapshot: &DeviceSnapshot) -> Result<HydrateOutcome, FleetError> {
        let device_id = snapshot.device.id.clone();
        let Some(entry) = self.devices.get_mut(&device_id) else {
            return Err(FleetError::UnknownDevice(device_id));
        };
        let mut outcome = HydrateOutcome::default();

        if entry.last_update.is_none() {
            let device = Arc::make_mut(entry);
            device.environment = snapshot.device.environment.clone();
            device.controls = snapshot.device.controls.clone();
            device.last_update = snapshot.device.last_update;
            outcome.device_filled = true;
        }

        for saved in &snapshot.robots {
            let owner = self.robot_owner.get(&saved.id).cloned();
            match owner.as_deref() {
                Some(owner) if owner != device_id => continue,
                Some(_) => {
                    let Some(entry) = self
                        .robots
                        .get_mut(&device_id)
                        .and_then(|m| m.get_mut(&saved.id))
                    else {
                        continue;
                    };
                    if entry.last_update.is_some() {
                        continue;
                    }
                    let first_seen = entry.first_seen;
                    let robot = Arc::make_mut(entry);
                    *robot = saved.clone();
                    robot.device_id.clone_from(&device_id);
                    robot.first_seen = first_seen;
                }
                None => {
                    let mut robot = saved.clone();
                    robot.device_id.clone_from(&device_id);
                    self.robots
                        .entry(device_id.clone())
                        .or_default()
                        .insert(saved.id.clone(), Arc::new(robot));
                    self.robot_owner.insert(saved.id.clone(), device_id.clone());
                    outcome
                        .discovered
                        .push(RobotRef::new(device_id.as_str(), saved.id.as_str()));
                }
            }
            outcome.robots_filled.push(saved.id.clone());
            self.refresh_robot_severity(&device_id, &saved.id);
        }

        self.refresh_device_severity(&device_id);
        self.refresh_task_summary(&device_id);
        info!(
            device_id = %device_id,
            device_filled = outcome.device_filled,
            robots_filled = outcome.robots_filled.len(),
            "snapshot hydrated"
        );
        Ok(outcome)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
