//! Payload normalization.
//!
//! Producers disagree on key names, nesting and even on whether numbers are
//! strings. This module is the only place that knows about that; everything
//! downstream sees [`TelemetryEvent`]s.
//!
//! # Key precedence
//!
//! For each field the first key present wins. Dotted keys are nested paths.
//!
//! | Field            | Keys, highest precedence first                                  |
//! |------------------|-----------------------------------------------------------------|
//! | device id        | `device_id`, `deviceId`, topic                                  |
//! | robot id         | `robot_id`, `robotId`, topic                                    |
//! | produced at      | `timestamp`, `ts`, `time` (RFC 3339, epoch s or epoch ms)        |
//! | temperature      | `temperature`, `temp`, `environment.temperature`                |
//! | humidity         | `humidity`, `hum`, `environment.humidity`                       |
//! | pressure         | `pressure`, `environment.pressure`                              |
//! | robot ids        | `robots`, `robot_ids`, `robotIds` (strings or `{id}` objects)   |
//! | ac               | `ac`, `ac_power`, `acPower`, `ac_state`                         |
//! | air purifier     | `air_purifier`, `airPurifier`, `air_purifier_power`, `purifier` |
//! | status           | `status`, `state`                                               |
//! | gateway health   | `gateway_health`, `gatewayHealth`, `gateway`                    |
//! | active alert     | `active_alert`, `activeAlert`, `alert`                          |
//! | signal           | `signal`, `signal_strength`, `rssi`                             |
//! | emergency stop   | `emergency_stop`, `emergencyStop`, `estop`                      |
//! | latitude         | `lat`, `latitude`, `location.lat`, `position.lat`               |
//! | longitude        | `lng`, `lon`, `longitude`, `location.lng`, `position.lng`       |
//! | elevation        | `z`, `elevation`, `altitude`, `location.z`                      |
//! | heading          | `heading`, `yaw`, `bearing`                                     |
//! | battery          | `battery`, `battery_level`, `batteryLevel`, `level`, `value`    |
//! | load             | `load`, `payload`, `payload_kg`                                 |
//! | robot state      | `state`, `status`, `mode`                                       |
//! | task id          | `task_id`, `taskId`, `id`                                       |
//! | task type        | `task_type`, `taskType`, `type`                                 |
//! | task phase       | `phase`, `status`, `state`                                      |
//! | task source      | `source`, `initiate location`, `from`, `pickup`                 |
//! | task destination | `destination`, `to`, `dropoff`                                  |
//!
//! Booleans accept `true`/`false`, `"on"`/`"off"`, `"true"`/`"false"` and
//! `1`/`0`. Numbers accept JSON numbers and numeric strings.
//!
//! A JSON array payload is normalized element by element. A task payload
//! may be wrapped in a `task` object.
//!
//! # Failures
//!
//! A payload that is not JSON, arrives on an unknown topic, or carries no
//! recognised field becomes a single [`EventPayload::Raw`] event holding the
//! original text and the reason. Nothing is dropped and nothing is raised.

use chrono::{DateTime, TimeZone, Utc};
use fleetsync_types::{
    EnvironmentUpdate, EventPayload, EventTarget, GpsPoint, LocationUpdate,
    RobotEnvironmentUpdate, RobotStatusUpdate, StatusUpdate, TaskPhase, TaskUpdate,
    TelemetryEvent,
};
use serde_json::Value;
use tracing::warn;

use crate::topics::{RobotChannel, TopicRoute};

// ────────────────────────────────────────────────────────────────────────────
// Field access
// ────────────────────────────────────────────────────────────────────────────

fn at<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(direct) = v.get(path) {
        return Some(direct);
    }
    let mut cur = v;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

fn pick<'a>(v: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| at(v, k))
        .find(|found| !found.is_null())
}

fn as_f64(v: &Value) -> Option<f64> {
    let n = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    n.filter(|n| n.is_finite())
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Some(true),
            "false" | "off" | "0" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn pick_f64(v: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| at(v, k)).find_map(as_f64)
}

fn pick_bool(v: &Value, keys: &[&str]) -> Option<bool> {
    keys.iter().filter_map(|k| at(v, k)).find_map(as_bool)
}

fn pick_string(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().filter_map(|k| at(v, k)).find_map(as_string)
}

/// Timestamps as RFC 3339 strings or epoch numbers. Numbers above 10¹² are
/// milliseconds, anything smaller is seconds.
fn as_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    if let Value::String(s) = v {
        if let Ok(t) = DateTime::parse_from_rfc3339(s.trim()) {
            return Some(t.with_timezone(&Utc));
        }
    }
    let n = as_f64(v)?;
    if n >= 1e12 {
        Utc.timestamp_millis_opt(n as i64).single()
    } else {
        Utc.timestamp_millis_opt((n * 1_000.0) as i64).single()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Normalization
// ────────────────────────────────────────────────────────────────────────────

/// Turn one raw message into zero or more events. Never fails; see the
/// module docs for what happens to unusable input.
pub fn normalize(topic: &str, payload: &str, received_at: DateTime<Utc>) -> Vec<TelemetryEvent> {
    let route = TopicRoute::parse(topic);

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            return vec![raw_event(
                topic,
                route.as_ref(),
                None,
                payload,
                format!("invalid JSON: {e}"),
                received_at,
            )];
        }
    };

    let Some(route) = route else {
        return vec![raw_event(
            topic,
            None,
            Some(&value),
            payload,
            "unrecognised topic".to_string(),
            received_at,
        )];
    };

    let elements: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut events = Vec::new();
    for element in elements {
        let target = target_for(&route, element);
        let produced_at = pick(element, &["timestamp", "ts", "time"]).and_then(as_timestamp);
        for kind in payloads_for(&route, element) {
            events.push(
                TelemetryEvent::new(topic, target.clone(), received_at, kind)
                    .with_produced_at(produced_at),
            );
        }
    }

    if events.is_empty() {
        return vec![raw_event(
            topic,
            Some(&route),
            Some(&value),
            payload,
            "no recognised fields".to_string(),
            received_at,
        )];
    }
    events
}

fn target_for(route: &TopicRoute, v: &Value) -> EventTarget {
    let device_id = pick_string(v, &["device_id", "deviceId"])
        .unwrap_or_else(|| route.device_id().to_string());
    let robot_id = match route.robot_id() {
        Some(topic_robot) => {
            Some(pick_string(v, &["robot_id", "robotId"]).unwrap_or_else(|| topic_robot.to_string()))
        }
        None => None,
    };
    EventTarget {
        device_id,
        robot_id,
    }
}

fn raw_event(
    topic: &str,
    route: Option<&TopicRoute>,
    value: Option<&Value>,
    payload: &str,
    reason: String,
    received_at: DateTime<Utc>,
) -> TelemetryEvent {
    warn!(topic, reason = %reason, "unparsable message kept as raw");
    let device_id = value
        .and_then(|v| pick_string(v, &["device_id", "deviceId"]))
        .or_else(|| route.map(|r| r.device_id().to_string()))
        .unwrap_or_default();
    let robot_id = route.and_then(|r| r.robot_id()).map(str::to_string);
    TelemetryEvent::new(
        topic,
        EventTarget {
            device_id,
            robot_id,
        },
        received_at,
        EventPayload::Raw {
            payload: payload.to_string(),
            reason,
        },
    )
}

fn payloads_for(route: &TopicRoute, v: &Value) -> Vec<EventPayload> {
    match route {
        TopicRoute::DeviceStream { .. } => {
            let mut out = Vec::new();
            let env = environment(v);
            if !env.is_empty() {
                out.push(EventPayload::Environment(env));
            }
            out.extend(device_state(v));
            out.extend(discovery(v));
            out
        }
        TopicRoute::DeviceState { .. } | TopicRoute::DeviceCommand { .. } => {
            let mut out = device_state(v);
            out.extend(discovery(v));
            out
        }
        TopicRoute::RobotStream { channel, .. } => match channel {
            RobotChannel::Location => location(v).into_iter().collect(),
            RobotChannel::Temperature => {
                let update = RobotEnvironmentUpdate {
                    temperature: pick_f64(v, &["temperature", "temp", "value"]),
                    humidity: pick_f64(v, &["humidity", "hum"]),
                };
                if update.temperature.is_none() && update.humidity.is_none() {
                    Vec::new()
                } else {
                    vec![EventPayload::RobotTemperature(update)]
                }
            }
            RobotChannel::Status => robot_status(v).into_iter().collect(),
            RobotChannel::Battery => pick_f64(
                v,
                &["battery", "battery_level", "batteryLevel", "level", "value"],
            )
            .map(|battery| EventPayload::RobotBattery { battery })
            .into_iter()
            .collect(),
            RobotChannel::Tasks => task(v).into_iter().collect(),
        },
        TopicRoute::RobotTaskState { .. } => task(v).into_iter().collect(),
    }
}

fn environment(v: &Value) -> EnvironmentUpdate {
    EnvironmentUpdate {
        temperature: pick_f64(v, &["temperature", "temp", "environment.temperature"]),
        humidity: pick_f64(v, &["humidity", "hum", "environment.humidity"]),
        pressure: pick_f64(v, &["pressure", "environment.pressure"]),
    }
}

fn device_state(v: &Value) -> Vec<EventPayload> {
    let mut out = Vec::new();
    if let Some(power) = pick_bool(v, &["ac", "ac_power", "acPower", "ac_state"]) {
        out.push(EventPayload::Ac { power });
    }
    if let Some(power) = pick_bool(
        v,
        &["air_purifier", "airPurifier", "air_purifier_power", "purifier"],
    ) {
        out.push(EventPayload::AirPurifier { power });
    }
    let status = StatusUpdate {
        status: pick_string(v, &["status", "state"]),
        gateway_health: pick_string(v, &["gateway_health", "gatewayHealth", "gateway"]),
        active_alert: pick_string(v, &["active_alert", "activeAlert", "alert"]),
        signal: pick_f64(v, &["signal", "signal_strength", "rssi"]).map(|s| s.round() as i64),
        emergency_stop: pick_bool(v, &["emergency_stop", "emergencyStop", "estop"]),
    };
    if !status.is_empty() {
        out.push(EventPayload::Status(status));
    }
    out
}

fn discovery(v: &Value) -> Option<EventPayload> {
    let list = pick(v, &["robots", "robot_ids", "robotIds"])?.as_array()?;
    let mut robot_ids: Vec<String> = Vec::new();
    for item in list {
        let id = match item {
            Value::Object(_) => pick_string(item, &["id", "robot_id", "robotId"]),
            other => as_string(other),
        };
        if let Some(id) = id {
            if !robot_ids.contains(&id) {
                robot_ids.push(id);
            }
        }
    }
    (!robot_ids.is_empty()).then_some(EventPayload::RobotDiscovery { robot_ids })
}

fn location(v: &Value) -> Option<EventPayload> {
    let lat = pick_f64(v, &["lat", "latitude", "location.lat", "position.lat"])?;
    let lng = pick_f64(
        v,
        &["lng", "lon", "longitude", "location.lng", "position.lng"],
    )?;
    Some(EventPayload::RobotLocation(LocationUpdate {
        point: GpsPoint::new(lat, lng),
        elevation: pick_f64(v, &["z", "elevation", "altitude", "location.z"]),
        heading: pick_f64(v, &["heading", "yaw", "bearing"]),
    }))
}

fn robot_status(v: &Value) -> Option<EventPayload> {
    let update = RobotStatusUpdate {
        battery: pick_f64(v, &["battery", "battery_level", "batteryLevel"]),
        load: pick_f64(v, &["load", "payload", "payload_kg"]),
        state: pick_string(v, &["state", "status", "mode"]),
    };
    if update.battery.is_none() && update.load.is_none() && update.state.is_none() {
        None
    } else {
        Some(EventPayload::RobotStatus(update))
    }
}

fn gps_pair(v: &Value, lat_keys: &[&str], lng_keys: &[&str]) -> Option<GpsPoint> {
    Some(GpsPoint::new(pick_f64(v, lat_keys)?, pick_f64(v, lng_keys)?))
}

fn task(v: &Value) -> Option<EventPayload> {
    let v = match v.get("task") {
        Some(inner) if inner.is_object() => inner,
        _ => v,
    };
    let update = TaskUpdate {
        task_id: pick_string(v, &["task_id", "taskId", "id"]),
        task_type: pick_string(v, &["task_type", "taskType", "type"]),
        phase: pick(v, &["phase", "status", "state"])
            .and_then(Value::as_str)
            .and_then(TaskPhase::parse),
        source: pick_string(v, &["source", "initiate location", "from", "pickup"]),
        destination: pick_string(v, &["destination", "to", "dropoff"]),
        source_gps: gps_pair(v, &["source_lat", "sourceLat"], &["source_lng", "sourceLng"]),
        destination_gps: gps_pair(
            v,
            &["destination_lat", "destinationLat"],
            &["destination_lng", "destinationLng"],
        ),
    };
    let empty = update.task_id.is_none()
        && update.phase.is_none()
        && update.source.is_none()
        && update.destination.is_none();
    (!empty).then_some(EventPayload::RobotTask(update))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(topic: &str, payload: &str) -> TelemetryEvent {
        let mut events = normalize(topic, payload, Utc::now());
        assert_eq!(events.len(), 1, "{events:?}");
        events.remove(0)
    }

    #[test]
    fn environment_with_key_precedence() {
        let e = one(
            "stream/dev-1",
            r#"{"temp": "24.5", "environment": {"temperature": 99, "humidity": 40}}"#,
        );
        assert_eq!(e.target, EventTarget::device("dev-1"));
        assert_eq!(
            e.payload,
            EventPayload::Environment(EnvironmentUpdate {
                temperature: Some(24.5),
                humidity: Some(40.0),
                pressure: None,
            })
        );
    }

    #[test]
    fn device_id_backfilled_from_topic_unless_present() {
        let e = one("stream/dev-1", r#"{"humidity": 50}"#);
        assert_eq!(e.target.device_id, "dev-1");
        let e = one("stream/dev-1", r#"{"deviceId": "dev-9", "humidity": 50}"#);
        assert_eq!(e.target.device_id, "dev-9");
    }

    #[test]
    fn producer_timestamp_is_informational() {
        let now = Utc::now();
        let events = normalize("stream/dev-1", r#"{"ts": 1700000000000, "temperature": 20}"#, now);
        let e = &events[0];
        assert_eq!(e.received_at, now);
        assert_eq!(e.produced_at.unwrap().timestamp(), 1_700_000_000);

        let events = normalize(
            "stream/dev-1",
            r#"{"timestamp": "2024-05-01T12:00:00Z", "temperature": 20}"#,
            now,
        );
        assert_eq!(events[0].produced_at.unwrap().timestamp(), 1_714_564_800);
    }

    #[test]
    fn device_state_fields() {
        let events = normalize(
            "state/dev-1",
            r#"{"ac_power": "on", "airPurifier": 0, "status": "online", "gatewayHealth": "ok", "rssi": -61.4, "estop": false}"#,
            Utc::now(),
        );
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload, EventPayload::Ac { power: true });
        assert_eq!(events[1].payload, EventPayload::AirPurifier { power: false });
        let EventPayload::Status(status) = &events[2].payload else {
            panic!("expected status");
        };
        assert_eq!(status.status.as_deref(), Some("online"));
        assert_eq!(status.gateway_health.as_deref(), Some("ok"));
        assert_eq!(status.signal, Some(-61));
        assert_eq!(status.emergency_stop, Some(false));
    }

    #[test]
    fn discovery_accepts_strings_and_objects() {
        let e = one(
            "stream/dev-1",
            r#"{"robots": ["R1", {"id": "R2"}, "R1", 7]}"#,
        );
        assert_eq!(
            e.payload,
            EventPayload::RobotDiscovery {
                robot_ids: vec!["R1".into(), "R2".into(), "7".into()]
            }
        );
    }

    #[test]
    fn robot_location() {
        let e = one(
            "stream/dev-1/robots/R1/location",
            r#"{"latitude": 37.4219, "lon": "-122.0845", "z": 1.5, "yaw": 90}"#,
        );
        assert_eq!(e.target, EventTarget::robot("dev-1", "R1"));
        assert_eq!(
            e.payload,
            EventPayload::RobotLocation(LocationUpdate {
                point: GpsPoint::new(37.4219, -122.0845),
                elevation: Some(1.5),
                heading: Some(90.0),
            })
        );
    }

    #[test]
    fn location_without_coordinates_is_raw() {
        let e = one("stream/dev-1/robots/R1/location", r#"{"z": 1}"#);
        assert!(matches!(e.payload, EventPayload::Raw { .. }));
        assert_eq!(e.target, EventTarget::robot("dev-1", "R1"));
    }

    #[test]
    fn robot_battery_status_and_temperature() {
        let e = one("stream/dev-1/robots/R1/battery", r#"{"level": "42"}"#);
        assert_eq!(e.payload, EventPayload::RobotBattery { battery: 42.0 });

        let e = one(
            "stream/dev-1/robots/R1/status",
            r#"{"battery": 80, "load": 3.5, "mode": "MOVING"}"#,
        );
        assert_eq!(
            e.payload,
            EventPayload::RobotStatus(RobotStatusUpdate {
                battery: Some(80.0),
                load: Some(3.5),
                state: Some("MOVING".into()),
            })
        );

        let e = one("stream/dev-1/robots/R1/temperature", r#"{"value": 41}"#);
        assert_eq!(
            e.payload,
            EventPayload::RobotTemperature(RobotEnvironmentUpdate {
                temperature: Some(41.0),
                humidity: None,
            })
        );
    }

    #[test]
    fn task_payload_with_wrapper_and_aliases() {
        let e = one(
            "state/dev-1/robots/R1/tasks",
            r#"{"task": {"taskId": "TASK-1", "type": "Deliver", "status": "picking-up",
                "initiate location": "Cleanroom A", "destination": "Storage",
                "source_lat": 37.4219, "source_lng": -122.0845}}"#,
        );
        let EventPayload::RobotTask(task) = e.payload else {
            panic!("expected task");
        };
        assert_eq!(task.task_id.as_deref(), Some("TASK-1"));
        assert_eq!(task.task_type.as_deref(), Some("Deliver"));
        assert_eq!(task.phase, Some(TaskPhase::PickingUp));
        assert_eq!(task.source.as_deref(), Some("Cleanroom A"));
        assert_eq!(task.source_gps, Some(GpsPoint::new(37.4219, -122.0845)));
        assert_eq!(task.destination_gps, None);
    }

    #[test]
    fn array_payload_is_normalized_per_element() {
        let events = normalize(
            "stream/dev-1/robots/R1/battery",
            r#"[{"battery": 50}, {"battery": 49}]"#,
            Utc::now(),
        );
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn invalid_json_becomes_raw() {
        let e = one("stream/dev-1", "{not json");
        let EventPayload::Raw { payload, reason } = &e.payload else {
            panic!("expected raw");
        };
        assert_eq!(payload, "{not json");
        assert!(reason.starts_with("invalid JSON"));
        assert_eq!(e.target.device_id, "dev-1");
    }

    #[test]
    fn unknown_topic_and_empty_payload_become_raw() {
        let e = one("telemetry/x", r#"{"deviceId": "dev-3"}"#);
        assert!(matches!(e.payload, EventPayload::Raw { .. }));
        assert_eq!(e.target.device_id, "dev-3");

        let e = one("stream/dev-1", r#"{"unrelated": true}"#);
        let EventPayload::Raw { reason, .. } = e.payload else {
            panic!("expected raw");
        };
        assert_eq!(reason, "no recognised fields");
    }
}
