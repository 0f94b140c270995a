//! Outbound operator commands.
//!
//! Each command is published as JSON to `state/{device}/{command_type}`.
//! Payload keys follow what field gateways consume, which is why task
//! assignments mix `camelCase`, `snake_case` and a key with a space in it.

use fleetsync_types::{GpsPoint, TaskPhase};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::topics::command_destination;

/// A fully resolved task assignment, ready to publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub robot_id: String,
    pub task_type: String,
    pub task_id: String,
    pub source: String,
    pub destination: String,
    pub source_gps: GpsPoint,
    pub destination_gps: GpsPoint,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    EmergencyStop { engaged: bool },
    Ac { power: bool },
    AirPurifier { power: bool },
    AssignTask(TaskAssignment),
}

impl Command {
    /// Last topic segment for this command.
    pub fn command_type(&self) -> &'static str {
        match self {
            Command::EmergencyStop { .. } => "emergencyStop",
            Command::Ac { .. } => "ac",
            Command::AirPurifier { .. } => "air_purifier",
            Command::AssignTask(_) => "task",
        }
    }

    pub fn destination(&self, device_id: &str) -> String {
        command_destination(device_id, self.command_type())
    }

    pub fn payload(&self) -> Value {
        match self {
            Command::EmergencyStop { engaged } => json!({ "emergency_stop": engaged }),
            Command::Ac { power } => json!({ "ac_power": power }),
            Command::AirPurifier { power } => json!({ "air_purifier": power }),
            Command::AssignTask(task) => json!({
                "robotId": task.robot_id,
                "task_type": task.task_type,
                "task_id": task.task_id,
                "status": TaskPhase::Assigned.as_str(),
                "initiate location": task.source,
                "destination": task.destination,
                "source_lat": task.source_gps.lat,
                "source_lng": task.source_gps.lng,
                "destination_lat": task.destination_gps.lat,
                "destination_lng": task.destination_gps.lng,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::Utc;
    use fleetsync_types::EventPayload;

    fn assignment() -> TaskAssignment {
        TaskAssignment {
            robot_id: "R1".into(),
            task_type: "Deliver".into(),
            task_id: "TASK-1-0001".into(),
            source: "Cleanroom A".into(),
            destination: "Storage".into(),
            source_gps: GpsPoint::new(37.42185, -122.0845),
            destination_gps: GpsPoint::new(37.42172, -122.08400),
        }
    }

    #[test]
    fn simple_commands() {
        let cmd = Command::EmergencyStop { engaged: true };
        assert_eq!(cmd.destination("dev-1"), "state/dev-1/emergencyStop");
        assert_eq!(cmd.payload(), json!({ "emergency_stop": true }));

        let cmd = Command::Ac { power: false };
        assert_eq!(cmd.destination("dev-1"), "state/dev-1/ac");
        assert_eq!(cmd.payload(), json!({ "ac_power": false }));

        let cmd = Command::AirPurifier { power: true };
        assert_eq!(cmd.destination("dev-1"), "state/dev-1/air_purifier");
        assert_eq!(cmd.payload(), json!({ "air_purifier": true }));
    }

    #[test]
    fn task_payload_shape() {
        let cmd = Command::AssignTask(assignment());
        assert_eq!(cmd.destination("dev-1"), "state/dev-1/task");
        let payload = cmd.payload();
        assert_eq!(payload["robotId"], "R1");
        assert_eq!(payload["status"], "ASSIGNED");
        assert_eq!(payload["initiate location"], "Cleanroom A");
        assert_eq!(payload["destination_lng"], -122.084);
    }

    #[test]
    fn task_payload_normalizes_back() {
        let payload = Command::AssignTask(assignment()).payload().to_string();
        let events = normalize("state/dev-1/robots/R1/tasks", &payload, Utc::now());
        let EventPayload::RobotTask(task) = &events[0].payload else {
            panic!("expected task event");
        };
        assert_eq!(task.task_id.as_deref(), Some("TASK-1-0001"));
        assert_eq!(task.phase, Some(TaskPhase::Assigned));
        assert_eq!(task.source.as_deref(), Some("Cleanroom A"));
        assert_eq!(task.destination_gps, Some(GpsPoint::new(37.42172, -122.084)));
    }
}
