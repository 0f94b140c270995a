//! Operator commands.
//!
//! [`CommandPublisher`] resolves a command to its payload and publishes it
//! once. A failed publish comes back as [`FleetError::Command`] and is never
//! retried here: emergency stops and task assignments need the operator to
//! act again.

use std::sync::Arc;

use fleetsync_middleware::{Command, TaskAssignment, Transport};
use fleetsync_spatial::{RoomRegistry, generate_task_id};
use fleetsync_types::{FieldError, FleetError, GpsPoint};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A task as the operator enters it. Coordinates are optional; missing ones
/// are taken from the named room's center.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub robot_id: String,
    pub task_type: String,
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub source_gps: Option<GpsPoint>,
    #[serde(default)]
    pub destination_gps: Option<GpsPoint>,
}

impl TaskRequest {
    pub fn new(
        robot_id: impl Into<String>,
        task_type: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            robot_id: robot_id.into(),
            task_type: task_type.into(),
            source: source.into(),
            destination: destination.into(),
            source_gps: None,
            destination_gps: None,
        }
    }
}

#[derive(Clone)]
pub struct CommandPublisher {
    transport: Arc<dyn Transport>,
    rooms: Arc<RoomRegistry>,
}

impl CommandPublisher {
    pub fn new(transport: Arc<dyn Transport>, rooms: Arc<RoomRegistry>) -> Self {
        Self { transport, rooms }
    }

    /// Publish `command` for `device_id`.
    pub async fn publish(&self, device_id: &str, command: &Command) -> Result<(), FleetError> {
        let destination = command.destination(device_id);
        let payload = command.payload().to_string();
        match self.transport.publish(&destination, &payload).await {
            Ok(()) => {
                info!(device_id, command = command.command_type(), "command published");
                Ok(())
            }
            Err(e) => {
                error!(
                    device_id,
                    command = command.command_type(),
                    error = %e,
                    "command publish failed"
                );
                Err(FleetError::Command(format!(
                    "{} for {device_id}: {e}",
                    command.command_type()
                )))
            }
        }
    }

    pub async fn emergency_stop(&self, device_id: &str, engaged: bool) -> Result<(), FleetError> {
        self.publish(device_id, &Command::EmergencyStop { engaged })
            .await
    }

    pub async fn set_ac(&self, device_id: &str, power: bool) -> Result<(), FleetError> {
        self.publish(device_id, &Command::Ac { power }).await
    }

    pub async fn set_air_purifier(&self, device_id: &str, power: bool) -> Result<(), FleetError> {
        self.publish(device_id, &Command::AirPurifier { power })
            .await
    }

    /// Resolve `request` against the room registry, give it a fresh task id
    /// and publish it. Returns what was sent.
    pub async fn assign_task(
        &self,
        device_id: &str,
        request: &TaskRequest,
    ) -> Result<TaskAssignment, FleetError> {
        let assignment = self.resolve(request)?;
        self.publish(device_id, &Command::AssignTask(assignment.clone()))
            .await?;
        Ok(assignment)
    }

    /// Validate a request and fill in room names and coordinates.
    pub fn resolve(&self, request: &TaskRequest) -> Result<TaskAssignment, FleetError> {
        let mut errors = Vec::new();
        if request.robot_id.trim().is_empty() {
            errors.push(FieldError::new("robot_id", "robot is required"));
        }
        let source = self.endpoint("source", &request.source, request.source_gps, &mut errors);
        let destination = self.endpoint(
            "destination",
            &request.destination,
            request.destination_gps,
            &mut errors,
        );
        if let (Some((src, _)), Some((dst, _))) = (&source, &destination)
            && src == dst
        {
            errors.push(FieldError::new(
                "destination",
                "destination must differ from source",
            ));
        }
        match (source, destination) {
            (Some((source, source_gps)), Some((destination, destination_gps))) if errors.is_empty() => {
                let task_type = match request.task_type.trim() {
                    "" => "Deliver".to_string(),
                    t => t.to_string(),
                };
                Ok(TaskAssignment {
                    robot_id: request.robot_id.trim().to_string(),
                    task_type,
                    task_id: generate_task_id(),
                    source,
                    destination,
                    source_gps,
                    destination_gps,
                })
            }
            _ => Err(FleetError::Validation(errors)),
        }
    }

    /// A room name and point for one end of a task. An explicit valid point
    /// wins over the room center; the name is canonicalised when it resolves.
    fn endpoint(
        &self,
        field: &str,
        name: &str,
        explicit: Option<GpsPoint>,
        errors: &mut Vec<FieldError>,
    ) -> Option<(String, GpsPoint)> {
        let room = self.rooms.resolve(name);
        let point = explicit
            .filter(GpsPoint::is_valid)
            .or_else(|| room.map(|r| r.center));
        match point {
            Some(point) => {
                let name = room.map_or_else(|| name.trim().to_string(), |r| r.name.clone());
                Some((name, point))
            }
            None => {
                let message = if name.trim().is_empty() {
                    format!("{field} is required")
                } else {
                    format!("unknown location {:?}", name.trim())
                };
                errors.push(FieldError::new(field, message));
                None
            }
        }
    }
}
