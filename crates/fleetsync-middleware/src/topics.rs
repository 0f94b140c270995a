//! Topic layout.
//!
//! | Topic                                         | Traffic                               |
//! |-----------------------------------------------|---------------------------------------|
//! | `stream/{device}`                             | environment, robot discovery          |
//! | `stream/{device}/robots/{robot}/{channel}`    | location, temperature, status, battery, tasks |
//! | `state/{device}`                              | AC, air purifier, status, gateway health |
//! | `state/{device}/robots/{robot}/tasks`         | task state                            |
//! | `state/{device}/{command}`                    | outbound operator commands            |
//!
//! A leading `/` is ignored when parsing.

use std::fmt;

/// Per-robot stream channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RobotChannel {
    Location,
    Temperature,
    Status,
    Battery,
    Tasks,
}

impl RobotChannel {
    pub const ALL: [RobotChannel; 5] = [
        RobotChannel::Location,
        RobotChannel::Temperature,
        RobotChannel::Status,
        RobotChannel::Battery,
        RobotChannel::Tasks,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RobotChannel::Location => "location",
            RobotChannel::Temperature => "temperature",
            RobotChannel::Status => "status",
            RobotChannel::Battery => "battery",
            RobotChannel::Tasks => "tasks",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == raw)
    }
}

/// A parsed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute {
    DeviceStream {
        device_id: String,
    },
    DeviceState {
        device_id: String,
    },
    RobotStream {
        device_id: String,
        robot_id: String,
        channel: RobotChannel,
    },
    RobotTaskState {
        device_id: String,
        robot_id: String,
    },
    DeviceCommand {
        device_id: String,
        command: String,
    },
}

impl TopicRoute {
    /// Parse `topic`, or `None` if it is not part of the layout.
    pub fn parse(topic: &str) -> Option<Self> {
        let parts: Vec<&str> = topic.trim_start_matches('/').split('/').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        match parts.as_slice() {
            ["stream", device] => Some(TopicRoute::DeviceStream {
                device_id: device.to_string(),
            }),
            ["state", device] => Some(TopicRoute::DeviceState {
                device_id: device.to_string(),
            }),
            ["stream", device, "robots", robot, channel] => Some(TopicRoute::RobotStream {
                device_id: device.to_string(),
                robot_id: robot.to_string(),
                channel: RobotChannel::parse(channel)?,
            }),
            ["state", device, "robots", robot, "tasks"] => Some(TopicRoute::RobotTaskState {
                device_id: device.to_string(),
                robot_id: robot.to_string(),
            }),
            ["state", device, command] => Some(TopicRoute::DeviceCommand {
                device_id: device.to_string(),
                command: command.to_string(),
            }),
            _ => None,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            TopicRoute::DeviceStream { device_id }
            | TopicRoute::DeviceState { device_id }
            | TopicRoute::RobotStream { device_id, .. }
            | TopicRoute::RobotTaskState { device_id, .. }
            | TopicRoute::DeviceCommand { device_id, .. } => device_id,
        }
    }

    pub fn robot_id(&self) -> Option<&str> {
        match self {
            TopicRoute::RobotStream { robot_id, .. } | TopicRoute::RobotTaskState { robot_id, .. } => {
                Some(robot_id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TopicRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicRoute::DeviceStream { device_id } => write!(f, "stream/{device_id}"),
            TopicRoute::DeviceState { device_id } => write!(f, "state/{device_id}"),
            TopicRoute::RobotStream {
                device_id,
                robot_id,
                channel,
            } => write!(f, "stream/{device_id}/robots/{robot_id}/{}", channel.as_str()),
            TopicRoute::RobotTaskState {
                device_id,
                robot_id,
            } => write!(f, "state/{device_id}/robots/{robot_id}/tasks"),
            TopicRoute::DeviceCommand { device_id, command } => {
                write!(f, "state/{device_id}/{command}")
            }
        }
    }
}

/// Topics to subscribe for a device itself.
pub fn device_topics(device_id: &str) -> Vec<String> {
    vec![format!("stream/{device_id}"), format!("state/{device_id}")]
}

/// Topics to subscribe for one robot under a device.
pub fn robot_topics(device_id: &str, robot_id: &str) -> Vec<String> {
    RobotChannel::ALL
        .iter()
        .map(|c| format!("stream/{device_id}/robots/{robot_id}/{}", c.as_str()))
        .chain(std::iter::once(format!(
            "state/{device_id}/robots/{robot_id}/tasks"
        )))
        .collect()
}

/// Destination of an outbound command.
pub fn command_destination(device_id: &str, command_type: &str) -> String {
    format!("state/{device_id}/{command_type}")
}
