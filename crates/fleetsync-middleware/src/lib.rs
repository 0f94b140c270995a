//! `fleetsync-middleware` – the transport boundary.
//!
//! Moves raw messages between an external real-time broker and the
//! reconciliation loop without interpreting them beyond normalization.
//!
//! # Modules
//!
//! - [`transport`] – the [`Transport`][transport::Transport] trait: connect,
//!   per-topic subscribe streams, publish, connection events.
//! - [`loopback`] – [`LoopbackTransport`][loopback::LoopbackTransport]: an
//!   in-process broker on Tokio broadcast channels, used for tests and
//!   simulation.
//! - [`connection`] – [`connect_with_timeout`][connection::connect_with_timeout]
//!   and the fixed-delay [`ConnectionSupervisor`][connection::ConnectionSupervisor].
//! - [`subscriptions`] – [`SubscriptionManager`][subscriptions::SubscriptionManager]:
//!   idempotent subscribe, epoch tagging, resubscribe-all.
//! - [`topics`] – [`TopicRoute`][topics::TopicRoute] parsing and topic builders.
//! - [`normalize`] – turns a raw payload into
//!   [`TelemetryEvent`][fleetsync_types::TelemetryEvent]s with a documented
//!   key precedence per field.
//! - [`commands`] – outbound operator [`Command`][commands::Command] payloads.

pub mod commands;
pub mod connection;
pub mod loopback;
pub mod normalize;
pub mod subscriptions;
pub mod topics;
pub mod transport;

pub use commands::{Command, TaskAssignment};
pub use connection::{ConnectionSupervisor, DEFAULT_CONNECT_TIMEOUT, connect_with_timeout};
pub use loopback::{LoopbackTransport, TransportOp};
pub use normalize::normalize;
pub use subscriptions::{InboundMessage, SubscriptionHandle, SubscriptionManager};
pub use topics::{RobotChannel, TopicRoute};
pub use transport::{ConnectionEvent, Credentials, RawMessage, Transport};
