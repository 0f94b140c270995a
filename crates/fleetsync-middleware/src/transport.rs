//! The transport contract.
//!
//! FleetSync never speaks a broker protocol directly. A [`Transport`]
//! implementation owns the socket and exposes four primitives plus a feed of
//! [`ConnectionEvent`]s. Everything above it (subscription bookkeeping,
//! reconnects, normalization) is broker-agnostic.
//!
//! # Contract
//!
//! * `connect` resolves once the handshake succeeds and must emit
//!   [`ConnectionEvent::Established`]. It is not responsible for timeouts;
//!   see [`connect_with_timeout`][crate::connection::connect_with_timeout].
//! * `subscribe` returns a stream of every message on one topic. The stream
//!   ends when the connection drops.
//! * `publish` is fire-and-forget; an `Err` means the broker never took the
//!   message.
//! * Losing the connection must emit [`ConnectionEvent::Lost`].

use std::fmt;

use async_trait::async_trait;
use fleetsync_types::FleetError;
use futures_util::stream::BoxStream;
use tokio::sync::broadcast;

/// Broker login.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, passcode: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            passcode: passcode.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field(
                "passcode",
                &if self.passcode.is_empty() {
                    "<not set>"
                } else {
                    "<redacted>"
                },
            )
            .finish()
    }
}

/// A message exactly as the broker delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: String,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Established,
    Lost,
}

/// Boundary to an external real-time broker.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the connection handshake.
    async fn connect(&self, credentials: &Credentials) -> Result<(), FleetError>;

    /// Start receiving messages published to `topic`.
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, RawMessage>, FleetError>;

    /// Tell the broker to stop delivering `topic`.
    async fn unsubscribe(&self, topic: &str) -> Result<(), FleetError>;

    /// Send `payload` to `destination`.
    async fn publish(&self, destination: &str, payload: &str) -> Result<(), FleetError>;

    /// Feed of connection state changes.
    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}
