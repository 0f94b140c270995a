//! Connecting and staying connected.
//!
//! [`connect_with_timeout`] bounds a single handshake. [`ConnectionSupervisor`]
//! wraps it in a fixed-delay retry loop and publishes connectivity as a
//! `watch<bool>` flag. Transport errors never reach consumers as errors;
//! they only see the flag go `false` and, later, `true` again.
//!
//! Re-establishing subscriptions is not the supervisor's job: the transport
//! emits [`ConnectionEvent::Established`] on every successful handshake and
//! the subscription owner reacts to it.

use std::sync::Arc;
use std::time::Duration;

use fleetsync_types::FleetError;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::transport::{ConnectionEvent, Credentials, Transport};

/// Handshake deadline used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay between reconnect attempts used when none is configured.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Run the handshake, failing with [`FleetError::ConnectTimeout`] if it
/// does not finish within `timeout`.
pub async fn connect_with_timeout(
    transport: &dyn Transport,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<(), FleetError> {
    match tokio::time::timeout(timeout, transport.connect(credentials)).await {
        Ok(result) => result,
        Err(_) => Err(FleetError::ConnectTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

/// Keeps a transport connected with fixed-delay retries.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    credentials: Credentials,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    connected: watch::Sender<bool>,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            transport,
            credentials,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connected,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Connectivity flag. Starts `false`.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Run the supervisor on the current runtime. Abort the handle to stop it.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut attempt: u64 = 0;
        loop {
            attempt += 1;
            // Subscribe before connecting so a drop right after the
            // handshake is not missed.
            let mut events = self.transport.connection_events();
            match connect_with_timeout(
                self.transport.as_ref(),
                &self.credentials,
                self.connect_timeout,
            )
            .await
            {
                Ok(()) => {
                    info!(attempt, "transport connected");
                    attempt = 0;
                    self.connected.send_replace(true);
                    if !wait_for_loss(&mut events).await {
                        self.connected.send_replace(false);
                        return;
                    }
                    self.connected.send_replace(false);
                    warn!(
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "transport connection lost, reconnecting"
                    );
                }
                Err(e) => {
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = self.reconnect_delay.as_millis() as u64,
                        "transport connect failed, retrying"
                    );
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

/// Wait for [`ConnectionEvent::Lost`]. Returns `false` if the event feed
/// closed, meaning the transport itself is gone.
async fn wait_for_loss(events: &mut broadcast::Receiver<ConnectionEvent>) -> bool {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Lost) => return true,
            Ok(ConnectionEvent::Established) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged_by = n, "connection event feed lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
