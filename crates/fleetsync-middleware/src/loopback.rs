//! In-process broker.
//!
//! [`LoopbackTransport`] implements [`Transport`] on one Tokio broadcast
//! channel per topic, so every subscriber of a topic sees every message
//! without one slow subscriber blocking the others. It records the order of
//! transport operations and every published message, and can be told to fail
//! or drop the connection, which makes it the fake broker for tests and for
//! simulation runs.
//!
//! # Example
//!
//! ```rust
//! use futures_util::StreamExt;
//! use fleetsync_middleware::loopback::LoopbackTransport;
//! use fleetsync_middleware::transport::{Credentials, Transport};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), fleetsync_types::FleetError> {
//! let broker = LoopbackTransport::new();
//! broker.connect(&Credentials::default()).await?;
//!
//! let mut stream = broker.subscribe("stream/dev-1").await?;
//! broker.inject("stream/dev-1", r#"{"temperature": 21.5}"#);
//!
//! let msg = stream.next().await.unwrap();
//! assert_eq!(msg.topic, "stream/dev-1");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use fleetsync_types::FleetError;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::transport::{ConnectionEvent, Credentials, RawMessage, Transport};

/// Per-topic buffer before slow subscribers start lagging.
const DEFAULT_CAPACITY: usize = 256;

/// A transport operation, in the order the loopback saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    Connect,
    Subscribe(String),
    Unsubscribe(String),
    Publish(String),
    Disconnect,
}

struct Inner {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<RawMessage>>>,
    events: broadcast::Sender<ConnectionEvent>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    handshake_delay: Mutex<Duration>,
    operations: Mutex<Vec<TransportOp>>,
    published: Mutex<Vec<RawMessage>>,
}

/// Shared in-process broker. Clones share the same channels.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Inner {
                capacity: capacity.max(1),
                topics: Mutex::new(HashMap::new()),
                events,
                connected: AtomicBool::new(false),
                fail_connect: AtomicBool::new(false),
                fail_publish: AtomicBool::new(false),
                handshake_delay: Mutex::new(Duration::ZERO),
                operations: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Deliver `payload` to current subscribers of `topic`, as if another
    /// client had published it. Returns the number of receivers.
    pub fn inject(&self, topic: &str, payload: impl Into<String>) -> usize {
        if !self.is_connected() {
            debug!(topic, "loopback: inject while disconnected, dropped");
            return 0;
        }
        let sender = self.inner.topics.lock().get(topic).cloned();
        match sender {
            Some(tx) => tx.send(RawMessage::new(topic, payload)).unwrap_or(0),
            None => 0,
        }
    }

    /// Drop the connection: every subscription stream ends and
    /// [`ConnectionEvent::Lost`] is emitted.
    pub fn force_disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.topics.lock().clear();
        self.inner.operations.lock().push(TransportOp::Disconnect);
        warn!("loopback: connection dropped");
        let _ = self.inner.events.send(ConnectionEvent::Lost);
    }

    /// Make subsequent `connect` calls fail (or succeed again).
    pub fn set_connect_failure(&self, fail: bool) {
        self.inner.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `publish` calls fail (or succeed again).
    pub fn set_publish_failure(&self, fail: bool) {
        self.inner.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delay every handshake by `delay`.
    pub fn set_handshake_delay(&self, delay: Duration) {
        *self.inner.handshake_delay.lock() = delay;
    }

    /// Every message successfully published through this transport.
    pub fn published(&self) -> Vec<RawMessage> {
        self.inner.published.lock().clone()
    }

    /// Every transport operation, in order.
    pub fn operations(&self) -> Vec<TransportOp> {
        self.inner.operations.lock().clone()
    }

    pub fn clear_operations(&self) {
        self.inner.operations.lock().clear();
    }

    /// Topics with at least one live receiver.
    pub fn live_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .topics
            .lock()
            .iter()
            .filter(|(_, tx)| tx.receiver_count() > 0)
            .map(|(t, _)| t.clone())
            .collect();
        topics.sort();
        topics
    }

    fn not_connected(action: &str) -> FleetError {
        FleetError::Transport(format!("{action}: not connected"))
    }
}

fn receiver_stream(rx: broadcast::Receiver<RawMessage>, topic: String) -> BoxStream<'static, RawMessage> {
    stream::unfold((rx, topic), |(mut rx, topic)| async move {
        loop {
            match rx.recv().await {
                Ok(msg) => return Some((msg, (rx, topic))),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(topic = %topic, lagged_by = n, "loopback subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, _credentials: &Credentials) -> Result<(), FleetError> {
        let delay = *self.inner.handshake_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.fail_connect.load(Ordering::SeqCst) {
            return Err(FleetError::Transport("handshake rejected".to_string()));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.operations.lock().push(TransportOp::Connect);
        let _ = self.inner.events.send(ConnectionEvent::Established);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, RawMessage>, FleetError> {
        if !self.is_connected() {
            return Err(Self::not_connected("subscribe"));
        }
        let rx = {
            let mut topics = self.inner.topics.lock();
            topics
                .entry(topic.to_string())
                .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
                .subscribe()
        };
        self.inner
            .operations
            .lock()
            .push(TransportOp::Subscribe(topic.to_string()));
        Ok(receiver_stream(rx, topic.to_string()))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), FleetError> {
        if !self.is_connected() {
            return Err(Self::not_connected("unsubscribe"));
        }
        self.inner
            .operations
            .lock()
            .push(TransportOp::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn publish(&self, destination: &str, payload: &str) -> Result<(), FleetError> {
        if !self.is_connected() {
            return Err(Self::not_connected("publish"));
        }
        if self.inner.fail_publish.load(Ordering::SeqCst) {
            return Err(FleetError::Transport(format!(
                "broker refused message for {destination}"
            )));
        }
        let msg = RawMessage::new(destination, payload);
        self.inner
            .operations
            .lock()
            .push(TransportOp::Publish(destination.to_string()));
        self.inner.published.lock().push(msg.clone());
        let sender = self.inner.topics.lock().get(destination).cloned();
        if let Some(tx) = sender {
            let _ = tx.send(msg);
        }
        Ok(())
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let broker = LoopbackTransport::new();
        assert!(broker.subscribe("stream/dev-1").await.is_err());
    }

    #[tokio::test]
    async fn each_subscriber_receives_each_message() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await?;
        let mut a = broker.subscribe("stream/dev-1").await?;
        let mut b = broker.subscribe("stream/dev-1").await?;

        assert_eq!(broker.inject("stream/dev-1", "{}"), 2);
        assert_eq!(a.next().await.unwrap().payload, "{}");
        assert_eq!(b.next().await.unwrap().payload, "{}");
        Ok(())
    }

    #[tokio::test]
    async fn topics_are_isolated() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await?;
        let _a = broker.subscribe("stream/dev-1").await?;
        assert_eq!(broker.inject("stream/dev-2", "{}"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn connect_emits_established() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        let mut events = broker.connection_events();
        broker.connect(&Credentials::default()).await?;
        assert_eq!(events.recv().await?, ConnectionEvent::Established);
        Ok(())
    }

    #[tokio::test]
    async fn force_disconnect_ends_streams() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await?;
        let mut events = broker.connection_events();
        let mut stream = broker.subscribe("state/dev-1").await?;

        broker.force_disconnect();
        assert!(stream.next().await.is_none());
        assert_eq!(events.recv().await?, ConnectionEvent::Lost);
        assert!(!broker.is_connected());
        assert!(broker.live_topics().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn publish_is_recorded_and_can_fail() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await?;
        broker.publish("state/dev-1/ac", r#"{"ac_power":true}"#).await?;
        assert_eq!(broker.published().len(), 1);

        broker.set_publish_failure(true);
        let err = broker.publish("state/dev-1/ac", "{}").await.unwrap_err();
        assert!(matches!(err, FleetError::Transport(_)));
        assert_eq!(broker.published().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn operations_are_recorded_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await?;
        let _s = broker.subscribe("stream/a").await?;
        broker.unsubscribe("stream/a").await?;
        assert_eq!(
            broker.operations(),
            vec![
                TransportOp::Connect,
                TransportOp::Subscribe("stream/a".into()),
                TransportOp::Unsubscribe("stream/a".into()),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn connect_failure_is_reported() {
        let broker = LoopbackTransport::new();
        broker.set_connect_failure(true);
        assert!(broker.connect(&Credentials::default()).await.is_err());
        assert!(!broker.is_connected());
    }
}
