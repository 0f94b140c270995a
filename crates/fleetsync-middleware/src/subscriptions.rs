//! [`SubscriptionManager`] – topic bookkeeping between transport and inbox.
//!
//! Every subscribed topic gets one forwarder task that copies its stream into
//! a single bounded inbox, tagged with the topic and the subscription epoch
//! at the time of subscribing. The inbox being bounded is what gives the
//! pipeline backpressure: a slow reconciliation loop stalls the forwarders,
//! not memory.
//!
//! The manager keeps two sets:
//!
//! | Set      | Meaning                                                   |
//! |----------|-----------------------------------------------------------|
//! | desired  | topics the owner asked for and has not released           |
//! | active   | topics with a forwarder currently running                 |
//!
//! After a reconnect the transport's streams have ended, so the active set
//! is stale; [`SubscriptionManager::resubscribe_all`] rebuilds it from the
//! desired set.
//!
//! The epoch is bumped by the owner when it switches context (for example,
//! selecting another device). Messages carrying an older epoch are already
//! in flight from released subscriptions and must be discarded by the
//! consumer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use fleetsync_types::FleetError;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::transport::{RawMessage, Transport};

/// A raw message on its way to the reconciliation loop.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub epoch: u64,
    pub payload: String,
    /// Ingestion time, stamped by the forwarder.
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Registry {
    desired: BTreeSet<String>,
    active: BTreeMap<String, JoinHandle<()>>,
}

impl Registry {
    fn is_running(&self, topic: &str) -> bool {
        self.active.get(topic).is_some_and(|h| !h.is_finished())
    }

    fn release(&mut self, topic: &str) {
        self.desired.remove(topic);
        if let Some(handle) = self.active.remove(topic) {
            handle.abort();
        }
    }
}

/// Capability to release one subscription, returned by
/// [`SubscriptionManager::subscribe`].
pub struct SubscriptionHandle {
    topic: String,
    registry: Arc<Mutex<Registry>>,
    transport: Arc<dyn Transport>,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Stop forwarding this topic and tell the broker.
    pub async fn unsubscribe(self) -> Result<(), FleetError> {
        self.registry.lock().release(&self.topic);
        self.transport.unsubscribe(&self.topic).await
    }
}

pub struct SubscriptionManager {
    transport: Arc<dyn Transport>,
    inbox: mpsc::Sender<InboundMessage>,
    registry: Arc<Mutex<Registry>>,
    epoch: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn Transport>, inbox: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            transport,
            inbox,
            registry: Arc::new(Mutex::new(Registry::default())),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Invalidate everything already in flight. Returns the new epoch.
    pub fn advance_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Subscribe to `topic`. Idempotent: a topic that is already being
    /// forwarded is not subscribed again at the transport.
    ///
    /// The topic is recorded as desired before the transport is asked, so a
    /// subscribe that fails while disconnected is still restored by
    /// [`resubscribe_all`](Self::resubscribe_all).
    pub async fn subscribe(&self, topic: &str) -> Result<SubscriptionHandle, FleetError> {
        let running = {
            let mut registry = self.registry.lock();
            registry.desired.insert(topic.to_string());
            registry.is_running(topic)
        };
        if !running {
            let stream = self.transport.subscribe(topic).await?;
            let forwarder = self.spawn_forwarder(topic, stream);
            let mut registry = self.registry.lock();
            if let Some(stale) = registry.active.insert(topic.to_string(), forwarder) {
                stale.abort();
            }
            debug!(topic, epoch = self.current_epoch(), "subscribed");
        }
        Ok(self.handle(topic))
    }

    /// Subscribe to several topics, stopping at the first failure.
    pub async fn subscribe_all<I, S>(&self, topics: I) -> Result<(), FleetError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for topic in topics {
            self.subscribe(topic.as_ref()).await?;
        }
        Ok(())
    }

    fn handle(&self, topic: &str) -> SubscriptionHandle {
        SubscriptionHandle {
            topic: topic.to_string(),
            registry: Arc::clone(&self.registry),
            transport: Arc::clone(&self.transport),
        }
    }

    fn spawn_forwarder(&self, topic: &str, mut stream: BoxStream<'static, RawMessage>) -> JoinHandle<()> {
        let inbox = self.inbox.clone();
        let epoch = self.current_epoch();
        let topic = topic.to_string();
        tokio::spawn(async move {
            while let Some(raw) = stream.next().await {
                let msg = InboundMessage {
                    topic: raw.topic,
                    epoch,
                    payload: raw.payload,
                    received_at: Utc::now(),
                };
                if inbox.send(msg).await.is_err() {
                    debug!(topic = %topic, "inbox closed, forwarder stopping");
                    return;
                }
            }
            debug!(topic = %topic, "subscription stream ended");
        })
    }

    /// Release `topic`. Releasing a topic that is not subscribed is a no-op
    /// at the transport.
    pub async fn unsubscribe(&self, topic: &str) -> Result<(), FleetError> {
        let known = {
            let mut registry = self.registry.lock();
            let known = registry.desired.contains(topic) || registry.active.contains_key(topic);
            registry.release(topic);
            known
        };
        if known {
            self.transport.unsubscribe(topic).await?;
            debug!(topic, "unsubscribed");
        }
        Ok(())
    }

    /// Release every topic. Local forwarders always stop; transport errors
    /// are logged, not returned, since a dead connection has nothing left to
    /// unsubscribe. Returns the released topics in order.
    pub async fn unsubscribe_all(&self) -> Vec<String> {
        let topics: Vec<String> = {
            let mut registry = self.registry.lock();
            let topics: BTreeSet<String> = registry
                .desired
                .iter()
                .chain(registry.active.keys())
                .cloned()
                .collect();
            for topic in &topics {
                registry.release(topic);
            }
            topics.into_iter().collect()
        };
        for topic in &topics {
            if let Err(e) = self.transport.unsubscribe(topic).await {
                warn!(topic = %topic, error = %e, "unsubscribe failed");
            }
        }
        topics
    }

    /// Re-subscribe every desired topic at the transport, replacing any
    /// forwarder left over from the previous connection. Returns how many
    /// topics were restored.
    pub async fn resubscribe_all(&self) -> usize {
        let desired: Vec<String> = self.registry.lock().desired.iter().cloned().collect();
        let mut restored = 0;
        for topic in &desired {
            match self.transport.subscribe(topic).await {
                Ok(stream) => {
                    let forwarder = self.spawn_forwarder(topic, stream);
                    if let Some(stale) = self.registry.lock().active.insert(topic.clone(), forwarder) {
                        stale.abort();
                    }
                    restored += 1;
                }
                Err(e) => warn!(topic = %topic, error = %e, "resubscribe failed"),
            }
        }
        info!(restored, desired = desired.len(), "resubscribed after reconnect");
        restored
    }

    /// Desired topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.registry.lock().desired.iter().cloned().collect()
    }

    /// `true` when `topic` has a running forwarder.
    pub fn is_active(&self, topic: &str) -> bool {
        self.registry.lock().is_running(topic)
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        for (_, handle) in std::mem::take(&mut self.registry.lock().active) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::loopback::{LoopbackTransport, TransportOp};
    use crate::transport::Credentials;

    async fn setup() -> (LoopbackTransport, SubscriptionManager, mpsc::Receiver<InboundMessage>) {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        let manager = SubscriptionManager::new(Arc::new(broker.clone()), tx);
        (broker, manager, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<InboundMessage>) -> InboundMessage {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no message forwarded")
            .expect("inbox closed")
    }

    #[tokio::test]
    async fn forwards_messages_with_epoch() {
        let (broker, manager, mut rx) = setup().await;
        manager.subscribe("stream/dev-1").await.unwrap();
        broker.inject("stream/dev-1", "hello");
        let msg = recv(&mut rx).await;
        assert_eq!(msg.topic, "stream/dev-1");
        assert_eq!(msg.payload, "hello");
        assert_eq!(msg.epoch, 0);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let (broker, manager, mut rx) = setup().await;
        manager.subscribe("stream/dev-1").await.unwrap();
        manager.subscribe("stream/dev-1").await.unwrap();
        let subscribes = broker
            .operations()
            .iter()
            .filter(|op| matches!(op, TransportOp::Subscribe(_)))
            .count();
        assert_eq!(subscribes, 1);

        broker.inject("stream/dev-1", "once");
        recv(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err(), "message was forwarded twice");
    }

    #[tokio::test]
    async fn handle_unsubscribes() {
        let (broker, manager, _rx) = setup().await;
        let handle = manager.subscribe("state/dev-1").await.unwrap();
        assert_eq!(handle.topic(), "state/dev-1");
        handle.unsubscribe().await.unwrap();
        assert!(manager.topics().is_empty());
        assert!(broker
            .operations()
            .contains(&TransportOp::Unsubscribe("state/dev-1".into())));
    }

    #[tokio::test]
    async fn unsubscribe_all_stops_forwarding() {
        let (broker, manager, mut rx) = setup().await;
        manager
            .subscribe_all(["stream/dev-1", "state/dev-1"])
            .await
            .unwrap();
        let released = manager.unsubscribe_all().await;
        assert_eq!(released, vec!["state/dev-1", "stream/dev-1"]);
        assert!(!manager.is_active("stream/dev-1"));

        broker.inject("stream/dev-1", "late");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn epoch_advances() {
        let (broker, manager, mut rx) = setup().await;
        assert_eq!(manager.advance_epoch(), 1);
        manager.subscribe("stream/dev-2").await.unwrap();
        broker.inject("stream/dev-2", "x");
        assert_eq!(recv(&mut rx).await.epoch, 1);
    }

    #[tokio::test]
    async fn failed_subscribe_is_restored_on_reconnect() {
        let broker = LoopbackTransport::new();
        let (tx, mut rx) = mpsc::channel(8);
        let manager = SubscriptionManager::new(Arc::new(broker.clone()), tx);

        assert!(manager.subscribe("stream/dev-1").await.is_err());
        assert_eq!(manager.topics(), vec!["stream/dev-1"]);
        assert!(!manager.is_active("stream/dev-1"));

        broker.connect(&Credentials::default()).await.unwrap();
        assert_eq!(manager.resubscribe_all().await, 1);
        broker.inject("stream/dev-1", "{}");
        assert_eq!(recv(&mut rx).await.topic, "stream/dev-1");
    }

    #[tokio::test]
    async fn resubscribe_restores_all_after_forced_disconnect() {
        let (broker, manager, mut rx) = setup().await;
        let topics = ["stream/dev-1", "state/dev-1", "stream/dev-1/robots/R1/location"];
        manager.subscribe_all(topics).await.unwrap();

        broker.force_disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        for t in topics {
            assert!(!manager.is_active(t), "{t} should have ended");
        }

        broker.connect(&Credentials::default()).await.unwrap();
        assert_eq!(manager.resubscribe_all().await, 3);
        let mut live = broker.live_topics();
        live.sort();
        let mut expected: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        expected.sort();
        assert_eq!(live, expected);

        broker.inject("stream/dev-1/robots/R1/location", "{}");
        assert_eq!(recv(&mut rx).await.topic, "stream/dev-1/robots/R1/location");
    }
}
