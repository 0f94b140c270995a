//! The reconciliation loop.
//!
//! One task owns every mutation of the [`TelemetryStore`]. It multiplexes
//! four inputs:
//!
//! | Input             | Effect                                                 |
//! |-------------------|--------------------------------------------------------|
//! | inbox             | normalize, apply, subscribe discovered robots, automate |
//! | control requests  | device selection, settings changes, alert clearing     |
//! | connection events | resubscribe every desired topic on `Established`       |
//! | tick              | elapsed-time phase fallback, TTL eviction, snapshots    |
//!
//! Messages carry the subscription epoch they were forwarded under. Anything
//! older than the current epoch was queued by a subscription that has since
//! been released and is dropped unread.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleetsync_kernel::{RobotSettings, Settings, SystemMode, ThresholdResolver, ThresholdSet};
use fleetsync_middleware::normalize::normalize;
use fleetsync_middleware::topics::{device_topics, robot_topics};
use fleetsync_middleware::{ConnectionEvent, InboundMessage, SubscriptionManager};
use fleetsync_store::{RobotRef, SettingsRepository, TelemetryStore};
use fleetsync_types::FleetError;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::automation::AutomationPolicy;
use crate::commands::CommandPublisher;

// ─────────────────────────────────────────────────────────────────────────────
// Control requests
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) enum Control {
    SelectDevice {
        device_id: String,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    SetSystemMode {
        mode: SystemMode,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    UpdateThresholds {
        thresholds: ThresholdSet,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    UpdateRobotSettings {
        robots: BTreeMap<String, RobotSettings>,
        reply: oneshot::Sender<Result<(), FleetError>>,
    },
    GetSettings {
        reply: oneshot::Sender<Settings>,
    },
    ClearAlert {
        id: Uuid,
        reply: oneshot::Sender<bool>,
    },
    ClearAlerts {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Counters
// ─────────────────────────────────────────────────────────────────────────────

/// Live pipeline counters, shared with the engine handle.
#[derive(Debug, Default)]
pub struct PipelineStats {
    ingested: AtomicU64,
    stale_dropped: AtomicU64,
    rejected: AtomicU64,
    resubscribes: AtomicU64,
}

/// A point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCounters {
    /// Messages that passed the epoch check.
    pub ingested: u64,
    /// Messages from released subscriptions.
    pub stale_dropped: u64,
    /// Normalized events the store refused.
    pub rejected: u64,
    /// Resubscribe passes after a connection was established.
    pub resubscribes: u64,
}

impl PipelineStats {
    pub fn counters(&self) -> PipelineCounters {
        PipelineCounters {
            ingested: self.ingested.load(Ordering::Relaxed),
            stale_dropped: self.stale_dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            resubscribes: self.resubscribes.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reconciler
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct Reconciler {
    store: Arc<RwLock<TelemetryStore>>,
    subscriptions: SubscriptionManager,
    repo: SettingsRepository,
    settings: Settings,
    commands: CommandPublisher,
    automation: AutomationPolicy,
    selected: watch::Sender<Option<String>>,
    stats: Arc<PipelineStats>,
    snapshot_every: Option<Duration>,
    last_snapshot: Instant,
}

impl Reconciler {
    pub(crate) fn new(
        store: Arc<RwLock<TelemetryStore>>,
        subscriptions: SubscriptionManager,
        repo: SettingsRepository,
        settings: Settings,
        commands: CommandPublisher,
    ) -> Self {
        let (selected, _) = watch::channel(None);
        Self {
            store,
            subscriptions,
            repo,
            settings,
            commands,
            automation: AutomationPolicy::new(),
            selected,
            stats: Arc::new(PipelineStats::default()),
            snapshot_every: None,
            last_snapshot: Instant::now(),
        }
    }

    /// Snapshot the selected device every `every`. Zero disables it.
    pub(crate) fn with_snapshot_interval(mut self, every: Duration) -> Self {
        self.snapshot_every = (!every.is_zero()).then_some(every);
        self
    }

    pub(crate) fn selected(&self) -> watch::Receiver<Option<String>> {
        self.selected.subscribe()
    }

    pub(crate) fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    fn selected_device(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    /// Run until shut down or until every control sender is gone.
    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::Receiver<InboundMessage>,
        mut control: mpsc::Receiver<Control>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        initial: Option<String>,
        tick_every: Duration,
    ) {
        if let Some(device_id) = initial
            && let Err(e) = self.select_device(&device_id).await
        {
            warn!(device_id = %device_id, error = %e, "initial device selection failed");
        }

        let mut ticker = tokio::time::interval(tick_every.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                request = control.recv() => match request {
                    Some(Control::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle_control(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.on_connection_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged_by = n, "connection events lagged, resubscribing");
                        self.on_connection_event(ConnectionEvent::Established).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("connection event feed closed");
                        events_open = false;
                    }
                },
                Some(msg) = inbox.recv() => self.ingest(msg).await,
                _ = ticker.tick() => self.on_tick(Utc::now()).await,
            }
        }
        info!("reconciliation loop stopped");
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    pub(crate) async fn ingest(&mut self, msg: InboundMessage) {
        let epoch = self.subscriptions.current_epoch();
        if msg.epoch != epoch {
            PipelineStats::bump(&self.stats.stale_dropped);
            debug!(topic = %msg.topic, msg_epoch = msg.epoch, epoch, "stale message dropped");
            return;
        }
        PipelineStats::bump(&self.stats.ingested);

        let events = normalize(&msg.topic, &msg.payload, msg.received_at);
        let mut discovered: Vec<RobotRef> = Vec::new();
        let mut devices_touched: BTreeSet<String> = BTreeSet::new();
        {
            let mut store = self.store.write();
            for event in &events {
                match store.apply(event) {
                    Ok(outcome) => {
                        discovered.extend(outcome.discovered);
                        if event.target.robot_id.is_none() {
                            devices_touched.insert(event.target.device_id.clone());
                        }
                    }
                    Err(e) => {
                        PipelineStats::bump(&self.stats.rejected);
                        warn!(topic = %msg.topic, kind = event.payload.kind(), error = %e, "event rejected");
                    }
                }
            }
        }

        for robot in &discovered {
            self.subscribe_robot(robot).await;
        }
        for device_id in &devices_touched {
            self.automate(device_id).await;
        }
    }

    async fn subscribe_robot(&self, robot: &RobotRef) {
        if self.selected_device().as_deref() != Some(robot.device_id.as_str()) {
            return;
        }
        for topic in robot_topics(&robot.device_id, &robot.robot_id) {
            if let Err(e) = self.subscriptions.subscribe(&topic).await {
                warn!(topic = %topic, error = %e, "robot subscribe failed, will retry on reconnect");
            }
        }
    }

    async fn unsubscribe_robot(&self, robot: &RobotRef) {
        for topic in robot_topics(&robot.device_id, &robot.robot_id) {
            if let Err(e) = self.subscriptions.unsubscribe(&topic).await {
                warn!(topic = %topic, error = %e, "robot unsubscribe failed");
            }
        }
    }

    async fn automate(&mut self, device_id: &str) {
        let device = self.store.read().device(device_id);
        let Some(device) = device else {
            return;
        };
        let commands =
            self.automation
                .evaluate(self.settings.system_mode, &device, &self.settings.thresholds);
        for command in commands {
            info!(device_id, command = command.command_type(), payload = %command.payload(), "automation command");
            if self.commands.publish(device_id, &command).await.is_err() {
                self.automation.publish_failed(device_id, &command);
            }
        }
    }

    // ── Device selection ──────────────────────────────────────────────────────

    /// Switch the selected device.
    ///
    /// Every topic of the previous device and its robots is released before
    /// anything of the new device is subscribed, and the epoch is advanced in
    /// between so that queued messages from the old subscriptions are dropped.
    pub(crate) async fn select_device(&mut self, device_id: &str) -> Result<(), FleetError> {
        if !self.store.read().has_device(device_id) {
            return Err(FleetError::UnknownDevice(device_id.to_string()));
        }
        let previous = self.selected_device();
        if previous.as_deref() == Some(device_id) {
            return Ok(());
        }
        if let Some(previous) = &previous {
            self.save_snapshot(previous);
            self.automation.forget(previous);
        }

        let released = self.subscriptions.unsubscribe_all().await;
        let epoch = self.subscriptions.advance_epoch();
        self.selected.send_replace(Some(device_id.to_string()));
        info!(
            from = previous.as_deref().unwrap_or("-"),
            to = device_id,
            released = released.len(),
            epoch,
            "selected device changed"
        );

        self.warm_start(device_id);

        let robots: Vec<String> = self
            .store
            .read()
            .robots(device_id)
            .iter()
            .map(|r| r.id.clone())
            .collect();
        let mut topics = device_topics(device_id);
        for robot_id in &robots {
            topics.extend(robot_topics(device_id, robot_id));
        }
        for topic in &topics {
            if let Err(e) = self.subscriptions.subscribe(topic).await {
                warn!(topic = %topic, error = %e, "subscribe failed, will retry on reconnect");
            }
        }

        if let Err(e) = self.repo.save_selected_device(device_id) {
            warn!(device_id, error = %e, "could not persist selected device");
        }
        self.settings.selected_device = Some(device_id.to_string());
        Ok(())
    }

    /// Fill records that have no live data yet from the stored snapshot.
    fn warm_start(&self, device_id: &str) {
        let snapshot = match self.repo.load_snapshot(device_id) {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return,
            Err(e) => {
                warn!(device_id, error = %e, "snapshot load failed");
                return;
            }
        };
        let outcome = self.store.write().hydrate(&snapshot);
        match outcome {
            Ok(outcome) => info!(
                device_id,
                device_filled = outcome.device_filled,
                robots_filled = outcome.robots_filled.len(),
                taken_at = %snapshot.taken_at,
                "warm start from snapshot"
            ),
            Err(e) => warn!(device_id, error = %e, "snapshot rejected"),
        }
    }

    fn save_snapshot(&mut self, device_id: &str) {
        self.last_snapshot = Instant::now();
        let snapshot = self.store.read().snapshot(device_id);
        let Some(snapshot) = snapshot else {
            return;
        };
        match self.repo.save_snapshot(&snapshot) {
            Ok(()) => debug!(device_id, robots = snapshot.robots.len(), "snapshot saved"),
            Err(e) => warn!(device_id, error = %e, "snapshot save failed"),
        }
    }

    // ── Connection and time ───────────────────────────────────────────────────

    pub(crate) async fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Established => {
                PipelineStats::bump(&self.stats.resubscribes);
                let restored = self.subscriptions.resubscribe_all().await;
                debug!(restored, "subscriptions restored");
            }
            ConnectionEvent::Lost => {
                warn!(selected = ?self.selected_device(), "connection lost, telemetry paused");
            }
        }
    }

    pub(crate) async fn on_tick(&mut self, now: DateTime<Utc>) {
        let (changes, evicted) = {
            let mut store = self.store.write();
            (store.tick(now), store.evict_stale_robots(now))
        };
        if !changes.is_empty() {
            debug!(changes = changes.len(), "phases advanced on elapsed time");
        }
        let selected = self.selected_device();
        for robot in &evicted {
            if selected.as_deref() == Some(robot.device_id.as_str()) {
                self.unsubscribe_robot(robot).await;
            }
        }
        if let (Some(every), Some(device_id)) = (self.snapshot_every, selected)
            && self.last_snapshot.elapsed() >= every
        {
            self.save_snapshot(&device_id);
        }
    }

    // ── Control ───────────────────────────────────────────────────────────────

    async fn handle_control(&mut self, request: Control) {
        match request {
            Control::SelectDevice { device_id, reply } => {
                let result = self.select_device(&device_id).await;
                let _ = reply.send(result);
            }
            Control::SetSystemMode { mode, reply } => {
                let result = self.set_system_mode(mode).await;
                let _ = reply.send(result);
            }
            Control::UpdateThresholds { thresholds, reply } => {
                let _ = reply.send(self.update_thresholds(thresholds));
            }
            Control::UpdateRobotSettings { robots, reply } => {
                let _ = reply.send(self.update_robot_settings(robots));
            }
            Control::GetSettings { reply } => {
                let _ = reply.send(self.settings.clone());
            }
            Control::ClearAlert { id, reply } => {
                let _ = reply.send(self.store.write().clear_alert(id));
            }
            Control::ClearAlerts { reply } => {
                self.store.write().clear_alerts();
                let _ = reply.send(());
            }
            Control::Shutdown { reply } => {
                // Handled by the loop itself.
                let _ = reply.send(());
            }
        }
    }

    async fn set_system_mode(&mut self, mode: SystemMode) -> Result<(), FleetError> {
        self.repo.save_system_mode(mode)?;
        self.settings.system_mode = mode;
        info!(mode = mode.as_str(), "system mode changed");
        if let Some(device_id) = self.selected_device() {
            self.automate(&device_id).await;
        }
        Ok(())
    }

    fn update_thresholds(&mut self, thresholds: ThresholdSet) -> Result<(), FleetError> {
        self.repo.save_thresholds(&thresholds)?;
        self.settings.thresholds = thresholds;
        self.refresh_resolver();
        Ok(())
    }

    fn update_robot_settings(
        &mut self,
        robots: BTreeMap<String, RobotSettings>,
    ) -> Result<(), FleetError> {
        self.repo.save_robot_settings(&robots)?;
        self.settings.robot_settings = robots;
        self.refresh_resolver();
        Ok(())
    }

    fn refresh_resolver(&self) {
        let resolver = ThresholdResolver::new(self.settings.thresholds)
            .with_robot_settings(&self.settings.robot_settings);
        self.store.write().set_resolver(resolver);
    }

    async fn shutdown(&mut self) {
        if let Some(device_id) = self.selected_device() {
            self.save_snapshot(&device_id);
        }
        let released = self.subscriptions.unsubscribe_all().await;
        info!(released = released.len(), "reconciler shutting down");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_middleware::{Credentials, LoopbackTransport, Transport, TransportOp};
    use fleetsync_spatial::{PhaseTiming, RoomRegistry};
    use fleetsync_store::{KeyValueStore, MemoryKvStore, StoreOptions};
    use fleetsync_types::{DeviceSpec, EventPayload, EventTarget, TelemetryEvent};
    use serde_json::{Value, json};

    struct Fixture {
        broker: LoopbackTransport,
        kv: Arc<MemoryKvStore>,
        store: Arc<RwLock<TelemetryStore>>,
        rec: Reconciler,
        _inbox: mpsc::Receiver<InboundMessage>,
    }

    async fn fixture_with(kv: Arc<MemoryKvStore>, options: StoreOptions) -> Fixture {
        let broker = LoopbackTransport::new();
        broker.connect(&Credentials::default()).await.unwrap();
        let repo = SettingsRepository::new(kv.clone());
        let settings = repo.load().unwrap();
        let rooms = Arc::new(RoomRegistry::default_facility());
        let store = Arc::new(RwLock::new(TelemetryStore::new(
            &[DeviceSpec::new("dev-1", "Zone A"), DeviceSpec::new("dev-2", "Zone B")],
            ThresholdResolver::new(settings.thresholds),
            rooms.clone(),
            &options,
            PhaseTiming::default(),
        )));
        let transport: Arc<dyn Transport> = Arc::new(broker.clone());
        // Tests feed `ingest` directly; the inbox only has to stay open.
        let (tx, inbox) = mpsc::channel(64);
        let rec = Reconciler::new(
            store.clone(),
            SubscriptionManager::new(transport.clone(), tx),
            repo,
            settings,
            CommandPublisher::new(transport, rooms),
        );
        Fixture {
            broker,
            kv,
            store,
            rec,
            _inbox: inbox,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryKvStore::new()), StoreOptions::default()).await
    }

    fn msg(topic: &str, payload: Value, epoch: u64) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            epoch,
            payload: payload.to_string(),
            received_at: Utc::now(),
        }
    }

    fn temperature(f: &Fixture, device_id: &str) -> Option<f64> {
        f.store.read().device(device_id).unwrap().environment.temperature
    }

    #[tokio::test]
    async fn switching_device_releases_old_topics_before_subscribing_new() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();
        f.rec
            .ingest(msg("stream/dev-1", json!({"robots": ["R1"]}), epoch))
            .await;
        assert!(f
            .broker
            .live_topics()
            .contains(&"stream/dev-1/robots/R1/location".to_string()));

        f.broker.clear_operations();
        f.rec.select_device("dev-2").await.unwrap();
        let ops = f.broker.operations();

        let unsubscribed: Vec<&String> = ops
            .iter()
            .filter_map(|op| match op {
                TransportOp::Unsubscribe(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(unsubscribed.len(), 2 + 6);
        assert!(unsubscribed.iter().all(|t| t.contains("dev-1")));

        let last_unsubscribe = ops
            .iter()
            .rposition(|op| matches!(op, TransportOp::Unsubscribe(_)))
            .unwrap();
        let first_subscribe = ops
            .iter()
            .position(|op| matches!(op, TransportOp::Subscribe(_)))
            .unwrap();
        assert!(last_unsubscribe < first_subscribe);
        assert!(ops.iter().all(|op| match op {
            TransportOp::Subscribe(t) => t.contains("dev-2"),
            _ => true,
        }));
        assert_eq!(f.kv.get("selectedDevice").unwrap(), Some(json!("dev-2")));
    }

    #[tokio::test]
    async fn messages_from_released_subscriptions_are_dropped() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        let old_epoch = f.rec.subscriptions.current_epoch();
        f.rec.select_device("dev-2").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();
        assert!(epoch > old_epoch);

        f.rec
            .ingest(msg("stream/dev-1", json!({"temperature": 30.0}), old_epoch))
            .await;
        assert_eq!(temperature(&f, "dev-1"), None);

        f.rec
            .ingest(msg("stream/dev-2", json!({"temperature": 21.0}), epoch))
            .await;
        assert_eq!(temperature(&f, "dev-2"), Some(21.0));

        let counters = f.rec.stats().counters();
        assert_eq!(counters.stale_dropped, 1);
        assert_eq!(counters.ingested, 1);
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_without_touching_subscriptions() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        f.broker.clear_operations();
        let err = f.rec.select_device("dev-9").await.unwrap_err();
        assert_eq!(err, FleetError::UnknownDevice("dev-9".into()));
        assert!(f.broker.operations().is_empty());
        assert_eq!(f.rec.selected_device().as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn reselecting_the_same_device_is_a_no_op() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        f.broker.clear_operations();
        f.rec.select_device("dev-1").await.unwrap();
        assert!(f.broker.operations().is_empty());
    }

    #[tokio::test]
    async fn selection_warm_starts_from_snapshot() {
        let kv = Arc::new(MemoryKvStore::new());
        {
            let mut seed = TelemetryStore::with_defaults(&[DeviceSpec::new("dev-1", "Zone A")]);
            seed.apply(&TelemetryEvent::new(
                "stream/dev-1",
                EventTarget::device("dev-1"),
                Utc::now(),
                EventPayload::RobotDiscovery {
                    robot_ids: vec!["R7".into()],
                },
            ))
            .unwrap();
            SettingsRepository::new(kv.clone())
                .save_snapshot(&seed.snapshot("dev-1").unwrap())
                .unwrap();
        }

        let mut f = fixture_with(kv, StoreOptions::default()).await;
        f.rec.select_device("dev-1").await.unwrap();
        assert!(f.store.read().robot("dev-1", "R7").is_some());
        assert!(f
            .broker
            .live_topics()
            .contains(&"state/dev-1/robots/R7/tasks".to_string()));
    }

    #[tokio::test]
    async fn switching_away_saves_a_snapshot() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();
        f.rec
            .ingest(msg("stream/dev-1", json!({"temperature": 23.0}), epoch))
            .await;
        f.rec.select_device("dev-2").await.unwrap();
        let stored = f.kv.get("snapshot/dev-1").unwrap().unwrap();
        assert_eq!(stored["device"]["environment"]["temperature"], json!(23.0));
    }

    #[tokio::test]
    async fn automation_commands_only_in_automatic_mode() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();

        f.rec
            .ingest(msg("stream/dev-1", json!({"temperature": 31.0}), epoch))
            .await;
        assert!(f.broker.published().is_empty());

        f.rec.set_system_mode(SystemMode::Automatic).await.unwrap();
        let published = f.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "state/dev-1/ac");
        let body: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(body["ac_power"], true);
        assert_eq!(f.kv.get("systemMode").unwrap(), Some(json!("AUTOMATIC")));
    }

    #[tokio::test]
    async fn invalid_thresholds_leave_settings_untouched() {
        let mut f = fixture().await;
        let mut bad = ThresholdSet::default();
        bad.humidity.min = 90.0;
        assert!(matches!(
            f.rec.update_thresholds(bad),
            Err(FleetError::Validation(_))
        ));
        assert_eq!(f.rec.settings.thresholds, ThresholdSet::default());

        let mut tighter = ThresholdSet::default();
        tighter.temperature.max = 24.0;
        f.rec.update_thresholds(tighter).unwrap();
        assert_eq!(f.store.read().resolver().thresholds().temperature.max, 24.0);
    }

    #[tokio::test]
    async fn established_event_restores_subscriptions() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        f.broker.force_disconnect();
        assert!(f.broker.live_topics().is_empty());

        f.broker.connect(&Credentials::default()).await.unwrap();
        f.rec.on_connection_event(ConnectionEvent::Established).await;
        assert_eq!(f.broker.live_topics(), vec!["state/dev-1", "stream/dev-1"]);
        assert_eq!(f.rec.stats().counters().resubscribes, 1);
    }

    #[tokio::test]
    async fn evicted_robots_are_unsubscribed() {
        let options = StoreOptions {
            robot_ttl_secs: Some(60),
            ..StoreOptions::default()
        };
        let mut f = fixture_with(Arc::new(MemoryKvStore::new()), options).await;
        f.rec.select_device("dev-1").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();
        f.rec
            .ingest(msg("stream/dev-1/robots/R1/battery", json!({"battery": 80}), epoch))
            .await;
        assert!(f
            .broker
            .live_topics()
            .contains(&"stream/dev-1/robots/R1/battery".to_string()));

        f.broker.clear_operations();
        f.rec.on_tick(Utc::now() + chrono::Duration::seconds(120)).await;
        assert!(f.store.read().robot("dev-1", "R1").is_none());
        assert_eq!(f.rec.subscriptions.topics(), vec!["state/dev-1", "stream/dev-1"]);
        assert!(f
            .broker
            .operations()
            .contains(&TransportOp::Unsubscribe("stream/dev-1/robots/R1/battery".into())));
    }

    #[tokio::test]
    async fn robots_are_kept_without_ttl() {
        let mut f = fixture().await;
        f.rec.select_device("dev-1").await.unwrap();
        let epoch = f.rec.subscriptions.current_epoch();
        f.rec
            .ingest(msg("stream/dev-1/robots/R1/battery", json!({"battery": 80}), epoch))
            .await;
        f.rec.on_tick(Utc::now() + chrono::Duration::days(7)).await;
        assert!(f.store.read().robot("dev-1", "R1").is_some());
    }
}
