//! [`EngineHandle`] – the running engine as seen by its consumers.
//!
//! Reads go straight to the shared store under a short read lock and return
//! `Arc`-shared records. Everything that mutates state is sent to the
//! reconciliation loop and answered over a oneshot channel, so there is only
//! ever one writer. Operator commands are published directly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetsync_kernel::{RobotSettings, Settings, SystemMode, ThresholdResolver, ThresholdSet};
use fleetsync_middleware::{ConnectionSupervisor, SubscriptionManager, TaskAssignment, Transport};
use fleetsync_store::{
    DeviceSnapshot, KeyValueStore, SettingsRepository, TelemetryStore,
};
use fleetsync_types::{Alert, DeviceState, FleetError, RobotState};
use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::commands::{CommandPublisher, TaskRequest};
use crate::config::EngineConfig;
use crate::reconciler::{Control, PipelineCounters, PipelineStats, Reconciler};

/// Raw messages buffered between the forwarders and the loop.
pub const INBOX_CAPACITY: usize = 1_024;
const CONTROL_CAPACITY: usize = 32;

pub struct EngineHandle {
    store: Arc<RwLock<TelemetryStore>>,
    control: mpsc::Sender<Control>,
    connectivity: watch::Receiver<bool>,
    selected: watch::Receiver<Option<String>>,
    commands: CommandPublisher,
    stats: Arc<PipelineStats>,
    reconciler: Option<JoinHandle<()>>,
    supervisor: JoinHandle<()>,
}

impl EngineHandle {
    /// Load settings, build the store from the roster and start the
    /// reconciliation loop and the connection supervisor on the current Tokio
    /// runtime.
    ///
    /// The persisted selected device is restored when it is still in the
    /// roster; otherwise the first roster device is selected.
    pub fn start(
        config: &EngineConfig,
        transport: Arc<dyn Transport>,
        kv: Arc<dyn KeyValueStore>,
    ) -> Result<Self, FleetError> {
        config.validate()?;
        let repo = SettingsRepository::new(kv);
        let settings = repo.load()?;

        let rooms = Arc::new(config.facility.registry());
        let resolver = ThresholdResolver::new(settings.thresholds)
            .with_robot_settings(&settings.robot_settings);
        let store = Arc::new(RwLock::new(TelemetryStore::new(
            &config.devices,
            resolver,
            Arc::clone(&rooms),
            &config.store,
            config.phases,
        )));

        let initial = settings
            .selected_device
            .clone()
            .filter(|id| config.devices.iter().any(|d| &d.id == id))
            .or_else(|| config.devices.first().map(|d| d.id.clone()));

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        let subscriptions = SubscriptionManager::new(Arc::clone(&transport), inbox_tx);
        // Taken before the supervisor runs so the first `Established` is seen.
        let events = transport.connection_events();

        let supervisor =
            ConnectionSupervisor::new(Arc::clone(&transport), config.transport.credentials())
                .with_connect_timeout(config.transport.connect_timeout())
                .with_reconnect_delay(config.transport.reconnect_delay());
        let connectivity = supervisor.connectivity();

        let commands = CommandPublisher::new(transport, rooms);
        let reconciler = Reconciler::new(
            Arc::clone(&store),
            subscriptions,
            repo,
            settings,
            commands.clone(),
        )
        .with_snapshot_interval(Duration::from_secs(config.storage.snapshot_interval_secs));
        let selected = reconciler.selected();
        let stats = reconciler.stats();

        let reconciler = tokio::spawn(reconciler.run(
            inbox_rx,
            control_rx,
            events,
            initial,
            Duration::from_millis(config.store.tick_ms),
        ));
        let supervisor = supervisor.spawn();
        info!(
            devices = config.devices.len(),
            url = %config.transport.url,
            "engine started"
        );

        Ok(Self {
            store,
            control: control_tx,
            connectivity,
            selected,
            commands,
            stats,
            reconciler: Some(reconciler),
            supervisor,
        })
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.control
            .send(make(tx))
            .await
            .map_err(|_| FleetError::Channel("reconciliation loop has stopped".to_string()))?;
        rx.await
            .map_err(|_| FleetError::Channel("reconciliation loop dropped the request".to_string()))
    }

    fn ensure_device(&self, device_id: &str) -> Result<(), FleetError> {
        if self.store.read().has_device(device_id) {
            Ok(())
        } else {
            Err(FleetError::UnknownDevice(device_id.to_string()))
        }
    }

    // ── State queries ─────────────────────────────────────────────────────────

    pub fn device(&self, device_id: &str) -> Option<Arc<DeviceState>> {
        self.store.read().device(device_id)
    }

    pub fn devices(&self) -> Vec<Arc<DeviceState>> {
        self.store.read().devices()
    }

    pub fn robots(&self, device_id: &str) -> Vec<Arc<RobotState>> {
        self.store.read().robots(device_id)
    }

    pub fn robot(&self, device_id: &str, robot_id: &str) -> Option<Arc<RobotState>> {
        self.store.read().robot(device_id, robot_id)
    }

    /// Most recent first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.store.read().alerts()
    }

    pub fn is_device_live(&self, device_id: &str) -> bool {
        self.store.read().is_device_live(device_id, Utc::now())
    }

    pub fn is_robot_live(&self, device_id: &str, robot_id: &str) -> bool {
        self.store.read().is_robot_live(device_id, robot_id, Utc::now())
    }

    pub fn snapshot(&self, device_id: &str) -> Option<DeviceSnapshot> {
        self.store.read().snapshot(device_id)
    }

    pub fn raw_event_count(&self) -> u64 {
        self.store.read().raw_event_count()
    }

    pub fn counters(&self) -> PipelineCounters {
        self.stats.counters()
    }

    // ── Connectivity and selection ────────────────────────────────────────────

    pub fn is_connected(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Connectivity flag; transport failures only ever show up here.
    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity.clone()
    }

    pub fn selected_device(&self) -> Option<String> {
        self.selected.borrow().clone()
    }

    pub fn watch_selected(&self) -> watch::Receiver<Option<String>> {
        self.selected.clone()
    }

    pub async fn select_device(&self, device_id: &str) -> Result<(), FleetError> {
        let device_id = device_id.to_string();
        self.request(|reply| Control::SelectDevice { device_id, reply })
            .await?
    }

    // ── Settings and alerts ───────────────────────────────────────────────────

    pub async fn settings(&self) -> Result<Settings, FleetError> {
        self.request(|reply| Control::GetSettings { reply }).await
    }

    pub async fn set_system_mode(&self, mode: SystemMode) -> Result<(), FleetError> {
        self.request(|reply| Control::SetSystemMode { mode, reply })
            .await?
    }

    /// Validated before anything is persisted or applied.
    pub async fn update_thresholds(&self, thresholds: ThresholdSet) -> Result<(), FleetError> {
        self.request(|reply| Control::UpdateThresholds { thresholds, reply })
            .await?
    }

    pub async fn update_robot_settings(
        &self,
        robots: BTreeMap<String, RobotSettings>,
    ) -> Result<(), FleetError> {
        self.request(|reply| Control::UpdateRobotSettings { robots, reply })
            .await?
    }

    pub async fn clear_alert(&self, id: Uuid) -> Result<bool, FleetError> {
        self.request(|reply| Control::ClearAlert { id, reply }).await
    }

    pub async fn clear_alerts(&self) -> Result<(), FleetError> {
        self.request(|reply| Control::ClearAlerts { reply }).await
    }

    // ── Operator commands ─────────────────────────────────────────────────────

    pub async fn emergency_stop(&self, device_id: &str, engaged: bool) -> Result<(), FleetError> {
        self.ensure_device(device_id)?;
        self.commands.emergency_stop(device_id, engaged).await
    }

    pub async fn set_ac(&self, device_id: &str, power: bool) -> Result<(), FleetError> {
        self.ensure_device(device_id)?;
        self.commands.set_ac(device_id, power).await
    }

    pub async fn set_air_purifier(&self, device_id: &str, power: bool) -> Result<(), FleetError> {
        self.ensure_device(device_id)?;
        self.commands.set_air_purifier(device_id, power).await
    }

    pub async fn assign_task(
        &self,
        device_id: &str,
        request: &TaskRequest,
    ) -> Result<TaskAssignment, FleetError> {
        self.ensure_device(device_id)?;
        self.commands.assign_task(device_id, request).await
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Snapshot the selected device, release every subscription and stop.
    pub async fn shutdown(mut self) -> Result<(), FleetError> {
        self.request(|reply| Control::Shutdown { reply }).await?;
        if let Some(handle) = self.reconciler.take() {
            handle
                .await
                .map_err(|e| FleetError::Channel(format!("reconciliation loop failed: {e}")))?;
        }
        info!("engine stopped");
        Ok(())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_middleware::LoopbackTransport;
    use fleetsync_store::MemoryKvStore;
    use fleetsync_types::DeviceSpec;
    use serde_json::json;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.devices = vec![
            DeviceSpec::new("dev-1", "Zone A"),
            DeviceSpec::new("dev-2", "Zone B"),
        ];
        config.transport.reconnect_delay_ms = 10;
        config.store.tick_ms = 20;
        config
    }

    fn start(broker: &LoopbackTransport, kv: Arc<MemoryKvStore>) -> EngineHandle {
        EngineHandle::start(&config(), Arc::new(broker.clone()), kv).unwrap()
    }

    async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn temperature(engine: &EngineHandle, device_id: &str) -> Option<f64> {
        engine.device(device_id).and_then(|d| d.environment.temperature)
    }

    #[tokio::test]
    async fn ingests_telemetry_for_the_selected_device() {
        let broker = LoopbackTransport::new();
        let engine = start(&broker, Arc::new(MemoryKvStore::new()));

        eventually("connection", || engine.is_connected()).await;
        eventually("initial selection", || {
            engine.selected_device().as_deref() == Some("dev-1")
        })
        .await;
        eventually("device subscription", || {
            broker.live_topics().contains(&"stream/dev-1".to_string())
        })
        .await;

        broker.inject("stream/dev-1", r#"{"temperature": 24.5, "humidity": 41}"#);
        eventually("reading applied", || temperature(&engine, "dev-1") == Some(24.5)).await;
        assert!(engine.is_device_live("dev-1"));
        assert!(!engine.is_device_live("dev-2"));

        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restores_subscriptions_after_reconnect() {
        let broker = LoopbackTransport::new();
        let engine = start(&broker, Arc::new(MemoryKvStore::new()));
        eventually("device subscription", || {
            broker.live_topics().contains(&"state/dev-1".to_string())
        })
        .await;

        // Dropping the connection ends every stream; the supervisor
        // reconnects and the loop resubscribes.
        broker.force_disconnect();
        assert!(broker.live_topics().is_empty());
        eventually("resubscription", || {
            broker.live_topics() == vec!["state/dev-1".to_string(), "stream/dev-1".to_string()]
        })
        .await;

        broker.inject("state/dev-1", r#"{"ac": "on"}"#);
        eventually("state applied", || {
            engine.device("dev-1").and_then(|d| d.controls.ac) == Some(true)
        })
        .await;
        assert!(engine.counters().resubscribes >= 1);
    }

    #[tokio::test]
    async fn selection_is_persisted_and_restored() {
        let broker = LoopbackTransport::new();
        let kv = Arc::new(MemoryKvStore::new());
        let engine = start(&broker, kv.clone());
        eventually("connection", || engine.is_connected()).await;

        engine.select_device("dev-2").await.unwrap();
        assert_eq!(engine.selected_device().as_deref(), Some("dev-2"));
        assert_eq!(
            engine.select_device("dev-9").await,
            Err(FleetError::UnknownDevice("dev-9".into()))
        );
        engine.shutdown().await.unwrap();
        assert_eq!(kv.get("selectedDevice").unwrap(), Some(json!("dev-2")));

        let restarted = start(&broker, kv);
        let mut selected = restarted.watch_selected();
        selected
            .wait_for(|s| s.as_deref() == Some("dev-2"))
            .await
            .unwrap();
        restarted.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn commands_check_the_roster() {
        let broker = LoopbackTransport::new();
        let engine = start(&broker, Arc::new(MemoryKvStore::new()));
        eventually("connection", || engine.is_connected()).await;

        assert_eq!(
            engine.emergency_stop("dev-9", true).await,
            Err(FleetError::UnknownDevice("dev-9".into()))
        );
        engine.emergency_stop("dev-1", true).await.unwrap();
        let sent = engine
            .assign_task("dev-1", &TaskRequest::new("R1", "Deliver", "Cleanroom A", "Storage"))
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published[0].topic, "state/dev-1/emergencyStop");
        assert_eq!(published[1].topic, "state/dev-1/task");
        assert!(published[1].payload.contains(&sent.task_id));
    }

    #[tokio::test]
    async fn settings_changes_go_through_the_loop() {
        let broker = LoopbackTransport::new();
        let kv = Arc::new(MemoryKvStore::new());
        let engine = start(&broker, kv.clone());

        let mut bad = ThresholdSet::default();
        bad.battery.critical = 50.0;
        assert!(matches!(
            engine.update_thresholds(bad).await,
            Err(FleetError::Validation(_))
        ));
        assert_eq!(engine.settings().await.unwrap().thresholds, ThresholdSet::default());

        engine.set_system_mode(SystemMode::Automatic).await.unwrap();
        assert_eq!(
            engine.settings().await.unwrap().system_mode,
            SystemMode::Automatic
        );
        assert_eq!(kv.get("systemMode").unwrap(), Some(json!("AUTOMATIC")));
        engine.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn alerts_can_be_cleared() {
        let broker = LoopbackTransport::new();
        let engine = start(&broker, Arc::new(MemoryKvStore::new()));
        eventually("device subscription", || {
            broker.live_topics().contains(&"stream/dev-1".to_string())
        })
        .await;

        broker.inject("stream/dev-1", r#"{"temperature": 40}"#);
        eventually("alert raised", || !engine.alerts().is_empty()).await;
        let id = engine.alerts()[0].id;
        assert!(engine.clear_alert(id).await.unwrap());
        assert!(!engine.clear_alert(id).await.unwrap());
        engine.clear_alerts().await.unwrap();
        assert!(engine.alerts().is_empty());
    }

    #[tokio::test]
    async fn shutdown_writes_a_snapshot() {
        let broker = LoopbackTransport::new();
        let kv = Arc::new(MemoryKvStore::new());
        let engine = start(&broker, kv.clone());
        eventually("device subscription", || {
            broker.live_topics().contains(&"stream/dev-1".to_string())
        })
        .await;
        broker.inject("stream/dev-1", r#"{"pressure": 1001}"#);
        eventually("reading applied", || {
            engine.device("dev-1").and_then(|d| d.environment.pressure) == Some(1001.0)
        })
        .await;

        engine.shutdown().await.unwrap();
        let stored = kv.get("snapshot/dev-1").unwrap().unwrap();
        assert_eq!(stored["device"]["environment"]["pressure"], json!(1001.0));
    }
}
