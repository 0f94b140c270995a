//! Operator settings and warm-start snapshots on top of a [`KeyValueStore`].
//!
//! | Key               | Value                                         |
//! |-------------------|-----------------------------------------------|
//! | `thresholds`      | [`ThresholdSet`] object                       |
//! | `systemMode`      | `"MANUAL"` or `"AUTOMATIC"`                   |
//! | `robotSettings`   | robot id → [`RobotSettings`]                  |
//! | `selectedDevice`  | device id                                     |
//! | `settingsVersion` | schema version number                         |
//! | `snapshot/{id}`   | [`DeviceSnapshot`] of one device              |
//!
//! [`SettingsRepository::load`] migrates whatever it finds to the current
//! schema exactly once and writes the migrated record back.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetsync_kernel::{
    Migration, RobotSettings, SETTINGS_SCHEMA_VERSION, Settings, SystemMode, ThresholdSet,
    migrate_settings, validate_thresholds,
};
use fleetsync_types::FleetError;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::kv::KeyValueStore;
use crate::telemetry_store::DeviceSnapshot;

pub const KEY_THRESHOLDS: &str = "thresholds";
pub const KEY_SYSTEM_MODE: &str = "systemMode";
pub const KEY_ROBOT_SETTINGS: &str = "robotSettings";
pub const KEY_SELECTED_DEVICE: &str = "selectedDevice";
pub const KEY_SETTINGS_VERSION: &str = "settingsVersion";
pub const SNAPSHOT_PREFIX: &str = "snapshot/";

fn snapshot_key(device_id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{device_id}")
}

#[derive(Clone)]
pub struct SettingsRepository {
    store: Arc<dyn KeyValueStore>,
}

impl SettingsRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Every settings key as one object, the shape [`migrate_settings`]
    /// expects. Snapshots are left out.
    fn raw(&self) -> Result<Value, FleetError> {
        let mut raw = Map::new();
        for key in self.store.keys("")? {
            if key.starts_with(SNAPSHOT_PREFIX) {
                continue;
            }
            if let Some(value) = self.store.get(&key)? {
                raw.insert(key, value);
            }
        }
        Ok(Value::Object(raw))
    }

    /// Load and migrate. A record that needed migrating is written back.
    pub fn load(&self) -> Result<Settings, FleetError> {
        let Migration {
            settings,
            from_version,
            warnings,
        } = migrate_settings(&self.raw()?);
        if from_version != SETTINGS_SCHEMA_VERSION || !warnings.is_empty() {
            info!(
                from_version,
                to_version = SETTINGS_SCHEMA_VERSION,
                warnings = warnings.len(),
                "settings migrated"
            );
            self.save(&settings)?;
        }
        Ok(settings)
    }

    /// Write every settings key at the current schema version.
    pub fn save(&self, settings: &Settings) -> Result<(), FleetError> {
        validate_thresholds(&settings.thresholds)?;
        self.put_json(KEY_THRESHOLDS, &settings.thresholds)?;
        self.store
            .put(KEY_SYSTEM_MODE, &json!(settings.system_mode.as_str()))?;
        self.put_json(KEY_ROBOT_SETTINGS, &settings.robot_settings)?;
        match &settings.selected_device {
            Some(device_id) => self.store.put(KEY_SELECTED_DEVICE, &json!(device_id))?,
            None => {
                self.store.remove(KEY_SELECTED_DEVICE)?;
            }
        }
        self.store
            .put(KEY_SETTINGS_VERSION, &json!(SETTINGS_SCHEMA_VERSION))?;
        Ok(())
    }

    fn put_json<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), FleetError> {
        let value = serde_json::to_value(value).map_err(|e| FleetError::Storage(e.to_string()))?;
        self.store.put(key, &value)?;
        Ok(())
    }

    /// Validate, then persist. Nothing is written when validation fails.
    pub fn save_thresholds(&self, thresholds: &ThresholdSet) -> Result<(), FleetError> {
        if let Err(e) = validate_thresholds(thresholds) {
            warn!(error = %e, "threshold update rejected");
            return Err(e);
        }
        self.put_json(KEY_THRESHOLDS, thresholds)
    }

    pub fn save_system_mode(&self, mode: SystemMode) -> Result<(), FleetError> {
        self.store.put(KEY_SYSTEM_MODE, &json!(mode.as_str()))?;
        Ok(())
    }

    pub fn save_robot_settings(
        &self,
        robots: &BTreeMap<String, RobotSettings>,
    ) -> Result<(), FleetError> {
        self.put_json(KEY_ROBOT_SETTINGS, robots)
    }

    pub fn save_selected_device(&self, device_id: &str) -> Result<(), FleetError> {
        self.store.put(KEY_SELECTED_DEVICE, &json!(device_id))?;
        Ok(())
    }

    // ── Snapshots ─────────────────────────────────────────────────────────────

    pub fn save_snapshot(&self, snapshot: &DeviceSnapshot) -> Result<(), FleetError> {
        self.put_json(&snapshot_key(&snapshot.device.id), snapshot)
    }

    /// The stored snapshot for `device_id`. A snapshot that no longer decodes
    /// is logged and treated as absent.
    pub fn load_snapshot(&self, device_id: &str) -> Result<Option<DeviceSnapshot>, FleetError> {
        let Some(value) = self.store.get(&snapshot_key(device_id))? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(device_id, error = %e, "stored snapshot unreadable, ignoring");
                Ok(None)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{MemoryKvStore, SqliteKvStore};
    use crate::telemetry_store::TelemetryStore;
    use chrono::Utc;
    use fleetsync_kernel::RangeThreshold;
    use fleetsync_types::{
        DeviceSpec, EnvironmentUpdate, EventPayload, EventTarget, TelemetryEvent,
    };

    fn repo_with(entries: Vec<(&str, Value)>) -> (Arc<MemoryKvStore>, SettingsRepository) {
        let kv = Arc::new(MemoryKvStore::with_entries(entries));
        let repo = SettingsRepository::new(kv.clone());
        (kv, repo)
    }

    #[test]
    fn empty_store_loads_defaults_and_writes_version() {
        let (kv, repo) = repo_with(vec![]);
        let settings = repo.load().unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(kv.get(KEY_SETTINGS_VERSION).unwrap(), Some(json!(2)));
        assert_eq!(kv.get(KEY_SYSTEM_MODE).unwrap(), Some(json!("MANUAL")));
    }

    #[test]
    fn legacy_layout_is_migrated_once() {
        let (kv, repo) = repo_with(vec![
            ("temperature_min", json!("16")),
            ("tempMax", json!(27)),
            ("systemMode", json!("auto")),
            ("robotSettings", json!(r#"{"R1": {"battery_low": 40}}"#)),
            ("selectedDevice", json!("dev-2")),
        ]);
        let settings = repo.load().unwrap();
        assert_eq!(settings.thresholds.temperature.min, 16.0);
        assert_eq!(settings.thresholds.temperature.max, 27.0);
        assert_eq!(settings.system_mode, SystemMode::Automatic);
        assert_eq!(settings.robot_settings["R1"].battery_low, Some(40.0));
        assert_eq!(settings.selected_device.as_deref(), Some("dev-2"));

        assert_eq!(kv.get(KEY_SYSTEM_MODE).unwrap(), Some(json!("AUTOMATIC")));
        assert_eq!(
            kv.get(KEY_THRESHOLDS).unwrap().unwrap()["temperature"]["min"],
            json!(16.0)
        );

        // A second load finds a current record and writes nothing.
        kv.put(KEY_SYSTEM_MODE, &json!("MANUAL")).unwrap();
        let again = repo.load().unwrap();
        assert_eq!(again.system_mode, SystemMode::Manual);
        assert_eq!(kv.get(KEY_SYSTEM_MODE).unwrap(), Some(json!("MANUAL")));
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let (_kv, repo) = repo_with(vec![
            ("settingsVersion", json!(2)),
            ("systemMode", json!("sideways")),
            ("thresholds", json!({"humidity": {"min": "damp"}})),
        ]);
        let settings = repo.load().unwrap();
        assert_eq!(settings.system_mode, SystemMode::Manual);
        assert_eq!(settings.thresholds.humidity, ThresholdSet::default().humidity);
    }

    #[test]
    fn invalid_thresholds_are_not_persisted() {
        let (kv, repo) = repo_with(vec![]);
        let bad = ThresholdSet {
            temperature: RangeThreshold::new(30.0, 20.0, 35.0),
            ..ThresholdSet::default()
        };
        let err = repo.save_thresholds(&bad).unwrap_err();
        let FleetError::Validation(fields) = err else {
            panic!("expected validation error");
        };
        assert!(fields.iter().any(|f| f.field == "temperature.min"));
        assert_eq!(kv.get(KEY_THRESHOLDS).unwrap(), None);

        repo.save_thresholds(&ThresholdSet::default()).unwrap();
        assert!(kv.get(KEY_THRESHOLDS).unwrap().is_some());
    }

    #[test]
    fn individual_keys_round_trip_through_load() {
        let (_kv, repo) = repo_with(vec![]);
        repo.save_system_mode(SystemMode::Automatic).unwrap();
        repo.save_selected_device("dev-3").unwrap();
        let mut robots = BTreeMap::new();
        robots.insert(
            "R9".to_string(),
            RobotSettings {
                alias: Some("Rover".into()),
                ..RobotSettings::default()
            },
        );
        repo.save_robot_settings(&robots).unwrap();

        let settings = repo.load().unwrap();
        assert_eq!(settings.system_mode, SystemMode::Automatic);
        assert_eq!(settings.selected_device.as_deref(), Some("dev-3"));
        assert_eq!(settings.robot_settings["R9"].alias.as_deref(), Some("Rover"));
    }

    #[test]
    fn snapshots_persist_in_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(SqliteKvStore::open(dir.path().join("fleet.db")).unwrap());
        let repo = SettingsRepository::new(kv);

        let mut store = TelemetryStore::with_defaults(&[DeviceSpec::new("dev-1", "Zone A")]);
        store
            .apply(&TelemetryEvent::new(
                "stream/dev-1",
                EventTarget::device("dev-1"),
                Utc::now(),
                EventPayload::Environment(EnvironmentUpdate {
                    temperature: Some(23.5),
                    ..EnvironmentUpdate::default()
                }),
            ))
            .unwrap();
        let snapshot = store.snapshot("dev-1").unwrap();
        repo.save_snapshot(&snapshot).unwrap();

        let loaded = repo.load_snapshot("dev-1").unwrap().unwrap();
        assert_eq!(loaded.device.environment.temperature, Some(23.5));
        assert_eq!(repo.load_snapshot("dev-2").unwrap(), None);

        // Snapshots do not leak into settings.
        assert_eq!(repo.load().unwrap().selected_device, None);
    }

    #[test]
    fn unreadable_snapshot_is_ignored() {
        let (_kv, repo) = repo_with(vec![("snapshot/dev-1", json!({"device": 3}))]);
        assert_eq!(repo.load_snapshot("dev-1").unwrap(), None);
    }
}
