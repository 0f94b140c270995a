//! Engine configuration – reads/writes `~/.fleetsync/config.toml`.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below.
//!
//! ```toml
//! [transport]
//! url = "ws://broker.local:15674/ws"
//! login = "fleet"
//! passcode = "secret"
//! connect_timeout_secs = 15
//! reconnect_delay_ms = 5000
//!
//! [facility.bounds]
//! north = 37.4225
//! south = 37.4210
//! east = -122.0830
//! west = -122.0855
//!
//! [[devices]]
//! id = "dev-1"
//! zone = "Zone A"
//!
//! [store]
//! liveness_ms = 3000
//! robot_ttl_secs = 600
//!
//! [storage]
//! sqlite_path = "/var/lib/fleetsync/fleet.db"
//! snapshot_interval_secs = 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fleetsync_middleware::Credentials;
use fleetsync_spatial::rooms::default_room_specs;
use fleetsync_spatial::{GeoBounds, PhaseTiming, RoomRegistry, RoomSpec};
use fleetsync_store::{KeyValueStore, SqliteKvStore, StoreOptions};
use fleetsync_types::{DeviceSpec, FleetError};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const CONFIG_DIR: &str = ".fleetsync";
pub const CONFIG_FILE: &str = "config.toml";

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Broker connection settings.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_url")]
    pub url: String,

    #[serde(default)]
    pub login: String,

    /// Stored as plain text; the file is written owner-only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub passcode: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl TransportConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.login.clone(), self.passcode.clone())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            login: String::new(),
            passcode: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("url", &self.url)
            .field("login", &self.login)
            .field(
                "passcode",
                if self.passcode.is_empty() { &"<not set>" } else { &"<redacted>" },
            )
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .finish()
    }
}

/// Facility geometry: the GPS bounding box and the rooms inside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityConfig {
    #[serde(default)]
    pub bounds: GeoBounds,

    #[serde(default = "default_room_specs")]
    pub rooms: Vec<RoomSpec>,
}

impl FacilityConfig {
    pub fn registry(&self) -> RoomRegistry {
        RoomRegistry::new(self.bounds, &self.rooms)
    }
}

impl Default for FacilityConfig {
    fn default() -> Self {
        Self {
            bounds: GeoBounds::default(),
            rooms: default_room_specs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database for settings and snapshots.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// How often the selected device is snapshotted. `0` disables periodic
    /// snapshots; a snapshot is still written when switching devices and on
    /// shutdown.
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

impl StorageConfig {
    pub fn open(&self) -> Result<Arc<dyn KeyValueStore>, FleetError> {
        if let Some(parent) = self.sqlite_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                FleetError::Storage(format!(
                    "Failed to create storage directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let store = SqliteKvStore::open(&self.sqlite_path)?;
        info!(path = %self.sqlite_path.display(), "settings store opened");
        Ok(Arc::new(store))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// EngineConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Persisted engine configuration stored in `~/.fleetsync/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub facility: FacilityConfig,

    /// Fixed devices. Loaded once at start-up.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,

    #[serde(default)]
    pub store: StoreOptions,

    #[serde(default)]
    pub phases: PhaseTiming,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl EngineConfig {
    /// Structural checks the serde layer cannot express.
    pub fn validate(&self) -> Result<(), FleetError> {
        if !self.facility.bounds.is_valid() {
            return Err(FleetError::Config(
                "facility bounds must have north > south and east > west".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(FleetError::Config("device id must not be empty".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(FleetError::Config(format!(
                    "device {} is listed twice",
                    device.id
                )));
            }
        }
        Ok(())
    }
}

fn default_url() -> String {
    "ws://localhost:15674/ws".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_reconnect_delay_ms() -> u64 {
    5_000
}
fn default_snapshot_interval_secs() -> u64 {
    30
}
fn default_sqlite_path() -> PathBuf {
    home_dir().join(CONFIG_DIR).join("fleetsync.db")
}

fn home_dir() -> PathBuf {
    PathBuf::from(
        std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Return the path to `~/.fleetsync/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &Path) -> PathBuf {
    home.join(CONFIG_DIR).join(CONFIG_FILE)
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<EngineConfig>, FleetError> {
    load_from(&config_path())
}

/// Load the config from a specific path and apply environment overrides.
pub fn load_from(path: &Path) -> Result<Option<EngineConfig>, FleetError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        FleetError::Config(format!("Failed to read config at {}: {e}", path.display()))
    })?;
    let mut cfg = parse(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(Some(cfg))
}

pub fn parse(raw: &str) -> Result<EngineConfig, FleetError> {
    toml::from_str(raw).map_err(|e| FleetError::Config(format!("Failed to parse config: {e}")))
}

/// Apply `FLEETSYNC_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `FLEETSYNC_TRANSPORT_URL` | `transport.url` |
/// | `FLEETSYNC_LOGIN` | `transport.login` |
/// | `FLEETSYNC_PASSCODE` | `transport.passcode` |
/// | `FLEETSYNC_CONNECT_TIMEOUT_SECS` | `transport.connect_timeout_secs` |
/// | `FLEETSYNC_RECONNECT_DELAY_MS` | `transport.reconnect_delay_ms` |
/// | `FLEETSYNC_LIVENESS_MS` | `store.liveness_ms` |
/// | `FLEETSYNC_ROBOT_TTL_SECS` | `store.robot_ttl_secs` |
/// | `FLEETSYNC_SQLITE_PATH` | `storage.sqlite_path` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut EngineConfig) {
    if let Ok(v) = std::env::var("FLEETSYNC_TRANSPORT_URL") {
        cfg.transport.url = v;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_LOGIN") {
        cfg.transport.login = v;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_PASSCODE") {
        cfg.transport.passcode = v;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_CONNECT_TIMEOUT_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.transport.connect_timeout_secs = secs;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_RECONNECT_DELAY_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.transport.reconnect_delay_ms = ms;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_LIVENESS_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.store.liveness_ms = ms;
    }
    if let Ok(v) = std::env::var("FLEETSYNC_ROBOT_TTL_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.store.robot_ttl_secs = Some(secs);
    }
    if let Ok(v) = std::env::var("FLEETSYNC_SQLITE_PATH") {
        cfg.storage.sqlite_path = PathBuf::from(v);
    }
}

/// Save the config to disk, creating `~/.fleetsync/` if necessary.
pub fn save(cfg: &EngineConfig) -> Result<(), FleetError> {
    save_to(cfg, &config_path())
}

/// Save the config to a specific path, owner-only on Unix.
pub fn save_to(cfg: &EngineConfig, path: &Path) -> Result<(), FleetError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            FleetError::Config(format!("Failed to create config directory: {e}"))
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(|e| {
                FleetError::Config(format!("Failed to set config directory permissions: {e}"))
            })?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| FleetError::Config(format!("Failed to serialize config: {e}")))?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| {
                FleetError::Config(format!("Failed to write config at {}: {e}", path.display()))
            })?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| {
        FleetError::Config(format!("Failed to write config at {}: {e}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_passcode() {
        let mut cfg = EngineConfig::default();
        cfg.transport.passcode = "hunter2".to_string();
        let debug_str = format!("{cfg:?}");
        assert!(!debug_str.contains("hunter2"), "passcode must not appear in debug output");
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_passcode() {
        let debug_str = format!("{:?}", EngineConfig::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.transport.connect_timeout_secs, 15);
        assert_eq!(cfg.transport.reconnect_delay_ms, 5_000);
        assert_eq!(cfg.store.liveness_ms, 3_000);
        assert_eq!(cfg.store.alert_capacity, 50);
        assert_eq!(cfg.store.robot_ttl_secs, None);
        assert_eq!(cfg.phases, PhaseTiming::default());
        assert_eq!(cfg.facility.rooms.len(), default_room_specs().len());
        assert!(cfg.devices.is_empty());
    }

    #[test]
    fn parses_sections() {
        let cfg = parse(
            r#"
            [transport]
            url = "ws://broker:15674/ws"
            login = "fleet"
            passcode = "pw"
            reconnect_delay_ms = 250

            [[devices]]
            id = "dev-1"
            zone = "Zone A"

            [[devices]]
            id = "dev-2"
            zone = "Zone B"

            [store]
            robot_ttl_secs = 600

            [phases]
            pickup_timeout_ms = 90000

            [[facility.rooms]]
            name = "Bay"
            x = 10
            y = 10
            width = 20
            height = 20
            "#,
        )
        .unwrap();
        assert_eq!(cfg.transport.url, "ws://broker:15674/ws");
        assert_eq!(cfg.transport.reconnect_delay(), Duration::from_millis(250));
        assert_eq!(cfg.transport.connect_timeout(), Duration::from_secs(15));
        assert_eq!(cfg.transport.credentials(), Credentials::new("fleet", "pw"));
        assert_eq!(cfg.devices[1], DeviceSpec::new("dev-2", "Zone B"));
        assert_eq!(cfg.store.robot_ttl_secs, Some(600));
        assert_eq!(cfg.store.liveness_ms, 3_000);
        assert_eq!(cfg.phases.pickup_timeout_ms, 90_000);
        assert_eq!(cfg.phases.pickup_dwell_ms, 5_000);
        assert!(cfg.facility.registry().resolve("bay").is_some());
        cfg.validate().unwrap();
    }

    #[test]
    fn documented_sample_uses_default_facility() {
        let sample: String = include_str!("config.rs")
            .lines()
            .skip_while(|l| *l != "//! ```toml")
            .skip(1)
            .take_while(|l| *l != "//! ```")
            .map(|l| l.trim_start_matches("//!").trim_start())
            .collect::<Vec<_>>()
            .join("\n");
        let cfg = parse(&sample).unwrap();
        assert_eq!(cfg.facility.bounds, GeoBounds::default_facility());
        let storage = cfg.facility.registry().resolve("Storage").unwrap().center;
        let expected = RoomRegistry::default_facility().resolve("Storage").unwrap().center;
        assert_eq!(storage, expected);
        cfg.validate().unwrap();
    }

    #[test]
    fn duplicate_devices_are_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.devices = vec![DeviceSpec::new("dev-1", "A"), DeviceSpec::new("dev-1", "B")];
        assert!(matches!(cfg.validate(), Err(FleetError::Config(_))));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(parse("[transport"), Err(FleetError::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(dir.path());

        save_to(&EngineConfig::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(dir.path());

        let mut cfg = EngineConfig::default();
        cfg.devices.push(DeviceSpec::new("dev-1", "Zone A"));
        cfg.transport.passcode = "pw".to_string();
        cfg.storage.sqlite_path = dir.path().join("fleet.db");
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.devices, cfg.devices);
        assert_eq!(loaded.transport.passcode, "pw");
        assert_eq!(loaded.facility, cfg.facility);
        assert_eq!(loaded.storage.sqlite_path, cfg.storage.sqlite_path);
    }

    #[test]
    fn config_path_points_to_fleetsync_dir() {
        let p = config_path_for_home(Path::new("/home/operator"));
        assert!(p.to_string_lossy().contains(".fleetsync"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(dir.path());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn storage_opens_sqlite_in_nested_dir() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let storage = StorageConfig {
            sqlite_path: dir.path().join("state").join("fleet.db"),
            ..StorageConfig::default()
        };
        let kv = storage.open().expect("open");
        kv.put("systemMode", &serde_json::json!("MANUAL")).unwrap();
        assert!(storage.sqlite_path.exists());
    }

    #[test]
    fn env_overrides() {
        // SAFETY: single-threaded test; these variables are read nowhere else.
        unsafe {
            std::env::set_var("FLEETSYNC_RECONNECT_DELAY_MS", "1200");
            std::env::set_var("FLEETSYNC_ROBOT_TTL_SECS", "not-a-number");
            std::env::set_var("FLEETSYNC_LOGIN", "from-env");
        }
        let mut cfg = EngineConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.transport.reconnect_delay_ms, 1_200);
        assert_eq!(cfg.store.robot_ttl_secs, None);
        assert_eq!(cfg.transport.login, "from-env");
        unsafe {
            std::env::remove_var("FLEETSYNC_RECONNECT_DELAY_MS");
            std::env::remove_var("FLEETSYNC_ROBOT_TTL_SECS");
            std::env::remove_var("FLEETSYNC_LOGIN");
        }
    }
}
