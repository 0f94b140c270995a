//! `fleetsync-store` – canonical state and persistence.
//!
//! # Modules
//!
//! - [`telemetry_store`] – [`TelemetryStore`][telemetry_store::TelemetryStore]:
//!   per-device and per-robot records, field-level merge, alerting,
//!   liveness, task progress, warm-start snapshots.
//! - [`kv`] – the [`KeyValueStore`][kv::KeyValueStore] contract with SQLite
//!   and in-memory implementations.
//! - [`settings_repo`] – [`SettingsRepository`][settings_repo::SettingsRepository]:
//!   versioned settings and snapshots on top of a key-value store.

pub mod kv;
pub mod settings_repo;
pub mod telemetry_store;

pub use kv::{KeyValueStore, KvError, MemoryKvStore, SqliteKvStore};
pub use settings_repo::SettingsRepository;
pub use telemetry_store::{
    ApplyOutcome, DeviceSnapshot, HydrateOutcome, PhaseChange, RobotRef, StoreOptions,
    TelemetryStore,
};
