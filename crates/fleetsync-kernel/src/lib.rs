//! `fleetsync-kernel` – classification and policy.
//!
//! Everything that decides whether a reading is healthy lives here, so that
//! every consumer agrees on it.
//!
//! # Modules
//!
//! - [`thresholds`] – [`ThresholdResolver`][thresholds::ThresholdResolver]:
//!   the single source of truth for metric severity and robot health, and
//!   [`resolve_thresholds`][thresholds::resolve_thresholds] for turning a
//!   loosely shaped settings object into a complete
//!   [`ThresholdSet`][thresholds::ThresholdSet].
//! - [`settings`] – versioned [`Settings`][settings::Settings] with a single
//!   [`migrate_settings`][settings::migrate_settings] step from legacy shapes,
//!   and [`validate_thresholds`][settings::validate_thresholds] for operator
//!   input.
//! - [`liveness`] – [`Liveness`][liveness::Liveness]: the freshness rule
//!   (`now − last_update < 3000 ms` by default).
//! - [`alerts`] – [`AlertLog`][alerts::AlertLog]: bounded, deduplicating
//!   alert history.

pub mod alerts;
pub mod liveness;
pub mod settings;
pub mod thresholds;

pub use alerts::AlertLog;
pub use liveness::Liveness;
pub use settings::{
    Migration, RobotSettings, SETTINGS_SCHEMA_VERSION, Settings, SystemMode, migrate_settings,
    validate_thresholds,
};
pub use thresholds::{
    BatteryThreshold, HealthLabel, Metric, RangeThreshold, RobotHealth, ThresholdResolver,
    ThresholdSet, resolve_thresholds,
};
