//! `fleetsync-runtime` – assembles the FleetSync engine.
//!
//! ```text
//!  Transport ──per-topic streams──▶ SubscriptionManager ──epoch-tagged──▶ inbox
//!                                                                          │
//!  EngineHandle ──control requests──────────────────────────────▶ reconciliation loop
//!       ▲                                                                  │
//!       └──────── Arc<RwLock<TelemetryStore>> (reads) ◀─── apply ──────────┘
//! ```
//!
//! # Modules
//!
//! - [`engine`] – [`EngineHandle`][engine::EngineHandle]: start-up, state
//!   queries, device selection, settings, commands, shutdown.
//! - `reconciler` – the single-writer loop behind the handle.
//! - [`commands`] – [`CommandPublisher`][commands::CommandPublisher]: operator
//!   commands with room resolution for task assignment.
//! - [`automation`] – [`AutomationPolicy`][automation::AutomationPolicy]: AC
//!   and air-purifier control in `AUTOMATIC` mode.
//! - [`config`] – [`EngineConfig`][config::EngineConfig] in
//!   `~/.fleetsync/config.toml` with `FLEETSYNC_*` overrides.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing] with optional
//!   OTLP export.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use fleetsync_middleware::LoopbackTransport;
//! use fleetsync_runtime::config;
//! use fleetsync_runtime::engine::EngineHandle;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), fleetsync_types::FleetError> {
//! let _guard = fleetsync_runtime::telemetry::init_tracing("fleetsync");
//! let config = config::load()?.unwrap_or_default();
//! let kv = config.storage.open()?;
//! let engine = EngineHandle::start(&config, Arc::new(LoopbackTransport::new()), kv)?;
//!
//! for device in engine.devices() {
//!     println!("{} live={}", device.id, engine.is_device_live(&device.id));
//! }
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod automation;
pub mod commands;
pub mod config;
pub mod engine;
mod reconciler;
pub mod telemetry;

pub use automation::AutomationPolicy;
pub use commands::{CommandPublisher, TaskRequest};
pub use config::EngineConfig;
pub use engine::EngineHandle;
pub use reconciler::{PipelineCounters, PipelineStats};
pub use telemetry::{TracerProviderGuard, init_tracing};
