//! `fleetsync-spatial` – facility geometry and task progress.
//!
//! Pure functions over the facility's coordinate systems. Nothing in this
//! crate holds mutable state apart from the task-id counter.
//!
//! # Modules
//!
//! - [`geo`] – [`GeoBounds`][geo::GeoBounds]: affine mapping between the
//!   facility GPS bounding box and 0–100 percent space, plus
//!   [`haversine_distance`][geo::haversine_distance].
//! - [`rooms`] – [`RoomRegistry`][rooms::RoomRegistry]: named rectangular
//!   geofences with forgiving name lookup and occupancy queries.
//! - [`progress`] – [`compute_phase_progress`][progress::compute_phase_progress]:
//!   deterministic 0–100 progress for a delivery task.
//! - [`phase`] – [`advance_phase`][phase::advance_phase]: geofence and
//!   elapsed-time fallback state machine for task phases.
//! - [`task_id`] – [`generate_task_id`][task_id::generate_task_id].

pub mod geo;
pub mod phase;
pub mod progress;
pub mod rooms;
pub mod task_id;

pub use geo::{GeoBounds, haversine_distance};
pub use phase::{
    PhaseTiming, advance_phase, enter_phase, reconcile_task, refresh_progress, track_geofence,
};
pub use progress::compute_phase_progress;
pub use rooms::{PercentRect, Room, RoomRegistry, RoomSpec};
pub use task_id::generate_task_id;
