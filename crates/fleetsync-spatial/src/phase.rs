//! Fallback phase state machine.
//!
//! Producers normally report task phases explicitly. When they do not, the
//! phase is advanced from geofence dwell, geofence exit and elapsed time:
//!
//! ```text
//! ASSIGNED ──position known, grace elapsed──▶ EN_ROUTE_TO_SOURCE
//! EN_ROUTE_TO_SOURCE ──dwell in source──▶ PICKING_UP
//! PICKING_UP ──leave source │ pickup timeout──▶ EN_ROUTE_TO_DESTINATION
//! EN_ROUTE_TO_DESTINATION ──dwell in destination──▶ DELIVERING
//! DELIVERING ──leave destination │ delivery timeout──▶ COMPLETED
//! ```
//!
//! `COMPLETED` and `FAILED` never advance.

use chrono::{DateTime, Utc};
use fleetsync_types::{GpsPoint, Task, TaskPhase};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::progress::{at_destination, at_source, compute_phase_progress, source_point};
use crate::rooms::RoomRegistry;

/// Timers driving the fallback state machine, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseTiming {
    pub assigned_grace_ms: u64,
    pub pickup_dwell_ms: u64,
    pub pickup_timeout_ms: u64,
    pub dropoff_dwell_ms: u64,
    pub delivery_timeout_ms: u64,
}

impl Default for PhaseTiming {
    fn default() -> Self {
        Self {
            assigned_grace_ms: 3_000,
            pickup_dwell_ms: 5_000,
            pickup_timeout_ms: 120_000,
            dropoff_dwell_ms: 5_000,
            delivery_timeout_ms: 60_000,
        }
    }
}

/// Progress a task starts at when it enters `phase`.
pub fn phase_floor(phase: TaskPhase) -> u8 {
    match phase {
        TaskPhase::Assigned | TaskPhase::EnRouteToSource => 0,
        TaskPhase::PickingUp => 47,
        TaskPhase::EnRouteToDestination => 50,
        TaskPhase::Delivering => 95,
        TaskPhase::Completed => 100,
        TaskPhase::Failed => 0,
    }
}

fn elapsed_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    u64::try_from((now - since).num_milliseconds()).unwrap_or(0)
}

/// Update the geofence-entry timestamp for the geofence that matters in the
/// task's current phase. Returns whether the robot is inside it.
///
/// An unknown position leaves the timestamp untouched.
pub fn track_geofence(
    task: &mut Task,
    current: Option<GpsPoint>,
    rooms: &RoomRegistry,
    now: DateTime<Utc>,
) -> bool {
    let Some(p) = current.filter(GpsPoint::is_valid) else {
        return task.geofence_entered_at.is_some();
    };
    let inside = match task.phase {
        TaskPhase::EnRouteToSource | TaskPhase::PickingUp => at_source(task, p, rooms),
        TaskPhase::EnRouteToDestination | TaskPhase::Delivering => {
            at_destination(task, p, rooms)
        }
        _ => false,
    };
    if inside {
        task.geofence_entered_at.get_or_insert(now);
    } else {
        task.geofence_entered_at = None;
    }
    inside
}

/// Decide whether the fallback machine moves `task` on. Pure: the caller
/// applies the result with [`enter_phase`].
pub fn advance_phase(
    task: &Task,
    current: Option<GpsPoint>,
    rooms: &RoomRegistry,
    now: DateTime<Utc>,
    timing: &PhaseTiming,
) -> Option<TaskPhase> {
    if task.phase.is_terminal() {
        return None;
    }
    let position = current.filter(GpsPoint::is_valid);
    let in_phase = elapsed_ms(task.phase_started_at, now);
    let dwelled =
        |dwell: u64| task.geofence_entered_at.is_some_and(|t| elapsed_ms(t, now) >= dwell);

    match task.phase {
        TaskPhase::Assigned => (position.is_some() && in_phase >= timing.assigned_grace_ms)
            .then_some(TaskPhase::EnRouteToSource),
        TaskPhase::EnRouteToSource => {
            let inside = position.is_some_and(|p| at_source(task, p, rooms));
            (inside && dwelled(timing.pickup_dwell_ms)).then_some(TaskPhase::PickingUp)
        }
        TaskPhase::PickingUp => {
            let left = source_point(task, rooms).is_some()
                && position.is_some_and(|p| !at_source(task, p, rooms));
            (left || in_phase >= timing.pickup_timeout_ms)
                .then_some(TaskPhase::EnRouteToDestination)
        }
        TaskPhase::EnRouteToDestination => {
            let inside = position.is_some_and(|p| at_destination(task, p, rooms));
            (inside && dwelled(timing.dropoff_dwell_ms)).then_some(TaskPhase::Delivering)
        }
        TaskPhase::Delivering => {
            let left = position.is_some_and(|p| !at_destination(task, p, rooms));
            (left || in_phase >= timing.delivery_timeout_ms).then_some(TaskPhase::Completed)
        }
        TaskPhase::Completed | TaskPhase::Failed => None,
    }
}

/// Move `task` into `phase`, resetting the per-phase bookkeeping. Returns
/// `false` when the task is already in that phase or has finished.
pub fn enter_phase(
    task: &mut Task,
    phase: TaskPhase,
    now: DateTime<Utc>,
    current: Option<GpsPoint>,
) -> bool {
    if task.phase == phase || task.phase.is_terminal() {
        return false;
    }
    debug!(task_id = %task.id, from = %task.phase, to = %phase, "task phase change");
    task.phase = phase;
    task.phase_started_at = now;
    task.updated_at = now;
    task.geofence_entered_at = None;
    task.leg_origin = current.filter(GpsPoint::is_valid);
    if phase != TaskPhase::Failed {
        task.progress = phase_floor(phase);
    }
    true
}

/// Recompute progress, never letting it fall within a phase. `FAILED` is
/// frozen.
pub fn refresh_progress(task: &mut Task, current: Option<GpsPoint>, rooms: &RoomRegistry) {
    if task.phase == TaskPhase::Failed {
        return;
    }
    let computed = compute_phase_progress(task, current, rooms);
    task.progress = task.progress.max(computed);
}

/// One full evaluation step: geofence bookkeeping, at most one fallback
/// transition, then progress. Returns the phase entered, if any.
pub fn reconcile_task(
    task: &mut Task,
    current: Option<GpsPoint>,
    rooms: &RoomRegistry,
    now: DateTime<Utc>,
    timing: &PhaseTiming,
) -> Option<TaskPhase> {
    if task.phase.is_terminal() {
        return None;
    }
    track_geofence(task, current, rooms, now);
    let next = advance_phase(task, current, rooms, now, timing);
    if let Some(phase) = next {
        enter_phase(task, phase, now, current);
        track_geofence(task, current, rooms, now);
    }
    refresh_progress(task, current, rooms);
    next
}
