//! Delivery-task progress.
//!
//! Progress is a pure function of the task's phase, its endpoints and the
//! robot's current position:
//!
//! | Phase                     | Progress                                   |
//! |---------------------------|--------------------------------------------|
//! | `ASSIGNED`                | 0                                          |
//! | `EN_ROUTE_TO_SOURCE`      | 0–43 interpolated, 44 at the source        |
//! | `PICKING_UP`              | 47                                         |
//! | `EN_ROUTE_TO_DESTINATION` | 50–87 interpolated, 88 at the destination  |
//! | `DELIVERING`              | 95                                         |
//! | `COMPLETED`               | 100                                        |
//! | `FAILED`                  | last known progress                        |
//!
//! Interpolation is `1 − remaining / leg_distance` on great-circle distance.
//! An unknown or degenerate leg (< 5 m) uses a 300 m facility-scale leg
//! instead. With no usable position the result is the leg floor plus 2, so
//! an indicator never looks stuck at the previous phase.

use fleetsync_types::{GpsPoint, Task, TaskPhase};

use crate::geo::distance_between;
use crate::rooms::RoomRegistry;

/// Substitute leg length when the real one is unknown or degenerate.
pub const FALLBACK_LEG_M: f64 = 300.0;
/// Legs shorter than this are treated as unknown.
pub const MIN_LEG_M: f64 = 5.0;
/// A robot this close to an endpoint counts as arrived, even without a room.
pub const ARRIVAL_RADIUS_M: f64 = 5.0;

/// Fixed progress bands of an interpolated leg.
#[derive(Debug, Clone, Copy)]
struct LegBand {
    floor: u8,
    span: u8,
    cap: u8,
    arrived: u8,
}

const SOURCE_LEG: LegBand = LegBand {
    floor: 0,
    span: 45,
    cap: 43,
    arrived: 44,
};

const DESTINATION_LEG: LegBand = LegBand {
    floor: 50,
    span: 40,
    cap: 87,
    arrived: 88,
};

/// Pickup point: explicit coordinates if valid, else the source room centre.
pub fn source_point(task: &Task, rooms: &RoomRegistry) -> Option<GpsPoint> {
    endpoint(task.source_gps, &task.source, rooms)
}

/// Drop-off point: explicit coordinates if valid, else the destination room
/// centre.
pub fn destination_point(task: &Task, rooms: &RoomRegistry) -> Option<GpsPoint> {
    endpoint(task.destination_gps, &task.destination, rooms)
}

fn endpoint(explicit: Option<GpsPoint>, name: &str, rooms: &RoomRegistry) -> Option<GpsPoint> {
    explicit
        .filter(GpsPoint::is_valid)
        .or_else(|| rooms.resolve(name).map(|r| r.center))
}

/// `true` when `current` is inside the source geofence.
pub fn at_source(task: &Task, current: GpsPoint, rooms: &RoomRegistry) -> bool {
    at_endpoint(&task.source, source_point(task, rooms), current, rooms)
}

/// `true` when `current` is inside the destination geofence.
pub fn at_destination(task: &Task, current: GpsPoint, rooms: &RoomRegistry) -> bool {
    at_endpoint(
        &task.destination,
        destination_point(task, rooms),
        current,
        rooms,
    )
}

fn at_endpoint(
    name: &str,
    point: Option<GpsPoint>,
    current: GpsPoint,
    rooms: &RoomRegistry,
) -> bool {
    if rooms.is_inside(current.lat, current.lng, name) {
        return true;
    }
    point.is_some_and(|p| distance_between(current, p) < ARRIVAL_RADIUS_M)
}

/// Compute integer progress (0–100) for `task` with the robot at `current`.
///
/// Never panics; every degenerate input produces a plausible value.
pub fn compute_phase_progress(
    task: &Task,
    current: Option<GpsPoint>,
    rooms: &RoomRegistry,
) -> u8 {
    match task.phase {
        TaskPhase::Assigned => 0,
        TaskPhase::EnRouteToSource => leg_progress(
            SOURCE_LEG,
            task.leg_origin,
            source_point(task, rooms),
            current,
            |p| at_source(task, p, rooms),
        ),
        TaskPhase::PickingUp => 47,
        TaskPhase::EnRouteToDestination => leg_progress(
            DESTINATION_LEG,
            source_point(task, rooms),
            destination_point(task, rooms),
            current,
            |p| at_destination(task, p, rooms),
        ),
        TaskPhase::Delivering => 95,
        TaskPhase::Completed => 100,
        TaskPhase::Failed => task.progress.min(100),
    }
}

fn leg_progress(
    band: LegBand,
    origin: Option<GpsPoint>,
    target: Option<GpsPoint>,
    current: Option<GpsPoint>,
    arrived: impl Fn(GpsPoint) -> bool,
) -> u8 {
    let degraded = band.floor + 2;
    let Some(current) = current.filter(GpsPoint::is_valid) else {
        return degraded;
    };
    if arrived(current) {
        return band.arrived;
    }
    let Some(target) = target else {
        return degraded;
    };

    let remaining = distance_between(current, target);
    if !remaining.is_finite() {
        return degraded;
    }
    if remaining < MIN_LEG_M {
        return band.arrived;
    }

    let leg = origin
        .map(|o| distance_between(o, target))
        .filter(|d| d.is_finite() && *d >= MIN_LEG_M)
        .unwrap_or(FALLBACK_LEG_M);
    let fraction = (1.0 - remaining / leg).clamp(0.0, 1.0);
    let interpolated = band.floor as f64 + (band.span as f64 * fraction).round();
    (interpolated as u8).min(band.cap)
}
