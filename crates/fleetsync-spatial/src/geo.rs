//! Facility coordinate systems.
//!
//! The facility is modelled as an axis-aligned GPS rectangle. Percent space
//! runs `x` from the west edge (0) to the east edge (100) and `y` from the
//! north edge (0) to the south edge (100), matching the orientation of a
//! floor-plan image.
//!
//! # Example
//!
//! ```rust
//! use fleetsync_spatial::geo::GeoBounds;
//!
//! let bounds = GeoBounds::default_facility();
//! let p = bounds.percent_to_gps(40.0, 40.0);
//! assert!((p.lat - 37.4219).abs() < 1e-9);
//! assert!((p.lng - -122.0845).abs() < 1e-9);
//!
//! let (x, y) = bounds.gps_to_percent(p.lat, p.lng);
//! assert!((x - 40.0).abs() < 1e-6 && (y - 40.0).abs() < 1e-6);
//! ```

use fleetsync_types::GpsPoint;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by [`haversine_distance`], in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

// ────────────────────────────────────────────────────────────────────────────
// GeoBounds
// ────────────────────────────────────────────────────────────────────────────

/// GPS bounding box of the facility, in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl Default for GeoBounds {
    fn default() -> Self {
        Self::default_facility()
    }
}

impl GeoBounds {
    pub fn new(north: f64, south: f64, east: f64, west: f64) -> Self {
        Self {
            north,
            south,
            east,
            west,
        }
    }

    /// Bounds of the reference facility the default room registry is laid
    /// out on.
    pub fn default_facility() -> Self {
        Self::new(37.4225, 37.4210, -122.0830, -122.0855)
    }

    fn lat_span(&self) -> f64 {
        self.north - self.south
    }

    fn lng_span(&self) -> f64 {
        self.east - self.west
    }

    /// `true` when the box has a positive, finite extent on both axes.
    pub fn is_valid(&self) -> bool {
        self.lat_span().is_finite()
            && self.lng_span().is_finite()
            && self.lat_span() > 0.0
            && self.lng_span() > 0.0
    }

    /// Map a percent coordinate onto GPS. Inputs outside `0..=100` are
    /// clamped to the facility edge; NaN is treated as 0.
    pub fn percent_to_gps(&self, x_pct: f64, y_pct: f64) -> GpsPoint {
        let x = clamp_percent(x_pct);
        let y = clamp_percent(y_pct);
        GpsPoint::new(
            self.north - (y / 100.0) * self.lat_span(),
            self.west + (x / 100.0) * self.lng_span(),
        )
    }

    /// Map a GPS coordinate onto percent space, returning `(x, y)`. Points
    /// outside the box are clamped to its edge. A degenerate box maps every
    /// point to `(0, 0)`.
    pub fn gps_to_percent(&self, lat: f64, lng: f64) -> (f64, f64) {
        if !self.is_valid() {
            return (0.0, 0.0);
        }
        let x = (lng - self.west) / self.lng_span() * 100.0;
        let y = (self.north - lat) / self.lat_span() * 100.0;
        (clamp_percent(x), clamp_percent(y))
    }

    /// `true` when the point lies inside the closed box.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        lat >= self.south && lat <= self.north && lng >= self.west && lng <= self.east
    }
}

fn clamp_percent(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 100.0) }
}

// ────────────────────────────────────────────────────────────────────────────
// Distance
// ────────────────────────────────────────────────────────────────────────────

/// Great-circle distance between two coordinates, in metres.
///
/// Symmetric, and exactly zero for identical points. Non-finite inputs
/// yield NaN, which callers treat as "unknown".
pub fn haversine_distance(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lng2 - lng1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// [`haversine_distance`] over two [`GpsPoint`]s.
pub fn distance_between(a: GpsPoint, b: GpsPoint) -> f64 {
    haversine_distance(a.lat, a.lng, b.lat, b.lng)
}
