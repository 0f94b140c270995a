//! Room registry and rectangular geofences.
//!
//! Rooms are declared as rectangles in percent space and projected once onto
//! GPS through the facility [`GeoBounds`]. The registry is immutable after
//! construction; rectangles are assumed not to overlap, so occupancy lookups
//! return the first match in definition order.
//!
//! # Example
//!
//! ```rust
//! use fleetsync_spatial::rooms::RoomRegistry;
//!
//! let rooms = RoomRegistry::default_facility();
//! let storage = rooms.resolve("storage").unwrap();
//! assert!(rooms.is_inside(storage.center.lat, storage.center.lng, "STORAGE"));
//! assert_eq!(rooms.resolve("clean-room_b").unwrap().name, "Cleanroom B");
//! ```

use fleetsync_types::GpsPoint;
use serde::{Deserialize, Serialize};

use crate::geo::GeoBounds;

/// Axis-aligned rectangle in facility percent space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl PercentRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Declarative room entry, as read from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSpec {
    pub name: String,
    #[serde(flatten)]
    pub rect: PercentRect,
}

/// A named geofence.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    /// Kebab-case slug derived from the name.
    pub id: String,
    pub name: String,
    pub rect: PercentRect,
    pub bounds: GeoBounds,
    pub center: GpsPoint,
}

impl Room {
    fn project(name: &str, rect: PercentRect, facility: &GeoBounds) -> Self {
        let nw = facility.percent_to_gps(rect.x, rect.y);
        let se = facility.percent_to_gps(rect.x + rect.width, rect.y + rect.height);
        let center =
            facility.percent_to_gps(rect.x + rect.width / 2.0, rect.y + rect.height / 2.0);
        Self {
            id: slug(name),
            name: name.to_string(),
            rect,
            bounds: GeoBounds::new(nw.lat, se.lat, se.lng, nw.lng),
            center,
        }
    }

    /// `true` when the point is inside the closed GPS rectangle.
    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        self.bounds.contains(lat, lng)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// RoomRegistry
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RoomRegistry {
    facility: GeoBounds,
    rooms: Vec<Room>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::default_facility()
    }
}

impl RoomRegistry {
    /// Build a registry by projecting each room onto `facility`.
    pub fn new(facility: GeoBounds, specs: &[RoomSpec]) -> Self {
        let rooms = specs
            .iter()
            .map(|s| Room::project(&s.name, s.rect, &facility))
            .collect();
        Self { facility, rooms }
    }

    /// The reference facility layout.
    pub fn default_facility() -> Self {
        Self::new(GeoBounds::default_facility(), &default_room_specs())
    }

    pub fn facility(&self) -> &GeoBounds {
        &self.facility
    }

    pub fn rooms(&self) -> &[Room] {
        &self.rooms
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    /// Look a room up by a loosely spelled name.
    ///
    /// Case, whitespace, `-` and `_` are ignored. An exact match wins; failing
    /// that, the first room (in definition order) whose name contains the
    /// query or is contained in it.
    pub fn resolve(&self, name: &str) -> Option<&Room> {
        let query = normalize(name);
        if query.is_empty() {
            return None;
        }
        let normalized: Vec<String> = self.rooms.iter().map(|r| normalize(&r.name)).collect();
        if let Some(i) = normalized.iter().position(|n| *n == query) {
            return self.rooms.get(i);
        }
        normalized
            .iter()
            .position(|n| n.contains(&query) || query.contains(n.as_str()))
            .and_then(|i| self.rooms.get(i))
    }

    /// `true` iff the point lies inside the named room. Unknown rooms are
    /// never occupied.
    pub fn is_inside(&self, lat: f64, lng: f64, room_name: &str) -> bool {
        self.resolve(room_name)
            .is_some_and(|room| room.contains(lat, lng))
    }

    /// The room containing the point, if any.
    pub fn room_at(&self, lat: f64, lng: f64) -> Option<&Room> {
        self.rooms.iter().find(|r| r.contains(lat, lng))
    }
}

/// Room layout of the reference facility, in percent space.
pub fn default_room_specs() -> Vec<RoomSpec> {
    [
        ("Cleanroom A", PercentRect::new(30.0, 30.0, 20.0, 20.0)),
        ("Storage", PercentRect::new(60.0, 52.0, 16.0, 16.0)),
        ("Cleanroom B", PercentRect::new(5.0, 30.0, 20.0, 20.0)),
        ("Lab 1", PercentRect::new(5.0, 60.0, 20.0, 30.0)),
        ("Office", PercentRect::new(30.0, 70.0, 20.0, 20.0)),
        ("Loading Dock", PercentRect::new(80.0, 5.0, 18.0, 20.0)),
        ("Charging Station", PercentRect::new(80.0, 75.0, 18.0, 20.0)),
    ]
    .into_iter()
    .map(|(name, rect)| RoomSpec {
        name: name.to_string(),
        rect,
    })
    .collect()
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn slug(name: &str) -> String {
    name.split(|c: char| c.is_whitespace() || c == '_' || c == '-')
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_reference_centres() {
        let rooms = RoomRegistry::default_facility();
        let a = rooms.resolve("Cleanroom A").unwrap();
        assert!((a.center.lat - 37.4219).abs() < 1e-9);
        assert!((a.center.lng - -122.0845).abs() < 1e-9);
        let s = rooms.resolve("Storage").unwrap();
        assert!((s.center.lat - 37.4216).abs() < 1e-9);
        assert!((s.center.lng - -122.0838).abs() < 1e-9);
    }

    #[test]
    fn resolve_ignores_case_space_hyphen_underscore() {
        let rooms = RoomRegistry::default_facility();
        for q in ["cleanroom a", "CLEANROOM-A", " clean_room_a ", "CleanroomA"] {
            assert_eq!(rooms.resolve(q).unwrap().id, "cleanroom-a", "query {q:?}");
        }
    }

    #[test]
    fn resolve_prefers_exact_over_substring() {
        let rooms = RoomRegistry::default_facility();
        // A bare "cleanroom" is ambiguous and falls to definition order.
        assert_eq!(rooms.resolve("Cleanroom B").unwrap().name, "Cleanroom B");
        assert_eq!(rooms.resolve("cleanroom").unwrap().name, "Cleanroom A");
    }

    #[test]
    fn resolve_substring_either_direction() {
        let rooms = RoomRegistry::default_facility();
        assert_eq!(rooms.resolve("lab").unwrap().name, "Lab 1");
        assert_eq!(rooms.resolve("Storage Room 2").unwrap().name, "Storage");
        assert_eq!(rooms.resolve("dock").unwrap().name, "Loading Dock");
    }

    #[test]
    fn resolve_unknown_or_empty_is_none() {
        let rooms = RoomRegistry::default_facility();
        assert!(rooms.resolve("cafeteria").is_none());
        assert!(rooms.resolve("").is_none());
        assert!(rooms.resolve(" - _ ").is_none());
    }

    #[test]
    fn geofence_is_closed_rectangle() {
        let rooms = RoomRegistry::default_facility();
        let a = rooms.resolve("Cleanroom A").unwrap();
        assert!(rooms.is_inside(a.bounds.north, a.bounds.west, "Cleanroom A"));
        assert!(rooms.is_inside(a.bounds.south, a.bounds.east, "Cleanroom A"));
        assert!(!rooms.is_inside(a.bounds.north + 1e-6, a.center.lng, "Cleanroom A"));
        assert!(!rooms.is_inside(a.center.lat, a.center.lng, "Storage"));
        assert!(!rooms.is_inside(a.center.lat, a.center.lng, "nowhere"));
    }

    #[test]
    fn room_at_finds_occupied_room() {
        let rooms = RoomRegistry::default_facility();
        let s = rooms.resolve("storage").unwrap().center;
        assert_eq!(rooms.room_at(s.lat, s.lng).unwrap().name, "Storage");
        // Facility midpoint between Cleanroom A and Storage is a corridor.
        let corridor = rooms.facility().percent_to_gps(54.0, 50.0);
        assert!(rooms.room_at(corridor.lat, corridor.lng).is_none());
    }

    #[test]
    fn default_rooms_do_not_overlap() {
        let rooms = RoomRegistry::default_facility();
        let all = rooms.rooms();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                let disjoint = a.rect.x + a.rect.width <= b.rect.x
                    || b.rect.x + b.rect.width <= a.rect.x
                    || a.rect.y + a.rect.height <= b.rect.y
                    || b.rect.y + b.rect.height <= a.rect.y;
                assert!(disjoint, "{} overlaps {}", a.name, b.name);
            }
        }
    }
}
