//! World data model (spec.md §3) and C13 — Place index & location ops.
//!
//! Plain serde data types in the teacher's `core/src/models.rs` style
//! (small structs, no behavior baked into derives), with the reverse-index
//! and distance math as free functions operating on them — mirroring how
//! `core/src/environment_context.rs` builds a read model over otherwise
//! inert data.

use std::collections::HashMap;
use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilePos {
    pub x: i32,
    pub y: i32,
}

impl TilePos {
    pub fn new(x: i32, y: i32) -> Self {
        TilePos { x, y }
    }

    pub fn euclidean(self, other: TilePos) -> f64 {
        let dx = (self.x - other.x) as f64;
        let dy = (self.y - other.y) as f64;
        (dx * dx + dy * dy).sqrt()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileGrid {
    pub width: u32,
    pub height: u32,
    pub default_entry: TilePos,
}

impl TileGrid {
    pub fn in_bounds(&self, pos: TilePos) -> bool {
        pos.x >= 0 && pos.y >= 0 && (pos.x as u32) < self.width && (pos.y as u32) < self.height
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedThing {
    pub id: String,
    pub tile_position: TilePos,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaceContents {
    #[serde(default)]
    pub npcs_present: Vec<PlacedThing>,
    #[serde(default)]
    pub actors_present: Vec<PlacedThing>,
    #[serde(default)]
    pub items_on_ground: Vec<PlacedThing>,
    #[serde(default)]
    pub features: Vec<PlacedThing>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub direction: String,
    pub to_place_id: String,
    pub travel_time: u32,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Environment {
    pub lighting: f32,
    pub terrain: Terrain,
    pub cover_available: bool,
    pub temperature_offset: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Terrain {
    #[default]
    Normal,
    Rough,
    Water,
    Hazard,
}

/// A bounded tile-grid sub-area of a region (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Place {
    pub id: String,
    pub tile_grid: TileGrid,
    #[serde(default)]
    pub contents: PlaceContents,
    #[serde(default)]
    pub connections: Vec<Connection>,
    pub environment: Environment,
    /// Whether this place tolerates multiple occupants per tile.
    #[serde(default)]
    pub allows_stacking: bool,
}

impl Place {
    /// All occupied tiles (NPCs + actors), optionally excluding one id —
    /// used by C11's pathfinding to treat "everyone but the mover" as
    /// walls.
    pub fn occupied_tiles(&self, excluding: Option<&str>) -> HashSet<TilePos> {
        self.contents
            .npcs_present
            .iter()
            .chain(self.contents.actors_present.iter())
            .filter(|p| excluding != Some(p.id.as_str()))
            .map(|p| p.tile_position)
            .collect()
    }

    pub fn feature_tiles(&self) -> HashSet<TilePos> {
        self.contents.features.iter().map(|f| f.tile_position).collect()
    }

    /// Recomputes occupancy invariants are upheld elsewhere; this just
    /// checks whether a tile currently hosts an occupant (respecting
    /// `allows_stacking`).
    pub fn is_tile_free(&self, pos: TilePos, excluding: Option<&str>) -> bool {
        if self.allows_stacking {
            return true;
        }
        !self.occupied_tiles(excluding).contains(&pos)
    }
}

/// `{world_tile, region_tile, place_id, tile, elevation}` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLocation {
    pub world_tile: TilePos,
    pub region_tile: TilePos,
    #[serde(default)]
    pub place_id: Option<String>,
    pub tile: TilePos,
    #[serde(default)]
    pub elevation: f32,
}

/// A target candidate returned by [`PlaceIndex::available_targets`].
#[derive(Debug, Clone)]
pub struct TargetCandidate {
    pub r#ref: String,
    pub name: String,
    pub kind: EntityKind,
    pub location: EntityLocation,
    pub distance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Npc,
    Actor,
}

/// Reverse index `place_id -> {npcs, actors}`, kept consistent with
/// entity-location updates by the caller (C13).
#[derive(Debug, Default)]
pub struct PlaceIndex {
    npcs_by_place: HashMap<String, HashSet<String>>,
    actors_by_place: HashMap<String, HashSet<String>>,
}

impl PlaceIndex {
    pub fn new() -> Self {
        PlaceIndex::default()
    }

    pub fn index_npc(&mut self, npc_ref: &str, place_id: &str) {
        self.remove_npc(npc_ref);
        self.npcs_by_place
            .entry(place_id.to_string())
            .or_default()
            .insert(npc_ref.to_string());
    }

    pub fn index_actor(&mut self, actor_ref: &str, place_id: &str) {
        self.remove_actor(actor_ref);
        self.actors_by_place
            .entry(place_id.to_string())
            .or_default()
            .insert(actor_ref.to_string());
    }

    pub fn remove_npc(&mut self, npc_ref: &str) {
        for set in self.npcs_by_place.values_mut() {
            set.remove(npc_ref);
        }
    }

    pub fn remove_actor(&mut self, actor_ref: &str) {
        for set in self.actors_by_place.values_mut() {
            set.remove(actor_ref);
        }
    }

    pub fn npcs_in(&self, place_id: &str) -> Vec<&str> {
        self.npcs_by_place
            .get(place_id)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    pub fn actors_in(&self, place_id: &str) -> Vec<&str> {
        self.actors_by_place
            .get(place_id)
            .map(|s| s.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Queries entities within `radius` tiles of `location` in the same
    /// place, via a caller-supplied entity loader (keeps this crate free
    /// of I/O — the CLI worker wires in the real filesystem loader).
    pub fn available_targets(
        &self,
        location: &EntityLocation,
        radius: f64,
        load_entity: impl Fn(EntityKind, &str) -> Option<(String, EntityLocation)>,
    ) -> Vec<TargetCandidate> {
        let Some(place_id) = &location.place_id else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for npc_ref in self.npcs_in(place_id) {
            if let Some((name, loc)) = load_entity(EntityKind::Npc, npc_ref) {
                let distance = location.tile.euclidean(loc.tile);
                if distance <= radius {
                    out.push(TargetCandidate {
                        r#ref: npc_ref.to_string(),
                        name,
                        kind: EntityKind::Npc,
                        location: loc,
                        distance,
                    });
                }
            }
        }
        for actor_ref in self.actors_in(place_id) {
            if let Some((name, loc)) = load_entity(EntityKind::Actor, actor_ref) {
                let distance = location.tile.euclidean(loc.tile);
                if distance <= radius {
                    out.push(TargetCandidate {
                        r#ref: actor_ref.to_string(),
                        name,
                        kind: EntityKind::Actor,
                        location: loc,
                        distance,
                    });
                }
            }
        }
        out.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        out
    }
}

/// Distance between two locations: Euclidean within the same region/place
/// on the same tile-grid, or a scaled inter-region distance otherwise
/// (spec.md §4.5 step 4).
pub fn distance(a: &EntityLocation, b: &EntityLocation) -> f64 {
    if a.region_tile == b.region_tile {
        a.tile.euclidean(b.tile)
    } else {
        // Inter-region: region-tile distance dominates, scaled up so
        // cross-region targets are never mistaken for in-range ones
        // unless the verb explicitly allows UNLIMITED range.
        const REGION_TILE_SCALE: f64 = 1000.0;
        a.region_tile.euclidean(b.region_tile) * REGION_TILE_SCALE + a.tile.euclidean(b.tile)
    }
}

/// Calendar constants (spec.md §6): 60 min/hr, 24 hr/day, 30 day/month,
/// 6 months/year.
pub const MINUTES_PER_HOUR: u32 = 60;
pub const HOURS_PER_DAY: u32 = 24;
pub const DAYS_PER_MONTH: u32 = 30;
pub const MONTHS_PER_YEAR: u32 = 6;

pub fn advance_game_time(mut gt: loom_protocol::GameTime, minutes: u32) -> loom_protocol::GameTime {
    gt.total_minutes += minutes as u64;
    gt.minute += minutes;
    while gt.minute >= MINUTES_PER_HOUR {
        gt.minute -= MINUTES_PER_HOUR;
        gt.hour += 1;
    }
    while gt.hour >= HOURS_PER_DAY {
        gt.hour -= HOURS_PER_DAY;
        gt.day += 1;
    }
    while gt.day >= DAYS_PER_MONTH {
        gt.day -= DAYS_PER_MONTH;
        gt.month += 1;
    }
    while gt.month >= MONTHS_PER_YEAR {
        gt.month -= MONTHS_PER_YEAR;
        gt.year += 1;
    }
    gt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(place: &str, x: i32, y: i32) -> EntityLocation {
        EntityLocation {
            world_tile: TilePos::new(0, 0),
            region_tile: TilePos::new(0, 0),
            place_id: Some(place.to_string()),
            tile: TilePos::new(x, y),
            elevation: 0.0,
        }
    }

    #[test]
    fn distance_same_region_is_euclidean() {
        let a = loc("p", 0, 0);
        let b = loc("p", 3, 4);
        assert_eq!(distance(&a, &b), 5.0);
    }

    #[test]
    fn distance_cross_region_is_scaled() {
        let a = loc("p", 0, 0);
        let mut b = loc("p", 0, 0);
        b.region_tile = TilePos::new(1, 0);
        assert!(distance(&a, &b) > 999.0);
    }

    #[test]
    fn place_index_finds_targets_within_radius() {
        let mut idx = PlaceIndex::new();
        idx.index_npc("npc.guard", "place.square");
        let origin = loc("place.square", 0, 0);
        let targets = idx.available_targets(&origin, 10.0, |kind, r#ref| {
            assert_eq!(kind, EntityKind::Npc);
            Some((r#ref.to_string(), loc("place.square", 3, 4)))
        });
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].distance, 5.0);
    }

    #[test]
    fn game_time_rolls_over_calendar_units() {
        let gt = loom_protocol::GameTime {
            minute: 59,
            hour: 23,
            day: 29,
            month: 5,
            year: 0,
            total_minutes: 0,
        };
        let next = advance_game_time(gt, 1);
        assert_eq!(next.minute, 0);
        assert_eq!(next.hour, 0);
        assert_eq!(next.day, 0);
        assert_eq!(next.month, 0);
        assert_eq!(next.year, 1);
    }
}
