//! C11 — NPC movement controller.
//!
//! State and pure algorithms (BFS, facing, reassessment gating) live here;
//! the fixed-rate scheduler itself is a thin `tokio::time::interval` loop
//! in the CLI binary, the same split the teacher uses between
//! `core/src/codex.rs`'s submission loop and the pure dispatch in
//! `core/src/safety.rs`.

use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;

use crate::world::Place;
use crate::world::TilePos;

pub const HISTORY_MAX_ENTRIES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalKind {
    Wander,
    Patrol,
    Interact,
    Social,
    Follow,
    Flee,
    Rest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub kind: GoalKind,
    pub target_position: Option<TilePos>,
    pub target_entity: Option<String>,
    pub target_feature: Option<String>,
    /// 1-10.
    pub priority: u8,
    pub created_at_ms: i64,
    pub expires_at_ms: Option<i64>,
    pub reason: String,
}

impl Goal {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_some_and(|exp| now_ms >= exp)
    }
}

#[derive(Debug, Clone)]
pub struct MovementState {
    pub current_goal: Option<Goal>,
    pub current_action: Option<String>,
    pub path: Vec<TilePos>,
    pub path_index: usize,
    pub is_moving: bool,
    pub last_reassess_time_ms: i64,
    pub blocked_since_ms: Option<i64>,
    pub wait_until_ms: Option<i64>,
    pub last_position: TilePos,
    pub stuck_count: u32,
    history: VecDeque<TilePos>,
}

impl MovementState {
    pub fn new(start: TilePos, now_ms: i64) -> Self {
        MovementState {
            current_goal: None,
            current_action: None,
            path: Vec::new(),
            path_index: 0,
            is_moving: false,
            last_reassess_time_ms: now_ms,
            blocked_since_ms: None,
            wait_until_ms: None,
            last_position: start,
            stuck_count: 0,
            history: VecDeque::new(),
        }
    }

    /// Records a new observed position, bounding the ring buffer at
    /// [`HISTORY_MAX_ENTRIES`] (spec.md §9).
    pub fn record_position(&mut self, pos: TilePos) {
        if self.history.len() == HISTORY_MAX_ENTRIES {
            self.history.pop_front();
        }
        self.history.push_back(pos);
        self.last_position = pos;
    }

    pub fn history(&self) -> &VecDeque<TilePos> {
        &self.history
    }
}

/// Reassessment thresholds (spec.md §4.11).
#[derive(Debug, Clone, Copy)]
pub struct ReassessmentPolicy {
    pub blocked_threshold_ms: i64,
    pub stuck_count_threshold: u32,
    pub max_interval_ms: i64,
    pub jitter_max_ms: i64,
}

impl Default for ReassessmentPolicy {
    fn default() -> Self {
        ReassessmentPolicy {
            blocked_threshold_ms: 3_000,
            stuck_count_threshold: 3,
            max_interval_ms: 15_000,
            jitter_max_ms: 5_000,
        }
    }
}

/// Whether `state`'s goal is stale and due for reassessment: no goal,
/// goal expired, blocked too long, stuck count over threshold, or the
/// jittered max interval has elapsed (spec.md §4.11). `jitter_ms` is the
/// 0..=jitter_max_ms roll the caller drew for this NPC this tick.
pub fn needs_reassessment(
    state: &MovementState,
    now_ms: i64,
    policy: &ReassessmentPolicy,
    jitter_ms: i64,
) -> bool {
    match &state.current_goal {
        None => true,
        Some(goal) if goal.is_expired(now_ms) => true,
        _ => {
            let blocked_too_long = state
                .blocked_since_ms
                .is_some_and(|since| now_ms - since > policy.blocked_threshold_ms);
            let stuck = state.stuck_count >= policy.stuck_count_threshold;
            let interval_elapsed =
                now_ms - state.last_reassess_time_ms >= policy.max_interval_ms + jitter_ms;
            blocked_too_long || stuck || interval_elapsed
        }
    }
}

/// Round-robin picker bounding how many NPCs are reassessed per tick
/// (spec.md §4.11 "pick at most N NPCs for reassessment; the others age
/// out their timers").
#[derive(Debug, Default)]
pub struct ReassessmentScheduler {
    cursor: usize,
}

impl ReassessmentScheduler {
    pub fn select<'a>(&mut self, candidates: &'a [String], max: usize) -> Vec<&'a str> {
        if candidates.is_empty() || max == 0 {
            return Vec::new();
        }
        let n = max.min(candidates.len());
        let mut picked = Vec::with_capacity(n);
        for i in 0..n {
            picked.push(candidates[(self.cursor + i) % candidates.len()].as_str());
        }
        self.cursor = (self.cursor + n) % candidates.len();
        picked
    }
}

/// 8-direction facing, per `Δ(x,y)` (spec.md §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    North,
    NorthEast,
    East,
    SouthEast,
    South,
    SouthWest,
    West,
    NorthWest,
}

pub fn facing_from_delta(dx: i32, dy: i32) -> Option<Facing> {
    use Facing::*;
    match (dx.signum(), dy.signum()) {
        (0, -1) => Some(North),
        (1, -1) => Some(NorthEast),
        (1, 0) => Some(East),
        (1, 1) => Some(SouthEast),
        (0, 1) => Some(South),
        (-1, 1) => Some(SouthWest),
        (-1, 0) => Some(West),
        (-1, -1) => Some(NorthWest),
        (0, 0) => None,
        _ => unreachable!("signum always yields -1, 0, or 1"),
    }
}

/// BFS over `place`'s tile grid. Occupied tiles (excluding `mover`),
/// feature tiles, and out-of-bounds tiles are walls (spec.md §4.11).
pub fn bfs_path(place: &Place, start: TilePos, goal: TilePos, mover: &str) -> Option<Vec<TilePos>> {
    if start == goal {
        return Some(vec![start]);
    }
    let walls = walls_for(place, mover);
    if walls.contains(&goal) || !place.tile_grid.in_bounds(goal) {
        return None;
    }

    let mut queue = VecDeque::new();
    let mut came_from: HashMap<TilePos, TilePos> = HashMap::new();
    let mut visited = HashSet::new();
    visited.insert(start);
    queue.push_back(start);

    while let Some(current) = queue.pop_front() {
        if current == goal {
            return Some(reconstruct_path(&came_from, start, goal));
        }
        for next in neighbors(current) {
            if !place.tile_grid.in_bounds(next) || walls.contains(&next) || visited.contains(&next) {
                continue;
            }
            visited.insert(next);
            came_from.insert(next, current);
            queue.push_back(next);
        }
    }
    None
}

/// spec.md §4.11 `find_path_to_nearby`: if `goal` itself is blocked,
/// spirals outward up to `max_distance` tiles for a walkable substitute
/// and returns a path to that tile instead.
pub fn find_path_to_nearby(
    place: &Place,
    start: TilePos,
    goal: TilePos,
    mover: &str,
    max_distance: i32,
) -> Option<Vec<TilePos>> {
    if let Some(path) = bfs_path(place, start, goal, mover) {
        return Some(path);
    }
    for radius in 1..=max_distance {
        for candidate in spiral_ring(goal, radius) {
            if let Some(path) = bfs_path(place, start, candidate, mover) {
                return Some(path);
            }
        }
    }
    None
}

fn walls_for(place: &Place, mover: &str) -> HashSet<TilePos> {
    place
        .occupied_tiles(Some(mover))
        .union(&place.feature_tiles())
        .copied()
        .collect()
}

fn neighbors(pos: TilePos) -> [TilePos; 4] {
    [
        TilePos::new(pos.x, pos.y - 1),
        TilePos::new(pos.x + 1, pos.y),
        TilePos::new(pos.x, pos.y + 1),
        TilePos::new(pos.x - 1, pos.y),
    ]
}

fn reconstruct_path(
    came_from: &HashMap<TilePos, TilePos>,
    start: TilePos,
    goal: TilePos,
) -> Vec<TilePos> {
    let mut path = vec![goal];
    let mut current = goal;
    while current != start {
        current = came_from[&current];
        path.push(current);
    }
    path.reverse();
    path
}

/// Tiles forming the ring at exactly `radius` (Chebyshev) around `center`,
/// in a deterministic spiral order.
fn spiral_ring(center: TilePos, radius: i32) -> Vec<TilePos> {
    let mut ring = Vec::new();
    for dx in -radius..=radius {
        for dy in -radius..=radius {
            if dx.abs().max(dy.abs()) == radius {
                ring.push(TilePos::new(center.x + dx, center.y + dy));
            }
        }
    }
    ring
}

/// Typed command the controller issues to the rendering process
/// (spec.md §4.11 — the controller is the sole authority).
#[derive(Debug, Clone, PartialEq)]
pub enum NpcCommand {
    Stop { npc_ref: String },
    Move { npc_ref: String, to: TilePos },
    Wander { npc_ref: String },
    Face { npc_ref: String, facing: Facing },
    Patrol { npc_ref: String },
    Flee { npc_ref: String },
    Status { npc_ref: String, text: String },
    UiHighlight { tile: TilePos },
    UiTarget { r#ref: String },
}

#[derive(Debug, Clone)]
struct PresenceEntry {
    target_ref: String,
    timeout_at_ms: i64,
}

/// Ephemeral conversation-presence store (spec.md §4.11): while present,
/// an NPC's movement is suspended and it reports "busy". Pruned on read.
#[derive(Debug, Default)]
pub struct ConversationPresence {
    entries: HashMap<String, PresenceEntry>,
}

impl ConversationPresence {
    pub fn set(&mut self, npc_ref: &str, target_ref: &str, timeout_at_ms: i64) {
        self.entries.insert(
            npc_ref.to_string(),
            PresenceEntry {
                target_ref: target_ref.to_string(),
                timeout_at_ms,
            },
        );
    }

    /// Returns the conversing partner's ref if `npc_ref` is still in a
    /// live presence entry at `now_ms`, pruning expired entries as a
    /// side effect.
    pub fn is_in_conversation_presence(&mut self, npc_ref: &str, now_ms: i64) -> Option<String> {
        self.prune(now_ms);
        self.entries.get(npc_ref).map(|e| e.target_ref.clone())
    }

    fn prune(&mut self, now_ms: i64) {
        self.entries.retain(|_, e| e.timeout_at_ms > now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::Environment;
    use crate::world::PlaceContents;
    use crate::world::PlacedThing;
    use crate::world::TileGrid;

    fn empty_place(w: u32, h: u32) -> Place {
        Place {
            id: "p".to_string(),
            tile_grid: TileGrid {
                width: w,
                height: h,
                default_entry: TilePos::new(0, 0),
            },
            contents: PlaceContents::default(),
            connections: vec![],
            environment: Environment::default(),
            allows_stacking: false,
        }
    }

    #[test]
    fn facing_maps_all_eight_directions() {
        assert_eq!(facing_from_delta(0, -1), Some(Facing::North));
        assert_eq!(facing_from_delta(1, 1), Some(Facing::SouthEast));
        assert_eq!(facing_from_delta(-1, 0), Some(Facing::West));
        assert_eq!(facing_from_delta(0, 0), None);
    }

    #[test]
    fn bfs_finds_direct_path_in_open_room() {
        let place = empty_place(3, 3);
        let path = bfs_path(&place, TilePos::new(0, 0), TilePos::new(2, 2), "mover").unwrap();
        assert_eq!(path.first(), Some(&TilePos::new(0, 0)));
        assert_eq!(path.last(), Some(&TilePos::new(2, 2)));
        for pair in path.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let dist = (a.x - b.x).abs() + (a.y - b.y).abs();
            assert_eq!(dist, 1, "each step must be to an adjacent tile");
        }
    }

    #[test]
    fn bfs_routes_around_occupied_tiles() {
        let mut place = empty_place(3, 3);
        place.contents.npcs_present.push(PlacedThing {
            id: "blocker".to_string(),
            tile_position: TilePos::new(1, 0),
        });
        place.contents.npcs_present.push(PlacedThing {
            id: "blocker2".to_string(),
            tile_position: TilePos::new(1, 1),
        });
        let path = bfs_path(&place, TilePos::new(0, 0), TilePos::new(2, 0), "mover").unwrap();
        assert!(!path.contains(&TilePos::new(1, 0)));
    }

    #[test]
    fn find_path_to_nearby_falls_back_when_goal_blocked() {
        let mut place = empty_place(5, 5);
        place.contents.npcs_present.push(PlacedThing {
            id: "occupant".to_string(),
            tile_position: TilePos::new(2, 2),
        });
        let path = find_path_to_nearby(&place, TilePos::new(0, 0), TilePos::new(2, 2), "mover", 3)
            .expect("a nearby walkable substitute should be found");
        assert_ne!(*path.last().unwrap(), TilePos::new(2, 2));
    }

    #[test]
    fn needs_reassessment_true_with_no_goal() {
        let state = MovementState::new(TilePos::new(0, 0), 0);
        assert!(needs_reassessment(&state, 1000, &ReassessmentPolicy::default(), 0));
    }

    #[test]
    fn needs_reassessment_true_when_stuck() {
        let mut state = MovementState::new(TilePos::new(0, 0), 0);
        state.current_goal = Some(Goal {
            kind: GoalKind::Wander,
            target_position: Some(TilePos::new(1, 1)),
            target_entity: None,
            target_feature: None,
            priority: 1,
            created_at_ms: 0,
            expires_at_ms: None,
            reason: "test".to_string(),
        });
        state.stuck_count = 5;
        assert!(needs_reassessment(&state, 100, &ReassessmentPolicy::default(), 0));
    }

    #[test]
    fn reassessment_scheduler_round_robins() {
        let ids: Vec<String> = (0..7).map(|i| format!("npc.{i}")).collect();
        let mut scheduler = ReassessmentScheduler::default();
        let first = scheduler.select(&ids, 5);
        assert_eq!(first, vec!["npc.0", "npc.1", "npc.2", "npc.3", "npc.4"]);
        let second = scheduler.select(&ids, 5);
        assert_eq!(second, vec!["npc.5", "npc.6", "npc.0", "npc.1", "npc.2"]);
    }

    #[test]
    fn conversation_presence_suspends_then_expires() {
        let mut presence = ConversationPresence::default();
        presence.set("npc.grenda", "actor.p", 30_000);
        assert_eq!(
            presence.is_in_conversation_presence("npc.grenda", 1_000),
            Some("actor.p".to_string())
        );
        assert_eq!(presence.is_in_conversation_presence("npc.grenda", 31_000), None);
    }

    #[test]
    fn movement_history_ring_buffer_bounded() {
        let mut state = MovementState::new(TilePos::new(0, 0), 0);
        for i in 0..(HISTORY_MAX_ENTRIES + 3) {
            state.record_position(TilePos::new(i as i32, 0));
        }
        assert_eq!(state.history().len(), HISTORY_MAX_ENTRIES);
    }
}
