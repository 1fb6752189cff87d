//! On-disk world state and its adapter implementations of the core
//! crate's injected-dependency traits ([`RefExistence`], [`ActionContext`],
//! [`EffectExecutor`]).
//!
//! Grounded on `loom-core::store`'s read-modify-write-whole-file technique:
//! the world file is small enough (one slot's worth of actors/npcs/items)
//! to load entirely, mutate, and atomically rewrite per tick, same as a
//! queue file.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;

use loom_core::action::ActionContext;
use loom_core::effects::EffectExecutor;
use loom_core::resolve::ParsedRef;
use loom_core::resolve::RefExistence;
use loom_core::resolve::RefKind;
use loom_core::rules::CostClass;
use loom_core::rules::TagInstance;
use loom_core::rules::TagRule;
use loom_core::rules::TaggedItem;
use loom_core::world::distance as world_distance;
use loom_core::world::EntityKind;
use loom_core::world::EntityLocation;
use loom_core::world::Place;
use loom_core::world::PlaceIndex;
use loom_core::world::TargetCandidate;
use loom_core::CoreError;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EntityRecord {
    pub name: String,
    pub location: Option<EntityLocation>,
    #[serde(default)]
    pub strength: i32,
    #[serde(default)]
    pub stats: HashMap<String, f64>,
    #[serde(default)]
    pub resources: HashMap<String, f64>,
    #[serde(default)]
    pub tags: Vec<TagInstance>,
    #[serde(default)]
    pub awareness: HashSet<String>,
    #[serde(default)]
    pub inventory: Vec<String>,
    #[serde(default)]
    pub equipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ItemRecord {
    pub weight: f64,
    #[serde(default)]
    pub tags: Vec<TagInstance>,
    #[serde(default)]
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorldState {
    #[serde(default)]
    pub actors: HashMap<String, EntityRecord>,
    #[serde(default)]
    pub npcs: HashMap<String, EntityRecord>,
    #[serde(default)]
    pub items: HashMap<String, ItemRecord>,
    #[serde(default)]
    pub places: HashMap<String, Place>,
    #[serde(default)]
    pub tag_rules: Vec<TagRule>,
    #[serde(default)]
    pub action_points: HashMap<String, f64>,
    #[serde(default)]
    pub game_time: loom_protocol::GameTime,
}

pub struct WorldStore {
    path: PathBuf,
}

impl WorldStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        WorldStore { path: path.into() }
    }

    pub fn load(&self) -> loom_core::Result<WorldState> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(WorldState::default()),
            Err(e) => Err(io_err(&self.path, e)),
        }
    }

    pub fn save(&self, state: &WorldState) -> loom_core::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = sibling_temp_path(&self.path);
        std::fs::write(&tmp, &bytes).map_err(|e| io_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| io_err(&self.path, e))?;
        Ok(())
    }
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "world".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

fn io_err(path: &Path, source: std::io::Error) -> CoreError {
    CoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Borrows a [`WorldState`] to answer the core crate's injected-dependency
/// traits. Built fresh each tick from the loaded state; any mutation goes
/// straight back into `state` for the caller to persist afterward.
pub struct WorldAdapter<'a> {
    pub state: &'a mut WorldState,
}

impl<'a> WorldAdapter<'a> {
    pub fn new(state: &'a mut WorldState) -> Self {
        WorldAdapter { state }
    }

    fn entity_mut(&mut self, r#ref: &str) -> Option<&mut EntityRecord> {
        if let Some(id) = r#ref.strip_prefix("actor.") {
            self.state.actors.get_mut(id)
        } else if let Some(id) = r#ref.strip_prefix("npc.") {
            self.state.npcs.get_mut(id)
        } else {
            None
        }
    }

    fn entity(&self, r#ref: &str) -> Option<&EntityRecord> {
        if let Some(id) = r#ref.strip_prefix("actor.") {
            self.state.actors.get(id)
        } else if let Some(id) = r#ref.strip_prefix("npc.") {
            self.state.npcs.get(id)
        } else {
            None
        }
    }

    fn tag_registry(&self) -> loom_core::rules::TagRuleRegistry {
        loom_core::rules::TagRuleRegistry::new(self.state.tag_rules.clone())
    }

    fn place_index(&self) -> PlaceIndex {
        let mut idx = PlaceIndex::new();
        for (id, actor) in &self.state.actors {
            if let Some(loc) = &actor.location {
                if let Some(place_id) = &loc.place_id {
                    idx.index_actor(&format!("actor.{id}"), place_id);
                }
            }
        }
        for (id, npc) in &self.state.npcs {
            if let Some(loc) = &npc.location {
                if let Some(place_id) = &loc.place_id {
                    idx.index_npc(&format!("npc.{id}"), place_id);
                }
            }
        }
        idx
    }
}

impl RefExistence for WorldAdapter<'_> {
    fn exists(&self, parsed: &ParsedRef) -> Option<String> {
        match parsed.kind {
            RefKind::Actor => {
                let id = parsed.segments.first()?;
                self.state.actors.contains_key(id).then(|| format!("actors/{id}.jsonc"))
            }
            RefKind::Npc => {
                let id = parsed.segments.first()?;
                self.state.npcs.contains_key(id).then(|| format!("npcs/{id}.jsonc"))
            }
            RefKind::Item => {
                let id = parsed.segments.first()?;
                self.state.items.contains_key(id).then(|| format!("items/{id}.jsonc"))
            }
            RefKind::WorldTile | RefKind::RegionTile | RefKind::Tile => {
                Some(format!("tiles/{}.jsonc", parsed.raw))
            }
        }
    }
}

impl ActionContext for WorldAdapter<'_> {
    fn available_targets(&self, location: &EntityLocation, radius: f64) -> Vec<TargetCandidate> {
        let idx = self.place_index();
        idx.available_targets(location, radius, |kind, r#ref| match kind {
            EntityKind::Npc => {
                let id = r#ref.strip_prefix("npc.")?;
                let npc = self.state.npcs.get(id)?;
                Some((npc.name.clone(), npc.location.clone()?))
            }
            EntityKind::Actor => {
                let id = r#ref.strip_prefix("actor.")?;
                let actor = self.state.actors.get(id)?;
                Some((actor.name.clone(), actor.location.clone()?))
            }
        })
    }

    fn check_actor_awareness(&self, actor_ref: &str, target_ref: &str) -> bool {
        self.entity(actor_ref)
            .map(|e| e.awareness.contains(target_ref))
            .unwrap_or(false)
    }

    fn equipped_items(&self, actor_ref: &str) -> Vec<TaggedItem> {
        let Some(entity) = self.entity(actor_ref) else {
            return Vec::new();
        };
        entity
            .equipped
            .iter()
            .filter_map(|item_ref| self.get_item(item_ref))
            .collect()
    }

    fn get_item(&self, item_ref: &str) -> Option<TaggedItem> {
        let id = item_ref.strip_prefix("item_").unwrap_or(item_ref);
        let item = self.state.items.get(id)?;
        Some(TaggedItem {
            id: item_ref.to_string(),
            weight: item.weight,
            tags: item.tags.clone(),
        })
    }

    fn can_afford(&self, actor_ref: &str, cost: CostClass) -> bool {
        let needed = cost_points(cost);
        self.entity(actor_ref)
            .and_then(|e| e.resources.get("action_points"))
            .map(|available| *available >= needed)
            .unwrap_or(true)
    }

    fn check_rules(&self, _actor_ref: &str, _verb: &str, _target_ref: Option<&str>) -> Result<(), String> {
        Ok(())
    }

    fn has_line_of_sight(&self, from: &EntityLocation, to: &EntityLocation) -> bool {
        let blocked_place = from
            .place_id
            .as_ref()
            .and_then(|id| self.state.places.get(id))
            .map(|place| !place.environment.cover_available)
            .unwrap_or(true);
        blocked_place || world_distance(from, to) < 30.0
    }

    fn execute_effect(&mut self, command_text: &str) -> Result<String, String> {
        let commands = loom_core::effects::parse_machine_text(command_text)
            .map_err(|e| e.to_string())?;
        let raw_refs = collect_ref_args(&commands);
        let resolved = loom_core::resolve::resolve_strict(&raw_refs, &*self).map_err(|e| e.to_string())?;
        let result = loom_core::effects::apply_effects(&commands, &resolved, self);
        if !result.warnings.is_empty() {
            return Err(result.warnings.join("; "));
        }
        Ok(result.diffs.join("; "))
    }

    fn roll_die(&mut self, sides: u32) -> u32 {
        use rand::Rng;
        rand::rng().random_range(1..=sides.max(1))
    }
}

fn collect_ref_args(commands: &[loom_core::effects::Command]) -> Vec<String> {
    let mut refs = Vec::new();
    for cmd in commands {
        for (_, value) in &cmd.args {
            if let loom_core::effects::Value::Ident(s) = value {
                if loom_core::resolve::parse_ref(s).is_some() {
                    refs.push(s.clone());
                }
            }
        }
    }
    refs
}

fn cost_points(cost: CostClass) -> f64 {
    match cost {
        CostClass::Free => 0.0,
        CostClass::Partial => 0.5,
        CostClass::Full => 1.0,
        CostClass::Extended => 2.0,
    }
}

impl EffectExecutor for WorldAdapter<'_> {
    fn apply_damage(&mut self, target: &str, source: &str, tool: Option<&str>, potency: f64) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        let hp = entity.resources.entry("hp".to_string()).or_insert(0.0);
        *hp -= potency.max(0.0);
        Ok(format!(
            "{target}.hp -= {potency} (source={source}, tool={})",
            tool.unwrap_or("none")
        ))
    }

    fn apply_heal(&mut self, target: &str, amount: f64) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        let hp = entity.resources.entry("hp".to_string()).or_insert(0.0);
        *hp += amount;
        Ok(format!("{target}.hp += {amount}"))
    }

    fn apply_tag(&mut self, target: &str, tag: &str, stacks: u32) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        match entity.tags.iter_mut().find(|t| t.name == tag) {
            Some(existing) => existing.stacks += stacks,
            None => entity.tags.push(TagInstance {
                name: tag.to_string(),
                stacks,
                value: None,
                source: None,
                expiry: None,
            }),
        }
        Ok(format!("{target}.tags += {tag}x{stacks}"))
    }

    fn remove_tag(&mut self, target: &str, tag: &str) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        let before = entity.tags.len();
        entity.tags.retain(|t| t.name != tag);
        if entity.tags.len() == before {
            return Err(format!("{target} does not carry tag {tag}"));
        }
        Ok(format!("{target}.tags -= {tag}"))
    }

    fn adjust_inventory(&mut self, owner: &str, item_ref: &str, delta: i32) -> Result<String, String> {
        let entity = self.entity_mut(owner).ok_or_else(|| format!("unknown_owner: {owner}"))?;
        if delta > 0 {
            for _ in 0..delta {
                entity.inventory.push(item_ref.to_string());
            }
        } else {
            for _ in 0..delta.unsigned_abs() {
                if let Some(pos) = entity.inventory.iter().position(|i| i == item_ref) {
                    entity.inventory.remove(pos);
                }
            }
        }
        Ok(format!("{owner}.inventory[{item_ref}] += {delta}"))
    }

    fn adjust_resource(&mut self, target: &str, resource: &str, delta: f64) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        *entity.resources.entry(resource.to_string()).or_insert(0.0) += delta;
        Ok(format!("{target}.{resource} += {delta}"))
    }

    fn adjust_stat(&mut self, target: &str, stat: &str, delta: f64) -> Result<String, String> {
        let entity = self.entity_mut(target).ok_or_else(|| format!("unknown_target: {target}"))?;
        *entity.stats.entry(stat.to_string()).or_insert(0.0) += delta;
        Ok(format!("{target}.{stat} += {delta}"))
    }

    fn set_awareness(&mut self, observer: &str, target: &str, aware: bool) -> Result<String, String> {
        let entity = self.entity_mut(observer).ok_or_else(|| format!("unknown_observer: {observer}"))?;
        if aware {
            entity.awareness.insert(target.to_string());
        } else {
            entity.awareness.remove(target);
        }
        Ok(format!("{observer}.awareness[{target}] = {aware}"))
    }

    fn advance_time(&mut self, minutes: u32) -> Result<String, String> {
        self.state.game_time = loom_core::world::advance_game_time(self.state.game_time.clone(), minutes);
        Ok(format!("game_time += {minutes}m"))
    }

    fn set_occupancy(&mut self, actor: &str, location: &str) -> Result<String, String> {
        let parsed = loom_core::resolve::parse_ref(location).ok_or_else(|| format!("unparseable_location: {location}"))?;
        if parsed.segments.len() < 2 {
            return Err(format!("incomplete_tile_location: {location}"));
        }
        let entity = self.entity_mut(actor).ok_or_else(|| format!("unknown_actor: {actor}"))?;
        let Some(loc) = &mut entity.location else {
            return Err(format!("{actor} has no existing location to update"));
        };
        let tail: Vec<i32> = parsed
            .segments
            .iter()
            .rev()
            .take(2)
            .rev()
            .filter_map(|s| s.parse().ok())
            .collect();
        if let [x, y] = tail[..] {
            loc.tile = loom_core::world::TilePos::new(x, y);
        }
        Ok(format!("{actor}.location = {location}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::world::TilePos;

    fn actor(x: i32, y: i32) -> EntityRecord {
        EntityRecord {
            name: "Player".to_string(),
            location: Some(EntityLocation {
                world_tile: TilePos::new(0, 0),
                region_tile: TilePos::new(0, 0),
                place_id: Some("place.square".to_string()),
                tile: TilePos::new(x, y),
                elevation: 0.0,
            }),
            strength: 10,
            ..Default::default()
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorldStore::new(dir.path().join("world.jsonc"));
        let mut state = WorldState::default();
        state.actors.insert("p".to_string(), actor(0, 0));
        store.save(&state).unwrap();
        let loaded = store.load().unwrap();
        assert!(loaded.actors.contains_key("p"));
    }

    #[test]
    fn apply_damage_reduces_hp() {
        let mut state = WorldState::default();
        state.actors.insert("p".to_string(), actor(0, 0));
        let mut adapter = WorldAdapter::new(&mut state);
        adapter.apply_damage("actor.p", "npc.bandit", None, 5.0).unwrap();
        assert_eq!(state.actors["p"].resources["hp"], -5.0);
    }

    #[test]
    fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = WorldStore::new(dir.path().join("missing.jsonc"));
        assert!(store.load().unwrap().actors.is_empty());
    }
}
