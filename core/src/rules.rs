//! C6 — Tag & tool resolver.
//!
//! A pure lookup library over a static rule table, in the same spirit as
//! the teacher's `ApprovalPolicy`/`SandboxPolicy` pairing in
//! `protocol/src/protocol.rs`: plain data enums consulted by the pipeline,
//! never mutated once constructed.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// spec.md §4.6 range table: `(base, max)` tile distances, plus the
/// per-tile penalty applied beyond `base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeCategory {
    Touch,
    Melee,
    Thrown,
    Projectile,
    Sight,
    Unlimited,
}

impl RangeCategory {
    /// `(base, max)` in tiles. `None` for `Unlimited`, which has no window.
    pub fn window(self) -> Option<(f64, f64)> {
        match self {
            RangeCategory::Touch => Some((1.0, 1.0)),
            RangeCategory::Melee => Some((1.0, 2.0)),
            RangeCategory::Thrown => Some((5.0, 20.0)),
            RangeCategory::Projectile => Some((30.0, 120.0)),
            RangeCategory::Sight => Some((60.0, 120.0)),
            RangeCategory::Unlimited => None,
        }
    }

    fn per_tile_penalty(self) -> f64 {
        match self {
            RangeCategory::Thrown => -2.0,
            RangeCategory::Projectile => -1.0,
            RangeCategory::Sight => -0.5,
            _ => 0.0,
        }
    }

    /// Penalty applied to the roll at `distance` tiles, or `-Infinity` if
    /// `distance` exceeds the category's max range (spec.md §4.6).
    pub fn penalty_at(self, distance: f64) -> f64 {
        match self.window() {
            None => 0.0,
            Some((base, max)) => {
                if distance > max {
                    f64::NEG_INFINITY
                } else if distance <= base {
                    0.0
                } else {
                    (distance - base) * self.per_tile_penalty()
                }
            }
        }
    }

    pub fn is_in_range(self, distance: f64) -> bool {
        match self.window() {
            None => true,
            Some((_, max)) => distance <= max,
        }
    }
}

/// `effective * (1 + (STR - 10) / 20)`, floored (spec.md §4.6).
pub fn effective_thrown_range(base_range: f64, strength: i32) -> i32 {
    let scaled = base_range * (1.0 + (strength as f64 - 10.0) / 20.0);
    scaled.floor() as i32
}

/// Step function: weight (in the item's native unit) to MAG cost.
/// `≤5→1, ≤15→2, ≤30→3, ≤50→4, else 5` (spec.md §3).
pub fn weight_mag(weight: f64) -> u32 {
    if weight <= 5.0 {
        1
    } else if weight <= 15.0 {
        2
    } else if weight <= 30.0 {
        3
    } else if weight <= 50.0 {
        4
    } else {
        5
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagInstance {
    pub name: String,
    pub stacks: u32,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub expiry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnabledAction {
    /// `"<VERB>"` or `"<VERB>.<SUBTYPE>"`.
    pub action_type: String,
    pub range_category: RangeCategory,
    #[serde(default)]
    pub base_range_override: Option<f64>,
    #[serde(default)]
    pub damage_formula: Option<String>,
    #[serde(default)]
    pub proficiencies: Vec<String>,
    #[serde(default)]
    pub ammo_requirement: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRule {
    pub name: String,
    #[serde(default)]
    pub meta_tags: Vec<String>,
    #[serde(default)]
    pub enabled_actions: Vec<EnabledAction>,
    #[serde(default)]
    pub scaling_per_stack: f64,
    pub max_stacks: u32,
    /// Tag-generation MAG cost deducted from the item's budget before the
    /// residual is treated as "core function" MAG (spec.md §4.6).
    #[serde(default)]
    pub generation_cost: f64,
}

/// A tagged item as seen by the rules resolver. Ownership/location of the
/// item itself is C7/C8's concern; this is the slice C6 needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaggedItem {
    pub id: String,
    pub weight: f64,
    pub tags: Vec<TagInstance>,
}

impl TaggedItem {
    /// Σ stacks across all tags.
    pub fn mag(&self) -> u32 {
        self.tags.iter().map(|t| t.stacks).sum()
    }

    /// MAG remaining after tag-generation costs, using `registry` to look
    /// up each tag's `generation_cost`.
    pub fn core_function_mag(&self, registry: &TagRuleRegistry) -> f64 {
        let spent: f64 = self
            .tags
            .iter()
            .map(|t| {
                registry
                    .get(&t.name)
                    .map(|rule| rule.generation_cost * t.stacks as f64)
                    .unwrap_or(0.0)
            })
            .sum();
        (self.mag() as f64 - spent).max(0.0)
    }
}

/// Static table of tag rules, keyed by tag name. Constructed once at
/// startup from the data directory's tag templates and never mutated —
/// spec.md §9 calls out module-level registries as the thing to turn
/// into an explicit, passed-by-reference service.
#[derive(Debug, Clone, Default)]
pub struct TagRuleRegistry {
    rules: HashMap<String, TagRule>,
}

impl TagRuleRegistry {
    pub fn new(rules: impl IntoIterator<Item = TagRule>) -> Self {
        TagRuleRegistry {
            rules: rules.into_iter().map(|r| (r.name.clone(), r)).collect(),
        }
    }

    pub fn get(&self, tag_name: &str) -> Option<&TagRule> {
        self.rules.get(tag_name)
    }

    /// All enabled actions across every tag the item carries
    /// (spec.md §4.6 `get_enabled_actions`).
    pub fn get_enabled_actions<'a>(&'a self, item: &'a TaggedItem) -> Vec<&'a EnabledAction> {
        item.tags
            .iter()
            .filter_map(|t| self.get(&t.name))
            .flat_map(|rule| rule.enabled_actions.iter())
            .collect()
    }

    /// First enabled action across the item's tags whose `action_type`
    /// matches the full dotted form or the bare verb (spec.md §4.5 step 5).
    pub fn get_action_capability<'a>(
        &'a self,
        item: &'a TaggedItem,
        action_type: &str,
    ) -> Option<&'a EnabledAction> {
        let verb = action_type.split('.').next().unwrap_or(action_type);
        self.get_enabled_actions(item)
            .into_iter()
            .find(|a| a.action_type == action_type || a.action_type == verb)
    }

    /// Base range for `item`'s capability matching `action_type`, after
    /// adding the contributing tag's stack scaling capped at `max_stacks`
    /// (spec.md §4.6: base 30 + 3 stacks × 2.0 = 36).
    pub fn effective_base_range(&self, item: &TaggedItem, action_type: &str) -> Option<f64> {
        let verb = action_type.split('.').next().unwrap_or(action_type);
        for tag in &item.tags {
            let Some(rule) = self.get(&tag.name) else {
                continue;
            };
            let Some(cap) = rule
                .enabled_actions
                .iter()
                .find(|a| a.action_type == action_type || a.action_type == verb)
            else {
                continue;
            };
            let base = cap
                .base_range_override
                .or_else(|| cap.range_category.window().map(|(b, _)| b))?;
            let scaled_stacks = tag.stacks.min(rule.max_stacks) as f64;
            return Some(base + scaled_stacks * rule.scaling_per_stack);
        }
        None
    }

    /// Whether `ammo`'s tags satisfy `tool_capability`'s declared ammo
    /// requirement. A capability with no requirement accepts anything,
    /// including no ammo at all.
    pub fn check_ammo_compatibility(
        &self,
        tool_capability: &EnabledAction,
        ammo: Option<&TaggedItem>,
    ) -> bool {
        match &tool_capability.ammo_requirement {
            None => true,
            Some(required_tag) => ammo
                .map(|item| item.tags.iter().any(|t| &t.name == required_tag))
                .unwrap_or(false),
        }
    }

    /// `weight_mag(item) <= STR/3 + tool_bonus` (spec.md §4.6).
    pub fn validate_throw(&self, strength: i32, item: &TaggedItem, tool_bonus: f64) -> bool {
        weight_mag(item.weight) as f64 <= strength as f64 / 3.0 + tool_bonus
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostClass {
    Free,
    Partial,
    Full,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetType {
    Actor,
    Npc,
    Item,
    Tile,
    Any,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Perceptibility {
    pub visual: bool,
    pub auditory: bool,
    pub radius: f64,
    pub stealth_allowed: bool,
    pub visual_obscurable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostilityConstraint {
    None,
    RequiresHostile,
    RequiresFriendly,
}

/// Static table keyed by verb (spec.md §3 `Action Registry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDef {
    pub verb: String,
    pub target_types: Vec<TargetType>,
    pub requires_tool: bool,
    pub requires_awareness: bool,
    pub default_cost: CostClass,
    pub perceptibility: Perceptibility,
    pub hostility: HostilityConstraint,
    pub effect_template: String,
    /// Flat tile range for verbs that don't resolve range through an
    /// equipped tool's capability (e.g. COMMUNICATE). Tool-mediated verbs
    /// ignore this in favor of the capability's `range_category`.
    pub target_range: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    defs: HashMap<String, ActionDef>,
}

impl ActionRegistry {
    pub fn new(defs: impl IntoIterator<Item = ActionDef>) -> Self {
        ActionRegistry {
            defs: defs.into_iter().map(|d| (d.verb.clone(), d)).collect(),
        }
    }

    pub fn get(&self, verb: &str) -> Option<&ActionDef> {
        self.defs.get(verb)
    }
}
