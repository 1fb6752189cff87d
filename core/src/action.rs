//! C5 — Action pipeline.
//!
//! spec.md §9 flags the source's `ActionPipeline` (injected
//! `Promise`-returning deps) for re-architecture: "render as synchronous
//! functions that take a context carrying the dependencies; concurrency
//! lives at the worker boundary, not inside the pipeline." `run` below is
//! exactly that — a pure function over an [`ActionIntent`] and an
//! [`ActionContext`] trait object, with no `async` anywhere in this file.

use crate::rules::ActionRegistry;
use crate::rules::CostClass;
use crate::rules::HostilityConstraint;
use crate::rules::TagRuleRegistry;
use crate::rules::TaggedItem;
use crate::rules::TargetType;
use crate::world::distance;
use crate::world::EntityLocation;
use crate::world::TargetCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionSource {
    PlayerInput,
    AiDecision,
}

/// One attempted action, immutable after validation succeeds except for
/// the computed augmentations validation itself adds (spec.md §3).
#[derive(Debug, Clone)]
pub struct ActionIntent {
    pub id: String,
    pub actor_ref: String,
    pub verb: String,
    /// `"<VERB>"` or `"<VERB>.<SUBTYPE>"`, used to look up tool
    /// capabilities; defaults to the bare verb when absent.
    pub action_type: String,
    pub source: ActionSource,
    pub actor_location: EntityLocation,
    pub explicit_ui_target: Option<String>,
    pub target_ref: Option<String>,
    pub target_type: Option<TargetType>,
    pub last_target_ref: Option<String>,
    pub original_input: Option<String>,
    pub tool_ref: Option<String>,
    pub ammo_ref: Option<String>,
    pub strength: i32,
}

#[derive(Debug, Clone)]
pub struct ResolvedEffect {
    pub command_text: String,
    pub applied: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ActionResult {
    pub success: bool,
    pub failure_reason: Option<String>,
    pub effects: Vec<ResolvedEffect>,
    pub confidence: Option<f64>,
    pub observers: Vec<String>,
    pub resolved_target_ref: Option<String>,
}

impl ActionResult {
    fn failure(reason: impl Into<String>) -> Self {
        ActionResult {
            success: false,
            failure_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Everything the pipeline needs from the outside world, injected so the
/// pipeline itself stays deterministic under fixed inputs (spec.md §4.5).
pub trait ActionContext {
    fn available_targets(&self, location: &EntityLocation, radius: f64) -> Vec<TargetCandidate>;
    fn check_actor_awareness(&self, actor_ref: &str, target_ref: &str) -> bool;
    /// Equipped items in priority order: hand slots, body slots, implicit
    /// hand (spec.md §4.5 step 5).
    fn equipped_items(&self, actor_ref: &str) -> Vec<TaggedItem>;
    fn get_item(&self, item_ref: &str) -> Option<TaggedItem>;
    fn can_afford(&self, actor_ref: &str, cost: CostClass) -> bool;
    fn check_rules(&self, actor_ref: &str, verb: &str, target_ref: Option<&str>) -> Result<(), String>;
    fn has_line_of_sight(&self, from: &EntityLocation, to: &EntityLocation) -> bool;
    fn execute_effect(&mut self, command_text: &str) -> Result<String, String>;
    /// Rolls one die with `sides` faces (spec.md §4.9), used to evaluate a
    /// tool's `damage_formula` at stage 8; production contexts draw from
    /// `rand`, test contexts fix the sequence.
    fn roll_die(&mut self, sides: u32) -> u32;
}

/// Stage 1 target-resolution outcome.
struct TargetResolution {
    target_ref: Option<String>,
    target_location: Option<EntityLocation>,
    confidence: f64,
}

/// spec.md §4.5 step 1: explicit UI target, then `@mention`, then
/// context/default/auto fallbacks, each with its own confidence value.
fn resolve_target(
    intent: &ActionIntent,
    registry: &ActionRegistry,
    ctx: &impl ActionContext,
) -> TargetResolution {
    let candidates = ctx.available_targets(&intent.actor_location, f64::MAX);

    if intent.source == ActionSource::PlayerInput {
        if let Some(explicit) = &intent.explicit_ui_target {
            if let Some(candidate) = candidates.iter().find(|c| &c.r#ref == explicit) {
                return TargetResolution {
                    target_ref: Some(candidate.r#ref.clone()),
                    target_location: Some(candidate.location.clone()),
                    confidence: 1.0,
                };
            }
        }
    }

    if let Some(input) = &intent.original_input {
        let lower = input.to_lowercase();
        if let Some(candidate) = candidates.iter().find(|c| {
            lower.contains(&c.name.to_lowercase()) || lower.contains(&c.r#ref.to_lowercase())
        }) {
            return TargetResolution {
                target_ref: Some(candidate.r#ref.clone()),
                target_location: Some(candidate.location.clone()),
                confidence: 0.95,
            };
        }
    }

    if intent.source == ActionSource::AiDecision {
        if let Some(existing) = &intent.target_ref {
            if let Some(candidate) = candidates.iter().find(|c| &c.r#ref == existing) {
                return TargetResolution {
                    target_ref: Some(candidate.r#ref.clone()),
                    target_location: Some(candidate.location.clone()),
                    confidence: 0.9,
                };
            }
        }
        let def = registry.get(&intent.verb);
        let hostility = def.map(|d| d.hostility).unwrap_or(HostilityConstraint::None);
        let mut in_range: Vec<&TargetCandidate> = candidates
            .iter()
            .filter(|c| hostility_satisfied(hostility, c))
            .collect();
        in_range.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(std::cmp::Ordering::Equal));
        if let Some(closest) = in_range.first() {
            return TargetResolution {
                target_ref: Some(closest.r#ref.clone()),
                target_location: Some(closest.location.clone()),
                confidence: 0.9,
            };
        }
    }

    // Defaults (spec.md §4.5 step 1.d).
    match intent.verb.as_str() {
        "COMMUNICATE" => TargetResolution {
            target_ref: None,
            target_location: Some(intent.actor_location.clone()),
            confidence: 0.8,
        },
        "DEFEND" => TargetResolution {
            target_ref: Some(intent.actor_ref.clone()),
            target_location: Some(intent.actor_location.clone()),
            confidence: 0.8,
        },
        "ATTACK" | "HELP" => {
            if let Some(last) = &intent.last_target_ref {
                if let Some(candidate) = candidates.iter().find(|c| &c.r#ref == last) {
                    return TargetResolution {
                        target_ref: Some(candidate.r#ref.clone()),
                        target_location: Some(candidate.location.clone()),
                        confidence: 0.7,
                    };
                }
            }
            TargetResolution {
                target_ref: None,
                target_location: None,
                confidence: 0.7,
            }
        }
        _ => TargetResolution {
            target_ref: None,
            target_location: None,
            confidence: 0.7,
        },
    }
}

fn hostility_satisfied(constraint: HostilityConstraint, _candidate: &TargetCandidate) -> bool {
    // Hostility classification lives on the entity record, outside this
    // crate's world model; callers needing `RequiresHostile`/`RequiresFriendly`
    // pre-filter `available_targets`. Absent that, only `None` passes here.
    matches!(constraint, HostilityConstraint::None)
}

/// Runs all ten stages of spec.md §4.5, short-circuiting on the first
/// validation failure.
pub fn run(
    intent: &ActionIntent,
    registry: &ActionRegistry,
    tag_registry: &TagRuleRegistry,
    ctx: &mut impl ActionContext,
) -> ActionResult {
    let Some(def) = registry.get(&intent.verb) else {
        return ActionResult::failure(format!("unknown_verb: {}", intent.verb));
    };

    // Stage 1: target resolution.
    let resolution = resolve_target(intent, registry, ctx);

    // Stage 2: type validation.
    if resolution.target_ref.is_some() {
        if let Some(target_type) = intent.target_type {
            if !def.target_types.contains(&target_type) && !def.target_types.contains(&TargetType::Any) {
                return ActionResult::failure("invalid_target_type");
            }
        }
    }

    // Stage 3: awareness (optional).
    if def.requires_awareness {
        if let Some(target_ref) = &resolution.target_ref {
            if !ctx.check_actor_awareness(&intent.actor_ref, target_ref) {
                return ActionResult::failure("target_not_aware");
            }
        }
    }

    // Stage 4: range validation.
    let mut effective_tool: Option<TaggedItem> = None;
    let mut effective_capability_range: Option<f64> = None;
    if def.requires_tool {
        let mut equipped = ctx.equipped_items(&intent.actor_ref);
        if let Some(requested) = &intent.tool_ref {
            equipped.sort_by_key(|item| item.id != *requested);
        }
        let found = equipped.into_iter().find_map(|item| {
            tag_registry
                .get_action_capability(&item, &intent.action_type)
                .map(|cap| (item.clone(), cap.range_category))
        });
        match found {
            Some((item, category)) => {
                let base_range = tag_registry.effective_base_range(&item, &intent.action_type);
                effective_capability_range = base_range.map(|b| {
                    if category == crate::rules::RangeCategory::Thrown {
                        crate::rules::effective_thrown_range(b, intent.strength) as f64
                    } else {
                        b
                    }
                });
                effective_tool = Some(item);
            }
            None => return ActionResult::failure("no_capable_tool_equipped"),
        }
    }

    if let Some(target_location) = &resolution.target_location {
        let dist = distance(&intent.actor_location, target_location);
        let in_range = if let Some(tool) = &effective_tool {
            match effective_capability_range {
                Some(range) => dist <= range,
                None => tag_registry
                    .get_action_capability(tool, &intent.action_type)
                    .expect("resolved above")
                    .range_category
                    .is_in_range(dist),
            }
        } else {
            dist <= def.target_range
        };
        if !in_range {
            return ActionResult::failure(format!(
                "out_of_range: distance {dist:.1} exceeds allowed range"
            ));
        }
    }

    // Stage 5: tool validation (ammo, throw).
    if def.requires_tool {
        let tool = effective_tool.as_ref().expect("checked above");
        let capability = tag_registry
            .get_action_capability(tool, &intent.action_type)
            .expect("resolved above");
        let ammo = intent.ammo_ref.as_deref().and_then(|r| ctx.get_item(r));
        if !tag_registry.check_ammo_compatibility(capability, ammo.as_ref()) {
            return ActionResult::failure("ammo_incompatible");
        }
        if capability.range_category == crate::rules::RangeCategory::Thrown
            && !tag_registry.validate_throw(intent.strength, tool, 0.0)
        {
            return ActionResult::failure("throw_too_heavy");
        }
    }

    // Stage 6: cost check.
    if !ctx.can_afford(&intent.actor_ref, def.default_cost) {
        return ActionResult::failure("insufficient_action_cost");
    }

    // Stage 7: rules check.
    if let Err(reason) = ctx.check_rules(&intent.actor_ref, &intent.verb, resolution.target_ref.as_deref()) {
        return ActionResult::failure(reason);
    }

    // Stage 8: effect emission.
    let potency = effective_tool
        .as_ref()
        .and_then(|tool| tag_registry.get_action_capability(tool, &intent.action_type))
        .and_then(|cap| cap.damage_formula.as_deref())
        .map(|formula| evaluate_potency(formula, intent.strength, ctx))
        .unwrap_or(0.0);
    let command_text = instantiate_effect_template(
        &def.effect_template,
        intent,
        resolution.target_ref.as_deref(),
        effective_tool.as_ref(),
        potency,
    );

    // Stage 9: perception.
    let observers = ctx
        .available_targets(&intent.actor_location, def.perceptibility.radius)
        .into_iter()
        .filter(|c| {
            if def.perceptibility.visual_obscurable {
                ctx.has_line_of_sight(&intent.actor_location, &c.location)
            } else {
                true
            }
        })
        .map(|c| c.r#ref)
        .collect();

    // Stage 10: cost consumption & effect execution.
    let applied = ctx.execute_effect(&command_text).is_ok();

    ActionResult {
        success: true,
        failure_reason: None,
        effects: vec![ResolvedEffect {
            command_text,
            applied,
        }],
        confidence: Some(resolution.confidence),
        observers,
        resolved_target_ref: resolution.target_ref,
    }
}

/// Substitutes `STR` with `strength` and evaluates the result as a dice
/// expression (spec.md §8 scenario 3: `"1d8+STR"` with STR 10 rolls
/// `1d8+10`). Malformed formulas contribute zero potency rather than
/// failing the action outright.
fn evaluate_potency(formula: &str, strength: i32, ctx: &mut impl ActionContext) -> f64 {
    let substituted = formula.replace("STR", &strength.to_string());
    match crate::roller::parse_dice_expr(&substituted) {
        Ok(expr) => crate::roller::evaluate(expr, |sides| ctx.roll_die(sides)).total as f64,
        Err(_) => 0.0,
    }
}

fn instantiate_effect_template(
    template: &str,
    intent: &ActionIntent,
    target_ref: Option<&str>,
    tool: Option<&TaggedItem>,
    potency: f64,
) -> String {
    let mut text = template.to_string();
    text = text.replace("{source}", &format!("actor.{}", intent.actor_ref));
    text = text.replace("{target}", target_ref.unwrap_or("region_tile.current"));
    text = text.replace(
        "{tool}",
        tool.map(|t| t.id.as_str()).unwrap_or("none"),
    );
    text = text.replace("{potency}", &potency.to_string());
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ActionDef;
    use crate::rules::EnabledAction;
    use crate::rules::Perceptibility;
    use crate::rules::RangeCategory;
    use crate::rules::TagInstance;
    use crate::rules::TagRule;
    use crate::world::EntityKind;
    use crate::world::TilePos;

    struct FakeCtx {
        targets: Vec<TargetCandidate>,
        equipped: Vec<TaggedItem>,
        executed: Vec<String>,
        execute_should_fail: bool,
        fixed_roll: u32,
    }

    fn loc(x: i32, y: i32) -> EntityLocation {
        EntityLocation {
            world_tile: TilePos::new(0, 0),
            region_tile: TilePos::new(0, 0),
            place_id: Some("P".to_string()),
            tile: TilePos::new(x, y),
            elevation: 0.0,
        }
    }

    impl ActionContext for FakeCtx {
        fn available_targets(&self, _location: &EntityLocation, radius: f64) -> Vec<TargetCandidate> {
            self.targets
                .iter()
                .filter(|c| c.distance <= radius)
                .cloned()
                .collect()
        }
        fn check_actor_awareness(&self, _actor_ref: &str, _target_ref: &str) -> bool {
            true
        }
        fn equipped_items(&self, _actor_ref: &str) -> Vec<TaggedItem> {
            self.equipped.clone()
        }
        fn get_item(&self, item_ref: &str) -> Option<TaggedItem> {
            self.equipped.iter().find(|i| i.id == item_ref).cloned()
        }
        fn can_afford(&self, _actor_ref: &str, _cost: CostClass) -> bool {
            true
        }
        fn check_rules(&self, _actor_ref: &str, _verb: &str, _target_ref: Option<&str>) -> Result<(), String> {
            Ok(())
        }
        fn has_line_of_sight(&self, _from: &EntityLocation, _to: &EntityLocation) -> bool {
            true
        }
        fn execute_effect(&mut self, command_text: &str) -> Result<String, String> {
            self.executed.push(command_text.to_string());
            if self.execute_should_fail {
                Err("boom".to_string())
            } else {
                Ok("diff".to_string())
            }
        }
        fn roll_die(&mut self, _sides: u32) -> u32 {
            self.fixed_roll
        }
    }

    fn base_intent(verb: &str) -> ActionIntent {
        ActionIntent {
            id: "intent-1".to_string(),
            actor_ref: "p".to_string(),
            verb: verb.to_string(),
            action_type: verb.to_string(),
            source: ActionSource::PlayerInput,
            actor_location: loc(0, 0),
            explicit_ui_target: None,
            target_ref: None,
            target_type: None,
            last_target_ref: None,
            original_input: None,
            tool_ref: None,
            ammo_ref: None,
            strength: 10,
        }
    }

    fn move_registry() -> ActionRegistry {
        ActionRegistry::new(vec![ActionDef {
            verb: "MOVE".to_string(),
            target_types: vec![TargetType::Tile],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Free,
            perceptibility: Perceptibility {
                visual: true,
                auditory: false,
                radius: 10.0,
                stealth_allowed: false,
                visual_obscurable: false,
            },
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.SET_OCCUPANCY(actor={source}, location={target})".to_string(),
            target_range: 100.0,
        }])
    }

    #[test]
    fn move_within_place_succeeds() {
        let mut intent = base_intent("MOVE");
        intent.explicit_ui_target = Some("tile.2.2".to_string());
        let registry = move_registry();
        let tag_registry = TagRuleRegistry::default();
        let mut ctx = FakeCtx {
            targets: vec![TargetCandidate {
                r#ref: "tile.2.2".to_string(),
                name: "tile".to_string(),
                kind: EntityKind::Actor,
                location: loc(2, 2),
                distance: 0.0,
            }],
            equipped: vec![],
            executed: vec![],
            execute_should_fail: false,
            fixed_roll: 4,
        };
        let result = run(&intent, &registry, &tag_registry, &mut ctx);
        assert!(result.success);
        assert_eq!(ctx.executed.len(), 1);
        assert!(ctx.executed[0].contains("SET_OCCUPANCY"));
    }

    fn communicate_registry() -> ActionRegistry {
        ActionRegistry::new(vec![ActionDef {
            verb: "COMMUNICATE".to_string(),
            target_types: vec![TargetType::Any],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Free,
            perceptibility: Perceptibility {
                visual: false,
                auditory: true,
                radius: 10.0,
                stealth_allowed: false,
                visual_obscurable: false,
            },
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.ADJUST_STAT(target={target}, stat=heard, delta=1)".to_string(),
            target_range: 5.0,
        }])
    }

    #[test]
    fn communicate_out_of_range_fails_without_effects() {
        let mut intent = base_intent("COMMUNICATE");
        intent.original_input = Some("talk to guard".to_string());
        let registry = communicate_registry();
        let tag_registry = TagRuleRegistry::default();
        let mut ctx = FakeCtx {
            targets: vec![TargetCandidate {
                r#ref: "npc.guard".to_string(),
                name: "guard".to_string(),
                kind: EntityKind::Npc,
                location: loc(7, 0),
                distance: 7.0,
            }],
            equipped: vec![],
            executed: vec![],
            execute_should_fail: false,
            fixed_roll: 4,
        };
        let result = run(&intent, &registry, &tag_registry, &mut ctx);
        assert!(!result.success);
        assert!(result.failure_reason.unwrap().contains("range"));
        assert!(ctx.executed.is_empty());
    }

    fn attack_registry() -> ActionRegistry {
        ActionRegistry::new(vec![ActionDef {
            verb: "ATTACK".to_string(),
            target_types: vec![TargetType::Npc, TargetType::Actor],
            requires_tool: true,
            requires_awareness: false,
            default_cost: CostClass::Full,
            perceptibility: Perceptibility {
                visual: true,
                auditory: true,
                radius: 20.0,
                stealth_allowed: false,
                visual_obscurable: false,
            },
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.APPLY_DAMAGE(target={target}, source={source}, tool={tool}, potency={potency})".to_string(),
            target_range: 0.0,
        }])
    }

    fn longbow() -> TaggedItem {
        TaggedItem {
            id: "item.longbow_1".to_string(),
            weight: 3.0,
            tags: vec![TagInstance {
                name: "bow".to_string(),
                stacks: 3,
                value: None,
                source: None,
                expiry: None,
            }],
        }
    }

    fn bow_registry() -> TagRuleRegistry {
        TagRuleRegistry::new(vec![TagRule {
            name: "bow".to_string(),
            meta_tags: vec![],
            enabled_actions: vec![EnabledAction {
                action_type: "ATTACK".to_string(),
                range_category: RangeCategory::Projectile,
                base_range_override: None,
                damage_formula: Some("1d8+STR".to_string()),
                proficiencies: vec![],
                ammo_requirement: Some("arrow".to_string()),
            }],
            scaling_per_stack: 2.0,
            max_stacks: 5,
            generation_cost: 0.0,
        }])
    }

    #[test]
    fn projectile_attack_at_bandit_within_range_succeeds() {
        let mut intent = base_intent("ATTACK");
        intent.explicit_ui_target = Some("npc.bandit".to_string());
        intent.ammo_ref = Some("item.arrow_1".to_string());
        let registry = attack_registry();
        let tag_registry = bow_registry();
        let arrow = TaggedItem {
            id: "item.arrow_1".to_string(),
            weight: 0.1,
            tags: vec![TagInstance {
                name: "arrow".to_string(),
                stacks: 1,
                value: None,
                source: None,
                expiry: None,
            }],
        };
        let mut ctx = FakeCtx {
            targets: vec![TargetCandidate {
                r#ref: "npc.bandit".to_string(),
                name: "bandit".to_string(),
                kind: EntityKind::Npc,
                location: loc(7, 1),
                distance: 7.1,
            }],
            equipped: vec![longbow(), arrow],
            executed: vec![],
            execute_should_fail: false,
            fixed_roll: 4,
        };
        let result = run(&intent, &registry, &tag_registry, &mut ctx);
        assert!(result.success, "{:?}", result.failure_reason);
        assert_eq!(ctx.executed.len(), 1);
        assert!(ctx.executed[0].contains("APPLY_DAMAGE"));
        assert!(ctx.executed[0].contains("npc.bandit"));
        // potency comes from damage_formula "1d8+STR" (roll 4, STR 10), not
        // from the weapon's range.
        assert!(ctx.executed[0].contains("potency=14"));
    }

    #[test]
    fn executor_failure_flags_effect_unapplied_but_pipeline_still_succeeds() {
        let mut intent = base_intent("MOVE");
        intent.explicit_ui_target = Some("tile.1.1".to_string());
        let registry = move_registry();
        let tag_registry = TagRuleRegistry::default();
        let mut ctx = FakeCtx {
            targets: vec![TargetCandidate {
                r#ref: "tile.1.1".to_string(),
                name: "tile".to_string(),
                kind: EntityKind::Actor,
                location: loc(1, 1),
                distance: 0.0,
            }],
            equipped: vec![],
            executed: vec![],
            execute_should_fail: true,
            fixed_roll: 4,
        };
        let result = run(&intent, &registry, &tag_registry, &mut ctx);
        assert!(result.success);
        assert!(!result.effects[0].applied);
    }
}
