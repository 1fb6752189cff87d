//! Built-in action registry seed.
//!
//! spec.md §3 describes an external "Action Registry" data file (outside
//! this build's scope — see spec.md §1's filesystem-data-templates
//! exclusion). This gives the action pipeline (C5) something to resolve
//! verbs against out of the box, grounded on the same five verbs the
//! renderer (`core/src/renderer.rs`) already special-cases prompts for.

use loom_core::rules::ActionDef;
use loom_core::rules::CostClass;
use loom_core::rules::HostilityConstraint;
use loom_core::rules::Perceptibility;
use loom_core::rules::TargetType;

fn perceptibility(radius: f64, visual_obscurable: bool) -> Perceptibility {
    Perceptibility {
        visual: true,
        auditory: true,
        radius,
        stealth_allowed: false,
        visual_obscurable,
    }
}

/// The five verbs the renderer already has prompt variants for, plus the
/// two spec.md §4.5 step 1d default-target verbs (DEFEND, HELP).
pub fn default_action_defs() -> Vec<ActionDef> {
    vec![
        ActionDef {
            verb: "INSPECT".to_string(),
            target_types: vec![TargetType::Any],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Free,
            perceptibility: perceptibility(10.0, false),
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.SET_AWARENESS(observer={source}, target={target}, aware=true)"
                .to_string(),
            target_range: 20.0,
        },
        ActionDef {
            verb: "ATTACK".to_string(),
            target_types: vec![TargetType::Actor, TargetType::Npc],
            requires_tool: true,
            requires_awareness: true,
            default_cost: CostClass::Full,
            perceptibility: perceptibility(15.0, true),
            hostility: HostilityConstraint::RequiresHostile,
            effect_template: "SYSTEM.APPLY_DAMAGE(target={target}, source={source}, tool={tool}, potency={potency})"
                .to_string(),
            target_range: 2.0,
        },
        ActionDef {
            verb: "COMMUNICATE".to_string(),
            target_types: vec![TargetType::Any],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Partial,
            perceptibility: perceptibility(12.0, false),
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.SET_AWARENESS(observer={target}, target={source}, aware=true)"
                .to_string(),
            target_range: 12.0,
        },
        ActionDef {
            verb: "MOVE".to_string(),
            target_types: vec![TargetType::Tile],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Partial,
            perceptibility: perceptibility(8.0, false),
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.SET_OCCUPANCY(actor={source}, location={target})".to_string(),
            target_range: 6.0,
        },
        ActionDef {
            verb: "USE".to_string(),
            target_types: vec![TargetType::Item, TargetType::Any],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Full,
            perceptibility: perceptibility(10.0, false),
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.ADJUST_RESOURCE(target={source}, resource=used_item, delta=1)"
                .to_string(),
            target_range: 1.0,
        },
        ActionDef {
            verb: "DEFEND".to_string(),
            target_types: vec![TargetType::Any],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Partial,
            perceptibility: perceptibility(5.0, false),
            hostility: HostilityConstraint::None,
            effect_template: "SYSTEM.APPLY_TAG(target={source}, tag=defending, stacks=1)".to_string(),
            target_range: 0.0,
        },
        ActionDef {
            verb: "HELP".to_string(),
            target_types: vec![TargetType::Actor, TargetType::Npc],
            requires_tool: false,
            requires_awareness: false,
            default_cost: CostClass::Full,
            perceptibility: perceptibility(10.0, false),
            hostility: HostilityConstraint::RequiresFriendly,
            effect_template: "SYSTEM.APPLY_HEAL(target={target}, amount={potency})".to_string(),
            target_range: 2.0,
        },
    ]
}
