//! C7 — Reference resolver.
//!
//! Parses and resolves the small ref grammar used throughout effect
//! expressions and action targets. Grounded on the teacher's
//! `apply-patch/src/parser.rs` approach to hand-rolled, line-grammar
//! parsing (no parser-combinator crate, a `Peekable`-style scan over
//! `.`-delimited segments) and its two-tier error/warning split in
//! `core/src/safety.rs` (`SafetyCheck::Ask` vs `::Reject`).

use std::collections::HashMap;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Actor,
    Npc,
    WorldTile,
    RegionTile,
    Tile,
    Item,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRef {
    pub kind: RefKind,
    pub raw: String,
    /// `.`-delimited segments after the kind prefix.
    pub segments: Vec<String>,
    /// For item refs embedded in a longer path (`actor.p.inventory.item_3`),
    /// the leading segments identifying the owner.
    pub owner_path: Option<Vec<String>>,
}

/// Parses one of: `actor.<id>`, `npc.<id>`, `world_tile.<x>.<y>`,
/// `region_tile.<wx>.<wy>.<rx>.<ry>`, `tile.<wx>.<wy>.<rx>.<ry>.<x>.<y>`,
/// or any ref containing an `item_<n>` segment (spec.md §4.7).
pub fn parse_ref(raw: &str) -> Option<ParsedRef> {
    let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
    if segments.is_empty() {
        return None;
    }

    if let Some(item_idx) = segments.iter().position(|s| is_item_segment(s)) {
        return Some(ParsedRef {
            kind: RefKind::Item,
            raw: raw.to_string(),
            segments: segments[item_idx..].to_vec(),
            owner_path: if item_idx > 0 {
                Some(segments[..item_idx].to_vec())
            } else {
                None
            },
        });
    }

    match segments[0].as_str() {
        "actor" if segments.len() == 2 => Some(ParsedRef {
            kind: RefKind::Actor,
            raw: raw.to_string(),
            segments: segments[1..].to_vec(),
            owner_path: None,
        }),
        "npc" if segments.len() == 2 => Some(ParsedRef {
            kind: RefKind::Npc,
            raw: raw.to_string(),
            segments: segments[1..].to_vec(),
            owner_path: None,
        }),
        "world_tile" if segments.len() == 3 => Some(ParsedRef {
            kind: RefKind::WorldTile,
            raw: raw.to_string(),
            segments: segments[1..].to_vec(),
            owner_path: None,
        }),
        "region_tile" if segments.len() == 5 => Some(ParsedRef {
            kind: RefKind::RegionTile,
            raw: raw.to_string(),
            segments: segments[1..].to_vec(),
            owner_path: None,
        }),
        "tile" if segments.len() == 7 => Some(ParsedRef {
            kind: RefKind::Tile,
            raw: raw.to_string(),
            segments: segments[1..].to_vec(),
            owner_path: None,
        }),
        _ => None,
    }
}

fn is_item_segment(segment: &str) -> bool {
    segment
        .strip_prefix("item_")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

#[derive(Debug, Clone)]
pub struct ResolvedRef {
    pub id: String,
    pub kind: RefKind,
    /// Storage path, present on success or on a representative placeholder.
    pub path: Option<String>,
    /// True when this entry is a representative placeholder, not a real
    /// lookup hit.
    pub representative: bool,
    pub owner: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ResolveOutput {
    pub resolved: HashMap<String, ResolvedRef>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Whether a parsed ref's target exists in storage, and its canonical path
/// if so. Implemented by the caller so this module stays I/O-free.
pub trait RefExistence {
    fn exists(&self, parsed: &ParsedRef) -> Option<String>;
}

/// spec.md §4.7: resolves every ref in `raw_refs`, downgrading missing
/// entities from error to warning when `use_representative_data` is set
/// (returning a placeholder path). Item refs with an unresolvable owner
/// always error unless representative mode is on.
pub fn resolve(
    raw_refs: &[String],
    use_representative_data: bool,
    existence: &impl RefExistence,
) -> ResolveOutput {
    let mut out = ResolveOutput::default();

    for raw in raw_refs {
        let Some(parsed) = parse_ref(raw) else {
            out.errors.push(format!("unrecognized_ref: {raw}"));
            continue;
        };

        let owner = parsed
            .owner_path
            .as_ref()
            .map(|segs| segs.join("."));

        if parsed.kind == RefKind::Item && owner.is_none() {
            if use_representative_data {
                out.warnings
                    .push(format!("item_ref_missing_owner_representative: {raw}"));
                out.resolved.insert(
                    raw.clone(),
                    ResolvedRef {
                        id: raw.clone(),
                        kind: parsed.kind,
                        path: Some(format!("representative/{raw}")),
                        representative: true,
                        owner: None,
                    },
                );
            } else {
                out.errors.push(format!("item_ref_missing_owner: {raw}"));
            }
            continue;
        }

        match existence.exists(&parsed) {
            Some(path) => {
                out.resolved.insert(
                    raw.clone(),
                    ResolvedRef {
                        id: raw.clone(),
                        kind: parsed.kind,
                        path: Some(path),
                        representative: false,
                        owner,
                    },
                );
            }
            None if use_representative_data => {
                out.warnings.push(format!("unresolved_ref_representative: {raw}"));
                out.resolved.insert(
                    raw.clone(),
                    ResolvedRef {
                        id: raw.clone(),
                        kind: parsed.kind,
                        path: Some(format!("representative/{raw}")),
                        representative: true,
                        owner,
                    },
                );
            }
            None => {
                out.errors.push(format!("unresolved_ref: {raw}"));
            }
        }
    }

    out
}

/// Strict-mode convenience for C8: any error turns the whole batch into a
/// single [`CoreError::UnresolvedRef`].
pub fn resolve_strict(
    raw_refs: &[String],
    existence: &impl RefExistence,
) -> Result<HashMap<String, ResolvedRef>, CoreError> {
    let out = resolve(raw_refs, false, existence);
    if let Some(first) = out.errors.into_iter().next() {
        return Err(CoreError::UnresolvedRef(first));
    }
    Ok(out.resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeExistence;
    impl RefExistence for FakeExistence {
        fn exists(&self, parsed: &ParsedRef) -> Option<String> {
            match parsed.kind {
                RefKind::Actor if parsed.segments == ["p"] => Some("actors/p.jsonc".to_string()),
                RefKind::Npc if parsed.segments == ["guard"] => Some("npcs/guard.jsonc".to_string()),
                _ => None,
            }
        }
    }

    #[test]
    fn parses_actor_and_npc_refs() {
        let actor = parse_ref("actor.p").unwrap();
        assert_eq!(actor.kind, RefKind::Actor);
        let npc = parse_ref("npc.guard").unwrap();
        assert_eq!(npc.kind, RefKind::Npc);
    }

    #[test]
    fn parses_tile_refs_by_segment_count() {
        assert_eq!(parse_ref("world_tile.3.4").unwrap().kind, RefKind::WorldTile);
        assert_eq!(
            parse_ref("region_tile.3.4.1.2").unwrap().kind,
            RefKind::RegionTile
        );
        assert_eq!(
            parse_ref("tile.3.4.1.2.5.6").unwrap().kind,
            RefKind::Tile
        );
    }

    #[test]
    fn parses_item_ref_with_owner_path() {
        let parsed = parse_ref("actor.p.inventory.item_3").unwrap();
        assert_eq!(parsed.kind, RefKind::Item);
        assert_eq!(
            parsed.owner_path,
            Some(vec!["actor".to_string(), "p".to_string(), "inventory".to_string()])
        );
    }

    #[test]
    fn resolves_known_refs() {
        let out = resolve(&["actor.p".to_string()], false, &FakeExistence);
        assert!(out.errors.is_empty());
        assert!(out.resolved.contains_key("actor.p"));
    }

    #[test]
    fn unresolved_ref_errors_without_representative_mode() {
        let out = resolve(&["npc.ghost".to_string()], false, &FakeExistence);
        assert_eq!(out.errors.len(), 1);
        assert!(out.resolved.is_empty());
    }

    #[test]
    fn unresolved_ref_warns_with_representative_mode() {
        let out = resolve(&["npc.ghost".to_string()], true, &FakeExistence);
        assert!(out.errors.is_empty());
        assert_eq!(out.warnings.len(), 1);
        let resolved = &out.resolved["npc.ghost"];
        assert!(resolved.representative);
    }

    #[test]
    fn item_ref_without_owner_errors_unless_representative() {
        let out = resolve(&["item_5".to_string()], false, &FakeExistence);
        assert_eq!(out.errors.len(), 1);

        let out_rep = resolve(&["item_5".to_string()], true, &FakeExistence);
        assert!(out_rep.errors.is_empty());
        assert_eq!(out_rep.warnings.len(), 1);
    }
}
