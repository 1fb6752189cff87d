//! C9 — Roller.
//!
//! Dice-expression evaluation plus the small pending-request queue that
//! gates player-initiated rolls, one at a time, mirroring how the teacher
//! threads a single `ModelClient` request at a time through
//! `core/src/client.rs` rather than fanning out concurrent calls.

use std::collections::VecDeque;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiceExpr {
    pub count: u32,
    pub sides: u32,
    pub modifier: i64,
}

/// Parses `NdM`, `NdM+K`, or `NdM-K` (count defaults to 1 when omitted:
/// `dM`). spec.md §4.9 "dice expressions are parsed into face arrays
/// (variable count) and a base value".
pub fn parse_dice_expr(expr: &str) -> Result<DiceExpr, CoreError> {
    let expr = expr.trim();
    let (count_str, rest) = expr.split_once('d').ok_or_else(|| parse_err(expr))?;

    let count = if count_str.is_empty() {
        1
    } else {
        count_str.parse().map_err(|_| parse_err(expr))?
    };

    let (sides_str, modifier) = if let Some((s, m)) = rest.split_once('+') {
        (s, m.parse::<i64>().map_err(|_| parse_err(expr))?)
    } else if let Some((s, m)) = rest.rsplit_once('-') {
        (s, -m.parse::<i64>().map_err(|_| parse_err(expr))?)
    } else {
        (rest, 0)
    };
    let sides: u32 = sides_str.parse().map_err(|_| parse_err(expr))?;
    if sides == 0 || count == 0 {
        return Err(parse_err(expr));
    }

    Ok(DiceExpr {
        count,
        sides,
        modifier,
    })
}

fn parse_err(expr: &str) -> CoreError {
    CoreError::ParseError {
        line: 0,
        message: format!("invalid dice expression '{expr}'"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollOutcome {
    pub faces: Vec<u32>,
    pub base: i64,
    pub total: i64,
}

/// Rolls `expr` using `roll_die` for each individual die (injected so
/// tests can supply a deterministic sequence instead of `rand`).
pub fn evaluate(expr: DiceExpr, mut roll_die: impl FnMut(u32) -> u32) -> RollOutcome {
    let faces: Vec<u32> = (0..expr.count).map(|_| roll_die(expr.sides)).collect();
    let base: i64 = faces.iter().map(|&f| f as i64).sum();
    RollOutcome {
        total: base + expr.modifier,
        base,
        faces,
    }
}

pub fn roll_with_rng(expr: DiceExpr) -> RollOutcome {
    use rand::Rng;
    let mut rng = rand::rng();
    evaluate(expr, |sides| rng.random_range(1..=sides))
}

#[derive(Debug, Clone)]
pub struct RollRequest {
    pub roll_id: String,
    pub dice_label: String,
    pub expression: String,
    pub rolled_by_player: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollResult {
    pub roll_id: String,
    pub faces: Vec<u32>,
    pub base: i64,
    pub total: i64,
}

/// What the worker should do after handling a roll envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollerAction {
    /// Immediate (non-player) roll resolved synchronously.
    Resolved(RollResult),
    /// A player roll was queued; the roller status file should surface it
    /// if it's now the active one.
    Queued,
    /// `roll_input_*` matched no pending request.
    NoMatch,
}

/// spec.md §4.9: only one active player roll at a time.
#[derive(Debug, Default)]
pub struct RollerState {
    pending: VecDeque<RollRequest>,
}

impl RollerState {
    pub fn new() -> Self {
        RollerState::default()
    }

    /// The request currently surfaced to the UI, if any.
    pub fn active(&self) -> Option<&RollRequest> {
        self.pending.front()
    }

    /// `roll_request_*`: queue if player-initiated, else resolve now.
    pub fn handle_roll_request(
        &mut self,
        request: RollRequest,
        roll_die: impl FnMut(u32) -> u32,
    ) -> Result<RollerAction, CoreError> {
        if request.rolled_by_player {
            self.pending.push_back(request);
            Ok(RollerAction::Queued)
        } else {
            let expr = parse_dice_expr(&request.expression)?;
            let outcome = evaluate(expr, roll_die);
            Ok(RollerAction::Resolved(RollResult {
                roll_id: request.roll_id,
                faces: outcome.faces,
                base: outcome.base,
                total: outcome.total,
            }))
        }
    }

    /// `roll_input_*`: resolve the pending request matching `roll_id`,
    /// advancing to the next queued player roll if any.
    pub fn handle_roll_input(
        &mut self,
        roll_id: &str,
        roll_die: impl FnMut(u32) -> u32,
    ) -> Result<RollerAction, CoreError> {
        let Some(pos) = self.pending.iter().position(|r| r.roll_id == roll_id) else {
            return Ok(RollerAction::NoMatch);
        };
        let request = self.pending.remove(pos).expect("position was just found");
        let expr = parse_dice_expr(&request.expression)?;
        let outcome = evaluate(expr, roll_die);
        Ok(RollerAction::Resolved(RollResult {
            roll_id: request.roll_id,
            faces: outcome.faces,
            base: outcome.base,
            total: outcome.total,
        }))
    }

    /// Builds the status-file projection for the currently active request.
    pub fn status(&self, updated_at: String) -> loom_protocol::RollerStatus {
        match self.active() {
            Some(req) => loom_protocol::RollerStatus {
                schema_version: loom_protocol::SCHEMA_VERSION,
                spinner: String::new(),
                last_player_roll: None,
                dice_label: Some(req.dice_label.clone()),
                disabled: false,
                roll_id: Some(req.roll_id.clone()),
                updated_at,
            },
            None => loom_protocol::RollerStatus {
                schema_version: loom_protocol::SCHEMA_VERSION,
                disabled: true,
                updated_at,
                ..Default::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_rolls(values: &[u32]) -> impl FnMut(u32) -> u32 + '_ {
        let mut iter = values.iter().copied();
        move |_sides| iter.next().expect("enough fixed rolls supplied")
    }

    #[test]
    fn parses_basic_expression() {
        let expr = parse_dice_expr("2d6+3").unwrap();
        assert_eq!(expr, DiceExpr { count: 2, sides: 6, modifier: 3 });
    }

    #[test]
    fn parses_implicit_count_and_negative_modifier() {
        let expr = parse_dice_expr("d20-2").unwrap();
        assert_eq!(expr, DiceExpr { count: 1, sides: 20, modifier: -2 });
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(parse_dice_expr("not-dice").is_err());
        assert!(parse_dice_expr("2d0").is_err());
    }

    #[test]
    fn evaluate_sums_faces_and_applies_modifier() {
        let expr = parse_dice_expr("3d6+1").unwrap();
        let outcome = evaluate(expr, fixed_rolls(&[2, 3, 4]));
        assert_eq!(outcome.faces, vec![2, 3, 4]);
        assert_eq!(outcome.base, 9);
        assert_eq!(outcome.total, 10);
    }

    #[test]
    fn non_player_request_resolves_immediately() {
        let mut state = RollerState::new();
        let request = RollRequest {
            roll_id: "r1".to_string(),
            dice_label: "Attack".to_string(),
            expression: "1d20+5".to_string(),
            rolled_by_player: false,
        };
        let action = state
            .handle_roll_request(request, fixed_rolls(&[15]))
            .unwrap();
        assert_eq!(
            action,
            RollerAction::Resolved(RollResult {
                roll_id: "r1".to_string(),
                faces: vec![15],
                base: 15,
                total: 20,
            })
        );
        assert!(state.active().is_none());
    }

    #[test]
    fn player_request_is_queued_then_resolved_on_input() {
        let mut state = RollerState::new();
        let request = RollRequest {
            roll_id: "r1".to_string(),
            dice_label: "Damage".to_string(),
            expression: "1d8".to_string(),
            rolled_by_player: true,
        };
        let action = state
            .handle_roll_request(request, fixed_rolls(&[]))
            .unwrap();
        assert_eq!(action, RollerAction::Queued);
        assert_eq!(state.active().unwrap().roll_id, "r1");

        let action = state.handle_roll_input("r1", fixed_rolls(&[6])).unwrap();
        assert_eq!(
            action,
            RollerAction::Resolved(RollResult {
                roll_id: "r1".to_string(),
                faces: vec![6],
                base: 6,
                total: 6,
            })
        );
        assert!(state.active().is_none());
    }

    #[test]
    fn second_queued_roll_becomes_active_after_first_resolves() {
        let mut state = RollerState::new();
        for id in ["r1", "r2"] {
            let request = RollRequest {
                roll_id: id.to_string(),
                dice_label: "Save".to_string(),
                expression: "1d20".to_string(),
                rolled_by_player: true,
            };
            state.handle_roll_request(request, fixed_rolls(&[])).unwrap();
        }
        assert_eq!(state.active().unwrap().roll_id, "r1");
        state.handle_roll_input("r1", fixed_rolls(&[10])).unwrap();
        assert_eq!(state.active().unwrap().roll_id, "r2");
    }

    #[test]
    fn roll_input_with_no_match_reports_no_match() {
        let mut state = RollerState::new();
        let action = state.handle_roll_input("missing", fixed_rolls(&[])).unwrap();
        assert_eq!(action, RollerAction::NoMatch);
    }

    #[test]
    fn status_reflects_disabled_state_when_empty() {
        let state = RollerState::new();
        let status = state.status("2024-01-01T00:00:00Z".to_string());
        assert!(status.disabled);
        assert!(status.roll_id.is_none());
    }
}
