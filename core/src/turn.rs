//! C12 — Turn state machine.
//!
//! Phases and transitions as an explicit enum plus mutating methods, the
//! same treatment spec.md §9 asks for queues: "model as a small state
//! machine with explicit insertion... tests drive each transition
//! directly." Grounded on `protocol/src/protocol.rs`'s `TaskState`/`Op`
//! enums for the phase vocabulary and on `core/src/codex.rs`'s
//! single-current-task bookkeeping for the current-actor pointer.

use std::collections::HashMap;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    InitiativeRoll,
    TurnStart,
    ActionSelection,
    ActionResolution,
    TurnEnd,
    EventEndCheck,
    EventEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Combat,
    Conversation,
    Exploration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldAction {
    pub actor_ref: String,
    pub trigger: String,
    pub priority: i32,
    pub action_intent_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    pub actor_ref: String,
    pub reacts_to_turn: u32,
    pub priority: i32,
    pub payload: String,
}

#[derive(Debug, Clone)]
pub struct TurnState {
    pub phase: Phase,
    pub current_turn: u32,
    pub current_actor_ref: Option<String>,
    pub initiative_order: Vec<String>,
    pub completed_actors: HashSet<String>,
    pub held_actions: HashMap<String, HeldAction>,
    pub reactions_queue: Vec<Reaction>,
    pub turn_start_time_ms: Option<i64>,
    pub event_id: String,
    pub event_type: EventType,
    pub round_number: u32,
    pub turn_duration_limit_ms: Option<u64>,
}

impl TurnState {
    /// Orders `initiative_scores` descending, stable on ties (spec.md
    /// §4.12 "participants ordered by an externally-supplied score map
    /// (descending), stable for ties").
    pub fn new(
        event_id: String,
        event_type: EventType,
        participants_in_order: &[String],
        initiative_scores: &HashMap<String, i32>,
    ) -> Self {
        let mut order = participants_in_order.to_vec();
        order.sort_by_key(|actor| std::cmp::Reverse(*initiative_scores.get(actor).unwrap_or(&0)));

        TurnState {
            phase: Phase::InitiativeRoll,
            current_turn: 1,
            current_actor_ref: order.first().cloned(),
            initiative_order: order,
            completed_actors: HashSet::new(),
            held_actions: HashMap::new(),
            reactions_queue: Vec::new(),
            turn_start_time_ms: None,
            event_id,
            event_type,
            round_number: 1,
            turn_duration_limit_ms: None,
        }
    }

    pub fn start_round(&mut self, now_ms: i64) {
        self.phase = Phase::TurnStart;
        self.turn_start_time_ms = Some(now_ms);
    }

    pub fn begin_action_selection(&mut self) {
        self.phase = Phase::ActionSelection;
    }

    pub fn begin_action_resolution(&mut self) {
        self.phase = Phase::ActionResolution;
    }

    /// ACTION_RESOLUTION may return to ACTION_SELECTION for chained
    /// actions within the same turn (spec.md §4.12).
    pub fn return_to_action_selection(&mut self) {
        self.phase = Phase::ActionSelection;
    }

    /// Marks the current actor done and advances. When
    /// `completed_actors == initiative_order`, rolls the round over:
    /// increment `round_number`, clear `completed_actors`, restart at
    /// `current_turn = 1` (spec.md §4.12, scenario 5).
    pub fn complete_current_actor(&mut self) {
        if let Some(actor) = self.current_actor_ref.clone() {
            self.completed_actors.insert(actor);
        }

        if self.completed_actors.len() >= self.initiative_order.len() {
            self.round_number += 1;
            self.completed_actors.clear();
            self.current_turn = 1;
        } else {
            self.current_turn = if self.current_turn as usize >= self.initiative_order.len() {
                1
            } else {
                self.current_turn + 1
            };
        }

        self.current_actor_ref = self
            .initiative_order
            .get(self.current_turn as usize - 1)
            .cloned();
        self.phase = Phase::TurnEnd;
    }

    /// `is_turn_timer_expired`: true once `elapsed_ms` since
    /// `turn_start_time_ms` exceeds the configured limit. Always false
    /// with no limit set.
    pub fn is_turn_timer_expired(&self, now_ms: i64) -> bool {
        match (self.turn_duration_limit_ms, self.turn_start_time_ms) {
            (Some(limit), Some(start)) => (now_ms - start) as u64 >= limit,
            _ => false,
        }
    }

    pub fn queue_held_action(&mut self, held: HeldAction) {
        self.held_actions.insert(held.actor_ref.clone(), held);
    }

    /// Releases the highest-priority held action whose trigger is a
    /// case-insensitive substring of `observed_event`, or vice versa
    /// (spec.md §4.12).
    pub fn release_held_action(&mut self, observed_event: &str) -> Option<HeldAction> {
        let observed_lower = observed_event.to_lowercase();
        let matched_actor = self
            .held_actions
            .values()
            .filter(|h| {
                let trigger_lower = h.trigger.to_lowercase();
                observed_lower.contains(&trigger_lower) || trigger_lower.contains(&observed_lower)
            })
            .max_by_key(|h| h.priority)
            .map(|h| h.actor_ref.clone());

        matched_actor.and_then(|actor| self.held_actions.remove(&actor))
    }

    pub fn push_reaction(&mut self, reaction: Reaction) {
        self.reactions_queue.push(reaction);
    }

    /// Drains the reaction queue highest-priority-first; the queue is
    /// cleared on read (spec.md §4.12).
    pub fn drain_reactions(&mut self) -> Vec<Reaction> {
        let mut drained = std::mem::take(&mut self.reactions_queue);
        drained.sort_by_key(|r| std::cmp::Reverse(r.priority));
        drained
    }

    /// EVENT_END_CHECK: transitions to EVENT_END when `should_end` (an
    /// externally-supplied condition — all hostiles down, conversation
    /// closed, …), otherwise continues at TURN_START for the next actor.
    pub fn event_end_check(&mut self, should_end: bool) {
        self.phase = if should_end {
            Phase::EventEnd
        } else {
            Phase::TurnStart
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, i32)]) -> HashMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn initiative_order_is_descending_and_stable() {
        let participants = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 18), ("B", 12), ("C", 9)]),
        );
        assert_eq!(turn.initiative_order, vec!["A", "B", "C"]);
        assert_eq!(turn.current_actor_ref.as_deref(), Some("A"));
    }

    #[test]
    fn round_rolls_over_after_all_complete() {
        let participants = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let mut turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 18), ("B", 12), ("C", 9)]),
        );
        turn.complete_current_actor(); // A done
        turn.complete_current_actor(); // B done
        turn.complete_current_actor(); // C done -> rollover
        assert_eq!(turn.round_number, 2);
        assert_eq!(turn.current_actor_ref.as_deref(), Some("A"));
        assert!(turn.completed_actors.is_empty());
    }

    #[test]
    fn turn_timer_expiry() {
        let participants = vec!["A".to_string()];
        let mut turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 10)]),
        );
        turn.turn_duration_limit_ms = Some(5_000);
        turn.start_round(1_000);
        assert!(!turn.is_turn_timer_expired(3_000));
        assert!(turn.is_turn_timer_expired(6_500));
    }

    #[test]
    fn held_action_releases_on_substring_match_highest_priority_first() {
        let participants = vec!["A".to_string(), "B".to_string()];
        let mut turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 10), ("B", 10)]),
        );
        turn.queue_held_action(HeldAction {
            actor_ref: "A".to_string(),
            trigger: "enters door".to_string(),
            priority: 1,
            action_intent_id: "intent-a".to_string(),
        });
        turn.queue_held_action(HeldAction {
            actor_ref: "B".to_string(),
            trigger: "door".to_string(),
            priority: 5,
            action_intent_id: "intent-b".to_string(),
        });
        let released = turn.release_held_action("the bandit enters door quickly").unwrap();
        assert_eq!(released.actor_ref, "B");
        assert_eq!(turn.held_actions.len(), 1);
    }

    #[test]
    fn reactions_drain_highest_priority_first_and_clear() {
        let participants = vec!["A".to_string()];
        let mut turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 10)]),
        );
        turn.push_reaction(Reaction {
            actor_ref: "A".to_string(),
            reacts_to_turn: 1,
            priority: 1,
            payload: "low".to_string(),
        });
        turn.push_reaction(Reaction {
            actor_ref: "A".to_string(),
            reacts_to_turn: 1,
            priority: 9,
            payload: "high".to_string(),
        });
        let drained = turn.drain_reactions();
        assert_eq!(drained[0].payload, "high");
        assert!(turn.reactions_queue.is_empty());
    }

    #[test]
    fn event_end_check_branches_on_condition() {
        let participants = vec!["A".to_string()];
        let mut turn = TurnState::new(
            "evt".to_string(),
            EventType::Combat,
            &participants,
            &scores(&[("A", 10)]),
        );
        turn.event_end_check(false);
        assert_eq!(turn.phase, Phase::TurnStart);
        turn.event_end_check(true);
        assert_eq!(turn.phase, Phase::EventEnd);
    }
}
