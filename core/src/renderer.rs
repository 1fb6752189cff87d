//! C10 — Renderer worker.
//!
//! AI invocation itself is out of scope (spec.md §1); this module only
//! owns the deterministic parts around that call — claim eligibility,
//! prompt assembly, and the envelope bookkeeping on the way out — so the
//! worker loop's only `async` suspension point is the [`crate::ai::AiProvider`]
//! call itself, the same seam `core/src/codex.rs` draws around
//! `ModelClient::stream`.

use std::collections::VecDeque;

use loom_protocol::Envelope;
use loom_protocol::EnvelopeBuilder;
use loom_protocol::Stage;
use loom_protocol::Status;

use crate::ai::sanitize_narration;
use crate::effects::parse_machine_text;

/// One exchange (utterance or narration line) kept for prompt context.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// Session-scoped rolling window, bounded to the last `CAPACITY` entries
/// (spec.md §4.10 "bounded (≤12) conversation history").
#[derive(Debug, Clone, Default)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
}

const CAPACITY: usize = 12;

impl ConversationHistory {
    pub fn new() -> Self {
        ConversationHistory::default()
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > CAPACITY {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }
}

/// Whether a renderer tick should claim this envelope (spec.md §4.10):
/// stage begins `applied_`, `meta.rendered` absent, status sent or done.
pub fn should_claim(envelope: &Envelope) -> bool {
    envelope.stage.starts_with("applied_")
        && !envelope.meta.rendered
        && matches!(envelope.status, Status::Sent | Status::Done)
}

/// Builds the AI prompt for one `applied_*` envelope. The opening line
/// varies per verb (spec.md §4.10); everything else — the raw utterance,
/// the effect lines, and trailing history — is common.
pub fn build_prompt(envelope: &Envelope, history: &ConversationHistory) -> String {
    let verb = envelope.meta.action_verb.as_deref().unwrap_or("");
    let mut lines = Vec::new();
    lines.push(opening_line(verb, &envelope.content));

    if let Some(effects_text) = &envelope.meta.effects {
        match parse_machine_text(effects_text) {
            Ok(commands) if !commands.is_empty() => {
                lines.push("Effects:".to_string());
                for command in &commands {
                    lines.push(format!("- {}", command.format()));
                }
            }
            _ => {}
        }
    }

    if history.entries().next().is_some() {
        lines.push("Recent history:".to_string());
        for entry in history.entries() {
            lines.push(format!("{}: {}", entry.role, entry.content));
        }
    }

    lines.join("\n")
}

fn opening_line(verb: &str, content: &str) -> String {
    match verb {
        "INSPECT" => format!("Narrate what the character notices. Action: {content}"),
        "ATTACK" => format!("Narrate the combat exchange in second person. Action: {content}"),
        "COMMUNICATE" => format!("Narrate the dialogue beat, staying in the world's voice. Action: {content}"),
        "MOVE" => format!("Narrate the movement briefly, one or two sentences. Action: {content}"),
        "USE" => format!("Narrate the item's effect on the scene. Action: {content}"),
        _ => format!("Narrate the outcome of this action. Action: {content}"),
    }
}

/// The two envelopes produced by a successful render: the source, marked
/// `rendered`/`done`, and a new `rendered_1` envelope queued to the inbox.
pub struct RenderOutcome {
    pub updated_source: Envelope,
    pub rendered_envelope: Envelope,
    pub history_entry: HistoryEntry,
}

/// Finalizes a successful AI response (spec.md §4.10): sanitizes the raw
/// text, stamps the source envelope, and builds the outgoing narration
/// envelope. `narration` is empty on an AI error — the fallback text
/// still gets written and the source is still marked done, per spec.
pub fn finalize(
    mut source: Envelope,
    raw_narration: &str,
    index: u32,
    session_id: Option<&str>,
) -> RenderOutcome {
    let narration = sanitize_narration(raw_narration);

    source.meta.rendered = true;
    source.status = Status::Done;

    let builder = EnvelopeBuilder {
        sender: "renderer_ai".to_string(),
        content: narration.clone(),
        stage: Some(Stage::new("rendered", 1)),
        status: Some(Status::Sent),
        correlation_id: Some(source.correlation_id.clone()),
        conversation_id: source.conversation_id.clone(),
        ..Default::default()
    };
    let rendered_envelope = crate::envelope::new(builder, index, session_id);

    RenderOutcome {
        updated_source: source,
        rendered_envelope,
        history_entry: HistoryEntry {
            role: "narrator".to_string(),
            content: narration,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_protocol::Meta;
    use loom_protocol::Priority;

    fn applied_envelope(verb: &str, effects: &str) -> Envelope {
        Envelope {
            id: "2024-01-01T00:00:00Z : 000001 : AAAAAA".to_string(),
            sender: "state_applier".to_string(),
            content: "inspect the altar".to_string(),
            kind: None,
            stage: Stage::new("applied", 1),
            slot: None,
            correlation_id: "corr-1".to_string(),
            reply_to: None,
            priority: Priority(0),
            status: Status::Sent,
            flags: vec![],
            meta: Meta {
                action_verb: Some(verb.to_string()),
                effects: Some(effects.to_string()),
                ..Default::default()
            },
            conversation_id: None,
            turn_number: None,
            displayed: false,
            role: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn claims_applied_envelopes_awaiting_render() {
        let env = applied_envelope("INSPECT", "");
        assert!(should_claim(&env));
        let mut rendered = env.clone();
        rendered.meta.rendered = true;
        assert!(!should_claim(&rendered));
    }

    #[test]
    fn prompt_includes_verb_opening_and_effect_lines() {
        let env = applied_envelope(
            "INSPECT",
            "SYSTEM.ADJUST_STAT(target=actor.p, stat=perception, delta=1)\nSYSTEM.SET_AWARENESS(observer=actor.p, target=item.altar, aware=true)",
        );
        let history = ConversationHistory::new();
        let prompt = build_prompt(&env, &history);
        assert!(prompt.contains("Narrate what the character notices"));
        assert!(prompt.contains("Effects:"));
        assert!(prompt.contains("SYSTEM.ADJUST_STAT"));
    }

    #[test]
    fn history_window_is_bounded_to_twelve_entries() {
        let mut history = ConversationHistory::new();
        for i in 0..20 {
            history.push(HistoryEntry {
                role: "narrator".to_string(),
                content: format!("line {i}"),
            });
        }
        assert_eq!(history.entries().count(), CAPACITY);
        assert_eq!(history.entries().next().unwrap().content, "line 8");
    }

    #[test]
    fn finalize_marks_source_rendered_and_emits_rendered_envelope() {
        let env = applied_envelope("INSPECT", "");
        let outcome = finalize(env, "```text\nThe altar hums faintly.\n```", 2, Some("session-1"));
        assert!(outcome.updated_source.meta.rendered);
        assert_eq!(outcome.updated_source.status, Status::Done);
        assert_eq!(outcome.rendered_envelope.sender, "renderer_ai");
        assert_eq!(outcome.rendered_envelope.status, Status::Sent);
        assert_eq!(outcome.rendered_envelope.content, "The altar hums faintly.");
        assert_eq!(outcome.history_entry.content, "The altar hums faintly.");
    }

    #[test]
    fn finalize_falls_back_on_empty_ai_response() {
        let env = applied_envelope("ATTACK", "");
        let outcome = finalize(env, "", 2, Some("session-1"));
        assert_eq!(outcome.rendered_envelope.content, "Narration unavailable.");
        assert!(outcome.updated_source.meta.rendered);
        assert_eq!(outcome.updated_source.status, Status::Done);
    }
}
