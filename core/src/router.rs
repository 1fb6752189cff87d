//! C4 — Router.
//!
//! A pure function over `(sender, type, stage, status)`, matching the
//! teacher's `submission_loop` dispatch `match` in `core/src/codex.rs`
//! but without the async/IO: routing decisions are data, and the
//! CLI worker performs the actual read-decide-append loop.

use loom_protocol::Envelope;
use loom_protocol::Status;

/// What the caller should do with an envelope after [`route`] inspects it.
#[derive(Debug, Clone, PartialEq)]
pub enum RouteDecision {
    /// Append to the Outbox with the given status (stage is left as-is
    /// unless noted otherwise by the caller).
    ToOutbox { status: Status },
    /// No outbox emission; the envelope is only ever recorded in the Log.
    LogOnly,
}

const USER_SENDERS: &[&str] = &["j", "user"];

/// spec.md §4.4.
pub fn route(envelope: &Envelope) -> RouteDecision {
    let is_user_input = USER_SENDERS.contains(&envelope.sender.as_str())
        || envelope.kind.as_deref() == Some("user_input");
    if is_user_input {
        return RouteDecision::ToOutbox {
            status: Status::Sent,
        };
    }

    if envelope.sender == "rules_lawyer"
        && envelope.stage.starts_with("ruling_")
        && envelope.status == Status::PendingStateApply
    {
        return RouteDecision::ToOutbox {
            status: Status::PendingStateApply,
        };
    }

    if envelope.sender == "state_applier" && envelope.stage.starts_with("applied_") {
        return RouteDecision::ToOutbox {
            status: Status::Sent,
        };
    }

    if envelope.sender == "renderer_ai" && envelope.stage.starts_with("rendered_") {
        return RouteDecision::LogOnly;
    }

    // No retry: spec.md §4.4/§9 record the legacy re-queue-to-interpreter
    // behavior but this build does not resurrect data_broker errors.
    if envelope.sender == "data_broker" && envelope.status == Status::Error {
        return RouteDecision::LogOnly;
    }

    if envelope.stage.starts_with("npc_response") {
        return RouteDecision::ToOutbox {
            status: Status::Sent,
        };
    }

    RouteDecision::LogOnly
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_protocol::Meta;
    use loom_protocol::Priority;
    use loom_protocol::Stage;

    fn env(sender: &str, stage: &str, status: Status) -> Envelope {
        Envelope {
            id: "id".to_string(),
            sender: sender.to_string(),
            content: String::new(),
            kind: None,
            stage: Stage(stage.to_string()),
            slot: None,
            correlation_id: "c".to_string(),
            reply_to: None,
            priority: Priority(0),
            status,
            flags: vec![],
            meta: Meta::default(),
            conversation_id: None,
            turn_number: None,
            displayed: false,
            role: None,
            created_at: "2024-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn user_input_goes_to_outbox_as_sent() {
        let e = env("j", "queued_1", Status::Queued);
        assert_eq!(
            route(&e),
            RouteDecision::ToOutbox {
                status: Status::Sent
            }
        );
    }

    #[test]
    fn rules_ruling_forwards_pending_state_apply() {
        let e = env("rules_lawyer", "ruling_1", Status::PendingStateApply);
        assert_eq!(
            route(&e),
            RouteDecision::ToOutbox {
                status: Status::PendingStateApply
            }
        );
    }

    #[test]
    fn state_applier_output_forwards_as_sent() {
        let e = env("state_applier", "applied_1", Status::Done);
        assert_eq!(
            route(&e),
            RouteDecision::ToOutbox {
                status: Status::Sent
            }
        );
    }

    #[test]
    fn renderer_output_is_terminal() {
        let e = env("renderer_ai", "rendered_1", Status::Sent);
        assert_eq!(route(&e), RouteDecision::LogOnly);
    }

    #[test]
    fn broker_error_does_not_retry() {
        let e = env("data_broker", "ruling_1", Status::Error);
        assert_eq!(route(&e), RouteDecision::LogOnly);
    }

    #[test]
    fn npc_response_forwards_as_sent() {
        let e = env("npc_ai", "npc_response_1", Status::Queued);
        assert_eq!(
            route(&e),
            RouteDecision::ToOutbox {
                status: Status::Sent
            }
        );
    }

    #[test]
    fn unmatched_combination_is_log_only() {
        let e = env("mystery", "mystery_1", Status::Queued);
        assert_eq!(route(&e), RouteDecision::LogOnly);
    }
}
