//! C1 — Envelope & ID service.
//!
//! Construction, id allocation, and validated status transitions for
//! [`loom_protocol::Envelope`]. Grounded on the teacher's `Codex::submit`
//! (monotonic id allocation) and the explicit state-machine style of
//! `protocol/src/protocol.rs`'s `Op`/`EventMsg` enums, generalized to the
//! `try_set_status` ladder from spec.md §4.1.

use loom_protocol::Envelope;
use loom_protocol::EnvelopeBuilder;
use loom_protocol::Status;

use crate::error::CoreError;

const BASE32_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Parsed form of an envelope id: `<ISO8601> : <6-digit index> : <6-char base32>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdParts {
    pub timestamp: String,
    pub index: u32,
    pub rand: String,
}

pub fn format_id(timestamp: &str, index: u32, rand: &str) -> String {
    format!("{timestamp} : {index:06} : {rand}")
}

pub fn parse_id(id: &str) -> Option<IdParts> {
    let mut parts = id.split(" : ");
    let timestamp = parts.next()?.to_string();
    let index_str = parts.next()?;
    let rand = parts.next()?.to_string();
    if parts.next().is_some() {
        return None;
    }
    if index_str.len() != 6 || !index_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let index = index_str.parse().ok()?;
    Some(IdParts {
        timestamp,
        index,
        rand,
    })
}

/// Six random base32 characters for the id's uniqueness suffix.
pub fn random_suffix() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    (0..6)
        .map(|_| {
            let idx = rng.random_range(0..BASE32_ALPHABET.len());
            BASE32_ALPHABET[idx] as char
        })
        .collect()
}

pub fn iso8601_now() -> String {
    let now = time::OffsetDateTime::now_utc();
    now.format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Reads the head of a log's in-memory message list (newest-first, per
/// spec.md §4.2) and returns the next strictly-increasing index. Falls
/// back to `len + 1` if the head id cannot be parsed, per spec.md §4.1.
pub fn next_index(log_messages: &[Envelope]) -> u32 {
    match log_messages.first().and_then(|e| parse_id(&e.id)) {
        Some(parts) => parts.index + 1,
        None => log_messages.len() as u32 + 1,
    }
}

/// Construct a new envelope, stamping `id`, `created_at`, and
/// `meta.session_id` from the current session fence.
pub fn new(builder: EnvelopeBuilder, index: u32, session_id: Option<&str>) -> Envelope {
    let created_at = iso8601_now();
    let id = format_id(&created_at, index, &random_suffix());
    let mut meta = builder.meta;
    if meta.session_id.is_none() {
        meta.session_id = session_id.map(str::to_string);
    }

    Envelope {
        id,
        sender: builder.sender,
        content: builder.content,
        kind: builder.kind,
        stage: builder.stage.unwrap_or_else(|| loom_protocol::Stage("queued_1".to_string())),
        slot: builder.slot,
        correlation_id: builder
            .correlation_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        reply_to: builder.reply_to,
        priority: builder.priority,
        status: builder.status.unwrap_or(Status::Queued),
        flags: builder.flags,
        meta,
        conversation_id: builder.conversation_id,
        turn_number: builder.turn_number,
        displayed: false,
        role: builder.role,
        created_at,
    }
}

/// Outcome of a [`try_set_status`] call.
pub struct Transition {
    pub ok: bool,
    pub envelope: Envelope,
    pub reason: Option<String>,
}

/// Validated status transition (spec.md §4.1). On an illegal request,
/// returns `ok: false` with the original envelope untouched — callers
/// should treat this as "silent skip" per spec.md §7, not propagate a
/// hard error.
pub fn try_set_status(mut envelope: Envelope, target: Status) -> Transition {
    if is_allowed(envelope.status, target) {
        envelope.status = target;
        Transition {
            ok: true,
            envelope,
            reason: None,
        }
    } else {
        let reason = format!(
            "invalid_status_transition: {} -> {}",
            envelope.status, target
        );
        Transition {
            ok: false,
            envelope,
            reason: Some(reason),
        }
    }
}

/// Same as [`try_set_status`] but returns a [`CoreError`] on rejection,
/// for call sites that want to propagate with `?` rather than inspect
/// `Transition::ok`.
pub fn set_status_or_err(envelope: Envelope, target: Status) -> crate::error::Result<Envelope> {
    let from = envelope.status.to_string();
    let transition = try_set_status(envelope, target);
    if transition.ok {
        Ok(transition.envelope)
    } else {
        Err(CoreError::InvalidStatusTransition {
            from,
            to: target.to_string(),
        })
    }
}

fn is_allowed(from: Status, to: Status) -> bool {
    use Status::*;
    match (from, to) {
        (Queued, Sent) => true,
        (Sent, Processing) => true,
        (Sent, Superseded) => true,
        (Processing, Done) => true,
        (Processing, Error) => true,
        (Processing, PendingStateApply) => true,
        (Processing, Superseded) => true,
        (AwaitingRoll(_), Sent) => true,
        _ => false,
    }
}

/// Whether this envelope belongs to the process's current boot session.
/// Envelopes without `meta.session_id` are legacy and MUST be rejected
/// (spec.md §3 invariant), independent of whatever the fence reports.
pub fn is_current_session(envelope: &Envelope, current_session_id: &str) -> bool {
    match &envelope.meta.session_id {
        Some(id) => id == current_session_id,
        None => false,
    }
}
