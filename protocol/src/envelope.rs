use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Lifecycle position of an [`Envelope`].
///
/// `AwaitingRoll` carries the roll id it is blocked on, matching the wire
/// convention `awaiting_roll_<N>` from spec.md. Every other variant is a
/// plain snake_case string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Queued,
    Sent,
    Processing,
    PendingStateApply,
    Done,
    Error,
    Superseded,
    AwaitingRoll(u32),
}

impl Status {
    /// Coarse ordering used by dedup-by-id: `done > processing > sent >
    /// queued`. Anything not in that ladder (error, superseded, awaiting
    /// roll) sorts above `queued` but is never compared against the ladder
    /// in practice — dedup only ever needs to rank the four "alive" states.
    pub fn dedup_priority(self) -> u8 {
        match self {
            Status::Queued => 0,
            Status::AwaitingRoll(_) => 1,
            Status::Sent => 2,
            Status::PendingStateApply => 2,
            Status::Processing => 3,
            Status::Superseded => 4,
            Status::Error => 4,
            Status::Done => 5,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Queued => write!(f, "queued"),
            Status::Sent => write!(f, "sent"),
            Status::Processing => write!(f, "processing"),
            Status::PendingStateApply => write!(f, "pending_state_apply"),
            Status::Done => write!(f, "done"),
            Status::Error => write!(f, "error"),
            Status::Superseded => write!(f, "superseded"),
            Status::AwaitingRoll(id) => write!(f, "awaiting_roll_{id}"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid status literal: {0:?}")]
pub struct InvalidStatus(String);

impl FromStr for Status {
    type Err = InvalidStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => Status::Queued,
            "sent" => Status::Sent,
            "processing" => Status::Processing,
            "pending_state_apply" => Status::PendingStateApply,
            "done" => Status::Done,
            "error" => Status::Error,
            "superseded" => Status::Superseded,
            other => {
                let id = other
                    .strip_prefix("awaiting_roll_")
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| InvalidStatus(other.to_string()))?;
                Status::AwaitingRoll(id)
            }
        })
    }
}

impl Serialize for Status {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Status::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A free-form stage label with the `<stage_name>_<iteration>` convention
/// (`ruling_1`, `applied_2`, `rendered_1`, ...). Stored as the raw wire
/// string; `base()`/`iteration()` peel the convention apart without the
/// string-prefix routing REDESIGN FLAG leaking past the wire boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stage(pub String);

impl Stage {
    pub fn new(base: &str, iteration: u32) -> Self {
        Stage(format!("{base}_{iteration}"))
    }

    /// The portion before the last `_<digits>` suffix, or the whole string
    /// if there is no numeric suffix.
    pub fn base(&self) -> &str {
        match self.0.rfind('_') {
            Some(idx) if self.0[idx + 1..].chars().all(|c| c.is_ascii_digit()) && idx + 1 < self.0.len() => {
                &self.0[..idx]
            }
            _ => &self.0,
        }
    }

    pub fn iteration(&self) -> Option<u32> {
        match self.0.rfind('_') {
            Some(idx) => self.0[idx + 1..].parse().ok(),
            None => None,
        }
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Higher is more urgent. Plain wrapper so call sites read `Priority(5)`
/// instead of a bare integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Priority(pub i32);

/// Opaque-but-typed extension bag.
///
/// REDESIGN FLAG: the source's envelope carried a single
/// `meta: Record<string, unknown>`. Here the fields every worker actually
/// switches on are named and typed; anything else lands in `ext` so
/// forward-compatible producers/consumers never need a schema migration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Meta {
    /// Absent => legacy envelope, MUST be ignored by current-session workers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Effect expressions attached by the rules lawyer for the state
    /// applier to parse (C8 input).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects: Option<String>,

    /// Count of effects actually applied, stamped by the state applier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effects_applied: Option<u32>,

    /// Verb driving renderer prompt selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_verb: Option<String>,

    /// Set once the renderer has produced narration for this envelope, so
    /// a second tick does not double-render.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub rendered: bool,

    /// `rolled_by_player` flag for roll_request_* envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rolled_by_player: Option<bool>,

    /// Correlates a roll_input_* envelope back to its roll_request_*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roll_id: Option<String>,

    /// Configurable noise type for long-retention filtering.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noise_type: Option<String>,

    /// Forward-compatible extension map for anything not named above.
    #[serde(flatten)]
    pub ext: HashMap<String, Value>,
}

/// The single unit of work traveling through the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub id: String,
    pub sender: String,
    pub content: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot: Option<u32>,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub status: Status,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub meta: Meta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_number: Option<u32>,
    #[serde(default)]
    pub displayed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub created_at: String,
}

/// Constructs an envelope with every field except `id`/`created_at`, which
/// the envelope & id service (`loom_core::envelope`) stamps on creation.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeBuilder {
    pub sender: String,
    pub content: String,
    pub kind: Option<String>,
    pub stage: Option<Stage>,
    pub slot: Option<u32>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub priority: Priority,
    pub status: Option<Status>,
    pub flags: Vec<String>,
    pub meta: Meta,
    pub conversation_id: Option<String>,
    pub turn_number: Option<u32>,
    pub role: Option<String>,
}
