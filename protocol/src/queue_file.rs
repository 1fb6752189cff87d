use serde::Deserialize;
use serde::Serialize;

use crate::Envelope;

/// Canonical on-disk shape for `log.jsonc`, `inbox.jsonc`, `outbox.jsonc`.
///
/// Non-conforming files are a fatal parse error (spec.md §4.2) — there is
/// deliberately no `#[serde(default)]` escape hatch on `schema_version`.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct QueueFile {
    pub schema_version: u32,
    pub messages: Vec<Envelope>,
}

impl QueueFile {
    pub fn new() -> Self {
        QueueFile {
            schema_version: SCHEMA_VERSION,
            messages: Vec::new(),
        }
    }
}
