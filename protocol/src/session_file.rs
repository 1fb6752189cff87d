use serde::Deserialize;
use serde::Serialize;

/// Shape of `.session_id` (spec.md §6). Read on startup and re-read every
/// 5s by the session fence (C3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionFile {
    pub session_id: String,
    pub boot_time: String,
    pub boot_timestamp: i64,
    pub version: u32,
}
