use serde::Deserialize;
use serde::Serialize;

/// Shape of `game_time.jsonc`. Calendar constants (60 min/hr, 24 hr/day,
/// 30 day/month, 6 months/year) and conversions live in `loom_core::world`;
/// this crate only carries the wire shape.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GameTime {
    pub minute: u32,
    pub hour: u32,
    pub day: u32,
    pub month: u32,
    pub year: u32,
    pub total_minutes: u64,
}
