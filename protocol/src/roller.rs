use serde::Deserialize;
use serde::Serialize;

use crate::queue_file::SCHEMA_VERSION;

/// Sole state shared between the roller worker (C9) and the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollerStatus {
    pub schema_version: u32,
    pub spinner: String,
    pub last_player_roll: Option<String>,
    pub dice_label: Option<String>,
    pub disabled: bool,
    pub roll_id: Option<String>,
    pub updated_at: String,
}

impl Default for RollerStatus {
    fn default() -> Self {
        RollerStatus {
            schema_version: SCHEMA_VERSION,
            spinner: String::new(),
            last_player_roll: None,
            dice_label: None,
            disabled: true,
            roll_id: None,
            updated_at: String::new(),
        }
    }
}
