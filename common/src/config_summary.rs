//! Startup log-line summary for a [`loom_core::config::Config`], in the
//! same spirit as the teacher's `summarize_sandbox_policy`.

use loom_core::config::Config;

pub fn summarize_config(config: &Config) -> String {
    format!(
        "root={} slot={} debug_level={} npc_tick_hz={} stale_processing_secs={}",
        config.root.display(),
        config.data_slot,
        config.debug_level,
        config.npc_tick_hz,
        config.stale_processing_secs,
    )
}
