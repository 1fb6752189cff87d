//! Process-wide configuration read from the environment (spec.md §6).
//!
//! Grounded on `core/src/config.rs`'s `codex_dir()` (directory resolution
//! via `dirs`) and `core/src/flags.rs`'s pattern of parsing env vars once
//! at startup into a typed struct rather than calling `std::env::var`
//! scattered across the codebase.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

/// Root of `<root>/local_data/data_slot_<N>/` for the configured slot.
#[derive(Debug, Clone)]
pub struct Config {
    pub root: PathBuf,
    pub data_slot: u32,
    pub debug_level: u8,
    pub interpreter_timeout: Duration,
    pub renderer_timeout: Duration,
    pub npc_ai_timeout: Duration,
    pub npc_tick_hz: u32,
    pub npc_reassess_batch: usize,
    pub log_cap: usize,
    pub log_cap_noise_prune: usize,
    pub outbox_cap: usize,
    pub inbox_cap: usize,
    pub stale_processing_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            root: default_root(),
            data_slot: 1,
            debug_level: 0,
            interpreter_timeout: Duration::from_secs(120),
            renderer_timeout: Duration::from_secs(600),
            npc_ai_timeout: Duration::from_secs(120),
            npc_tick_hz: 4,
            npc_reassess_batch: 5,
            log_cap: 100,
            log_cap_noise_prune: 4000,
            outbox_cap: 10,
            inbox_cap: 100,
            stale_processing_secs: 120,
        }
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".loom")
}

impl Config {
    /// Build a [`Config`] from the process environment, falling back to
    /// defaults for anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(root) = std::env::var("LOOM_ROOT") {
            cfg.root = PathBuf::from(root);
        }
        if let Ok(slot) = std::env::var("DATA_SLOT")
            && let Ok(n) = slot.parse()
        {
            cfg.data_slot = n;
        }
        if let Ok(level) = std::env::var("DEBUG_LEVEL")
            && let Ok(n) = level.parse()
        {
            cfg.debug_level = n;
        }
        if let Some(ms) = env_u64("INTERPRETER_TIMEOUT_MS") {
            cfg.interpreter_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("RENDERER_TIMEOUT_MS") {
            cfg.renderer_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("NPC_AI_TIMEOUT_MS") {
            cfg.npc_ai_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_u64("LOOM_STALE_PROCESSING_SECS") {
            cfg.stale_processing_secs = secs;
        }

        cfg
    }

    /// `<root>/local_data/data_slot_<N>/`
    pub fn slot_dir(&self) -> PathBuf {
        self.root
            .join("local_data")
            .join(format!("data_slot_{}", self.data_slot))
    }

    pub fn log_path(&self) -> PathBuf {
        self.slot_dir().join("log.jsonc")
    }

    pub fn inbox_path(&self) -> PathBuf {
        self.slot_dir().join("inbox.jsonc")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.slot_dir().join("outbox.jsonc")
    }

    pub fn roller_status_path(&self) -> PathBuf {
        self.slot_dir().join("roller_status.jsonc")
    }

    pub fn game_time_path(&self) -> PathBuf {
        self.slot_dir().join("game_time.jsonc")
    }

    pub fn session_file_path(&self) -> PathBuf {
        self.slot_dir().join(".session_id")
    }

    pub fn npcs_dir(&self) -> PathBuf {
        self.slot_dir().join("npcs")
    }

    pub fn actors_dir(&self) -> PathBuf {
        self.slot_dir().join("actors")
    }

    pub fn items_dir(&self) -> PathBuf {
        self.slot_dir().join("items")
    }

    pub fn places_dir(&self) -> PathBuf {
        self.slot_dir().join("places")
    }

    pub fn world_path(&self) -> PathBuf {
        self.slot_dir().join("world").join("world.jsonc")
    }

    pub fn metrics_dir(&self) -> PathBuf {
        self.slot_dir().join("metrics")
    }

    pub fn conversation_presence_path(&self) -> PathBuf {
        self.slot_dir().join("ephemeral").join("conversation_presence.json")
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Ensure the slot directory tree exists. Idempotent.
pub fn ensure_slot_tree(root: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    std::fs::create_dir_all(root.join("npcs"))?;
    std::fs::create_dir_all(root.join("actors"))?;
    std::fs::create_dir_all(root.join("items"))?;
    std::fs::create_dir_all(root.join("places"))?;
    std::fs::create_dir_all(root.join("world"))?;
    std::fs::create_dir_all(root.join("metrics"))?;
    std::fs::create_dir_all(root.join("ephemeral"))?;
    Ok(())
}
