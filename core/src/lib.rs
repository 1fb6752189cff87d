//! Root of the `loom-core` library: the routing state machine, persistent
//! queues, action pipeline, effect applier, renderer prompt assembly, turn
//! state machine, and NPC movement controller that sit behind every worker
//! process in `loom-cli`.

pub mod action;
pub mod ai;
pub mod config;
pub mod effects;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod npc;
pub mod renderer;
pub mod resolve;
pub mod roller;
pub mod router;
pub mod rules;
pub mod session;
pub mod store;
pub mod turn;
pub mod world;

pub use error::CoreError;
pub use error::Result;
