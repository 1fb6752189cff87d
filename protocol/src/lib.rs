//! Wire types shared by every process on the loom message bus.
//!
//! This crate only defines *shapes* — the envelope, its stage/status
//! vocabulary, and the on-disk file formats it travels in. Business logic
//! (construction, validated status transitions, routing, queue mutation)
//! lives in `loom-core`, which depends on this crate the same way
//! `codex-core` depends on `codex-protocol`.

mod envelope;
mod queue_file;
mod roller;
mod session_file;
mod time;

pub use envelope::Envelope;
pub use envelope::EnvelopeBuilder;
pub use envelope::Meta;
pub use envelope::Priority;
pub use envelope::Stage;
pub use envelope::Status;
pub use queue_file::QueueFile;
pub use queue_file::SCHEMA_VERSION;
pub use roller::RollerStatus;
pub use session_file::SessionFile;
pub use time::GameTime;
