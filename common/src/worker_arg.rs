//! Shared CLI flags for the worker subcommands in `loom-cli`. Split out
//! the way the teacher's `SandboxPermissionOption` is, so a flag that
//! several worker subcommands take can be `#[clap(flatten)]`ed rather
//! than redeclared.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct DataSlotArg {
    /// Which `data_slot_<N>` directory under the root this worker reads
    /// and writes.
    #[arg(long, default_value_t = 1)]
    pub data_slot: u32,
}

#[derive(Parser, Debug, Clone)]
pub struct PollIntervalArg {
    /// Milliseconds between poll ticks.
    #[arg(long = "poll-interval-ms", default_value_t = 500)]
    pub poll_interval_ms: u64,
}

impl PollIntervalArg {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
