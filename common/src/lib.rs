#[cfg(feature = "cli")]
mod worker_arg;

#[cfg(feature = "elapsed")]
pub mod elapsed;

#[cfg(feature = "config_summary")]
pub mod config_summary;

#[cfg(feature = "cli")]
pub use worker_arg::DataSlotArg;
#[cfg(feature = "cli")]
pub use worker_arg::PollIntervalArg;
