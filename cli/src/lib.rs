//! Library surface for the `loom` binary, split out so integration tests
//! can exercise the worker ticks and action pipeline without a process.

pub mod registry;
pub mod state;
pub mod worker;
