//! Plumbing shared by the DSM binaries.

pub mod logging;
pub mod task;
