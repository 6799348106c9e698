//! Live reorganization (compaction) of secondary logs.

mod worker;

pub use worker::{ReorgConfig, ReorgWorker};
