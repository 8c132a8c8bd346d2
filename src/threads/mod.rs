//! Per-thread write-back cache of snapshot and write records.
//!
//! Each thread partition is loaded from disk at most once per process and
//! written back only when marked dirty.

mod store;

pub use store::{ThreadState, ThreadStore, CHECKPOINTS_DIR, WRITES_DIR};
