//! Store-wide index of known threads and the aggregate snapshot count.
//!
//! Unlike the per-thread files, the index is written back eagerly on every
//! change, so it can name a thread whose files have not been flushed yet.

mod manager;

pub use manager::{IndexManager, INDEX_FILE};
