//! Age- and count-based retention of snapshots.

mod policy;

pub use policy::{select_for_removal, CleanupOptions, CleanupReport};
