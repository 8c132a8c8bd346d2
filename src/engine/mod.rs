//! Snapshot reconstruction and listing.
//!
//! Stored records hold encoded blobs. Reading a snapshot decodes its body and
//! metadata, decodes its pending writes, and attaches the task sends its
//! parent forwarded on the reserved [`TASKS`](crate::TASKS) channel.

mod filter;
mod iter;

pub use filter::{sanitize_filter, FILTERABLE_METADATA_KEYS};
pub use iter::SnapshotIter;

pub(crate) use filter::metadata_matches;
pub(crate) use iter::{ListEntry, Reconstructor};
