//! Retention policy selection.

use crate::types::{parse_timestamp_id, Timestamp};
use std::collections::BTreeSet;
use std::time::Duration;

/// Options for `CheckpointStore::cleanup`.
#[derive(Clone, Debug, Default)]
pub struct CleanupOptions {
    /// Remove snapshots whose timestamp id is older than this.
    pub max_age: Option<Duration>,

    /// Keep at most this many of the newest snapshots per thread partition.
    pub max_per_thread: Option<usize>,

    /// Only scan partitions of this thread (any namespace).
    pub thread_id: Option<String>,
}

impl CleanupOptions {
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn max_per_thread(mut self, count: usize) -> Self {
        self.max_per_thread = Some(count);
        self
    }

    pub fn thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }
}

/// Result of a cleanup pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Thread partitions examined.
    pub threads_scanned: usize,
    /// Snapshots deleted, with their writes.
    pub snapshots_removed: u64,
    /// Offloaded blob files deleted.
    pub blobs_removed: u64,
}

/// Pick the snapshot ids to evict from one thread.
///
/// `sorted_ids` must be newest first. Age only applies to ids that parse as
/// millisecond timestamps; the count limit keeps the first `max_per_thread`.
/// The result is the union of both criteria.
pub fn select_for_removal(
    sorted_ids: &[String],
    now: Timestamp,
    options: &CleanupOptions,
) -> BTreeSet<String> {
    let mut removed = BTreeSet::new();

    if let Some(max_age) = options.max_age {
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.0.saturating_sub(max_age_ms);
        for id in sorted_ids {
            if matches!(parse_timestamp_id(id), Some(ts) if ts < cutoff) {
                removed.insert(id.clone());
            }
        }
    }

    if let Some(keep) = options.max_per_thread {
        for id in sorted_ids.iter().skip(keep) {
            removed.insert(id.clone());
        }
    }

    removed
}
