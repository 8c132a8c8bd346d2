//! Subscription types for store events.

use crate::retention::CleanupReport;
use crate::types::SnapshotAddress;
use serde::{Deserialize, Serialize};

/// Options for `CheckpointStore::subscribe`.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Events held for a subscriber before it is considered stalled (1000).
    pub buffer_size: usize,
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::default(),
        }
    }
}

/// Which events a subscriber receives.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events concerning these thread ids (None = all threads).
    /// Store-wide events (cleanup, clear) are always delivered.
    pub thread_ids: Option<Vec<String>>,

    /// Include pending-write events.
    pub include_writes: bool,
}

impl SubscriptionFilter {
    /// Everything, including write batches.
    pub fn all() -> Self {
        Self {
            thread_ids: None,
            include_writes: true,
        }
    }

    /// Events for a single thread, including write batches.
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_ids: Some(vec![thread_id.into()]),
            include_writes: true,
        }
    }
}

/// Events emitted after store mutations.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A snapshot was stored.
    SnapshotPut {
        address: SnapshotAddress,
        parent_id: Option<String>,
    },

    /// A batch of pending writes was appended to a snapshot.
    WritesPut {
        address: SnapshotAddress,
        task_id: String,
        count: usize,
    },

    /// A single snapshot and its writes were deleted.
    SnapshotDeleted {
        address: SnapshotAddress,
    },

    /// A whole thread partition was deleted.
    ThreadDeleted {
        thread_id: String,
        namespace: String,
    },

    /// A thread was forked from another thread's snapshot.
    Branched {
        source: SnapshotAddress,
        target: SnapshotAddress,
    },

    /// A retention pass finished.
    CleanupCompleted {
        threads_scanned: usize,
        snapshots_removed: u64,
        blobs_removed: u64,
    },

    /// All persisted state was wiped.
    Cleared,

    /// Last event a removed subscriber sees.
    Dropped {
        reason: DropReason,
    },
}

impl StoreEvent {
    pub(crate) fn cleanup(report: &CleanupReport) -> Self {
        StoreEvent::CleanupCompleted {
            threads_scanned: report.threads_scanned,
            snapshots_removed: report.snapshots_removed,
            blobs_removed: report.blobs_removed,
        }
    }

    /// Thread ids this event concerns; empty for store-wide events.
    pub fn thread_ids(&self) -> Vec<&str> {
        match self {
            StoreEvent::SnapshotPut { address, .. }
            | StoreEvent::WritesPut { address, .. }
            | StoreEvent::SnapshotDeleted { address } => vec![address.thread_id.as_str()],
            StoreEvent::ThreadDeleted { thread_id, .. } => vec![thread_id.as_str()],
            StoreEvent::Branched { source, target } => {
                vec![source.thread_id.as_str(), target.thread_id.as_str()]
            }
            StoreEvent::CleanupCompleted { .. } | StoreEvent::Cleared | StoreEvent::Dropped { .. } => {
                Vec::new()
            }
        }
    }
}

/// Reason carried by `StoreEvent::Dropped`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// The subscriber's buffer was full.
    BufferOverflow,
    /// `unsubscribe` was called.
    Unsubscribed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiving end of a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Block until the next event.
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain every event currently buffered.
    pub fn drain(&self) -> Vec<StoreEvent> {
        self.receiver.try_iter().collect()
    }
}
