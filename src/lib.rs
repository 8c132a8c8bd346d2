//! # Checkpoint Store
//!
//! A partitioned, file-backed store for the successive states of long-running
//! agent sessions.
//!
//! ## Core Concepts
//!
//! - **Threads**: Sessions identified by a thread id and a namespace
//! - **Snapshots**: Immutable checkpoints of a thread, each with an optional parent
//! - **Writes**: Channel-tagged pending writes recorded against a snapshot
//! - **Branches**: New threads forked from another thread's snapshot
//! - **Retention**: Age- and count-based eviction of old snapshots
//!
//! ## Layout
//!
//! ```text
//! index.json                  known threads and snapshot count
//! checkpoints/<digest>.json   snapshots of one thread partition
//! writes/<digest>.json        pending writes of one thread partition
//! data/<digest>.data          offloaded oversized payloads
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use checkpoint_store::{Checkpoint, CheckpointStore, ListOptions, Metadata, StoreConfig};
//! use serde_json::json;
//!
//! let store = CheckpointStore::open(StoreConfig::new("./my-checkpoints"))?;
//!
//! // Store a snapshot
//! let first = store.put("thread-1", "", None, &Checkpoint::new(json!({"step": 1})), &Metadata::new())?;
//!
//! // Record pending writes against it
//! store.put_writes("thread-1", "", &first.snapshot_id, "task-1", &[("messages", json!("hi"))])?;
//!
//! // Read back the latest snapshot
//! let latest = store.get("thread-1", "", None)?;
//!
//! // Walk history, newest first
//! for snapshot in store.list("thread-1", "", &ListOptions::default().limit(10))? {
//!     println!("{}", snapshot?.address);
//! }
//! ```

pub mod blobs;
pub mod branches;
pub mod engine;
pub mod error;
pub mod format;
pub mod index;
mod persist;
pub mod retention;
pub mod store;
pub mod subscriptions;
pub mod threads;
pub mod types;

// Re-exports
pub use blobs::{BlobCodec, DEFAULT_BLOB_CACHE_BYTES, DEFAULT_OFFLOAD_THRESHOLD};
pub use branches::{fork_metadata, BranchOutcome, BranchRequest};
pub use engine::{sanitize_filter, SnapshotIter, FILTERABLE_METADATA_KEYS};
pub use error::{Result, StoreError};
pub use format::{JsonSerializer, MessagePackSerializer, SnapshotSerializer};
pub use index::IndexManager;
pub use retention::{CleanupOptions, CleanupReport};
pub use store::{CheckpointStore, StoreConfig};
pub use subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use threads::{ThreadState, ThreadStore};
pub use types::*;
