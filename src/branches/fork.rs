//! Branch requests and fork metadata.

use crate::types::{Metadata, SnapshotAddress, Timestamp, DEFAULT_NAMESPACE};
use serde_json::{json, Value};

/// `source` metadata value of a forked snapshot.
pub const FORK_SOURCE: &str = "fork";

/// Relationship recorded in `parents` and the key of the lineage record.
pub const BRANCH_SOURCE: &str = "branch_source";

/// What to branch from, and where to.
#[derive(Clone, Debug)]
pub struct BranchRequest {
    pub source_thread_id: String,

    /// Namespace of both the source and the new thread.
    pub namespace: String,

    /// Source snapshot; latest when unset.
    pub source_snapshot_id: Option<String>,

    /// New thread id; `{source}-branch-{now}` when unset.
    pub target_thread_id: Option<String>,
}

impl BranchRequest {
    pub fn new(source_thread_id: impl Into<String>) -> Self {
        Self {
            source_thread_id: source_thread_id.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            source_snapshot_id: None,
            target_thread_id: None,
        }
    }

    pub fn at(mut self, snapshot_id: impl Into<String>) -> Self {
        self.source_snapshot_id = Some(snapshot_id.into());
        self
    }

    pub fn into_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.target_thread_id = Some(thread_id.into());
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Target thread id, generating one from the clock when unset.
    pub(crate) fn resolve_target(&self, now: Timestamp) -> String {
        self.target_thread_id
            .clone()
            .unwrap_or_else(|| format!("{}-branch-{}", self.source_thread_id, now.0))
    }
}

/// A completed branch.
#[derive(Clone, Debug)]
pub struct BranchOutcome {
    pub thread_id: String,
    pub address: SnapshotAddress,
}

/// Build the metadata of a forked snapshot.
///
/// The source's `step` is carried over when present.
pub fn fork_metadata(source: &SnapshotAddress, source_metadata: &Metadata) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("source".into(), Value::from(FORK_SOURCE));
    if let Some(step) = source_metadata.get("step") {
        metadata.insert("step".into(), step.clone());
    }
    let mut parents = Metadata::new();
    parents.insert(source.snapshot_id.clone(), Value::from(BRANCH_SOURCE));
    metadata.insert("parents".into(), Value::Object(parents));
    metadata.insert(
        BRANCH_SOURCE.into(),
        json!({
            "thread_id": source.thread_id,
            "snapshot_id": source.snapshot_id,
        }),
    );
    metadata
}
