//! Core types for the checkpoint store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Namespace used when the caller does not partition a thread.
pub const DEFAULT_NAMESPACE: &str = "";

/// Reserved channel carrying task sends forwarded to the next step.
pub const TASKS: &str = "__pregel_tasks";

/// Free-form metadata recorded alongside a checkpoint.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Identifies a thread partition: a thread id plus a namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ThreadKey {
    pub thread_id: String,
    #[serde(default)]
    pub namespace: String,
}

impl ThreadKey {
    pub fn new(thread_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: namespace.into(),
        }
    }

    /// Digest naming the per-thread checkpoint and write files.
    pub fn file_digest(&self) -> KeyDigest {
        KeyDigest::from_key(&format!("{}_{}", self.thread_id, self.namespace))
    }

    /// Composite record key for a snapshot of this thread.
    pub fn record_key(&self, snapshot_id: &str) -> String {
        composite_key(&self.thread_id, &self.namespace, snapshot_id)
    }

    /// Prefix shared by every composite key of this thread.
    pub fn key_prefix(&self) -> String {
        format!("{}:{}:", self.thread_id, self.namespace)
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.thread_id, self.namespace)
    }
}

/// Build the `thread:namespace:snapshot` key used for snapshot and write lookups.
pub fn composite_key(thread_id: &str, namespace: &str, snapshot_id: &str) -> String {
    format!("{}:{}:{}", thread_id, namespace, snapshot_id)
}

/// 128-bit digest of a logical key, used to derive filesystem-safe names.
///
/// This is a digest of the key string, never of blob contents: two payloads
/// stored under the same logical key share one file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyDigest(pub [u8; 16]);

impl KeyDigest {
    /// Digest a key string (first 16 bytes of its SHA-256).
    pub fn from_key(key: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let full: [u8; 32] = hasher.finalize().into();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        KeyDigest(out)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(KeyDigest(arr))
    }
}

impl fmt::Debug for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyDigest({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

static LAST_GENERATED_ID: AtomicI64 = AtomicI64::new(0);

/// Generate a fresh timestamp-derived snapshot id.
///
/// Ids are millisecond timestamps, bumped when necessary so that ids
/// generated by this process are strictly increasing.
pub fn generate_snapshot_id() -> String {
    let now = Timestamp::now().0;
    let mut last = LAST_GENERATED_ID.load(AtomicOrdering::SeqCst);
    loop {
        let next = now.max(last + 1);
        match LAST_GENERATED_ID.compare_exchange(
            last,
            next,
            AtomicOrdering::SeqCst,
            AtomicOrdering::SeqCst,
        ) {
            Ok(_) => return next.to_string(),
            Err(actual) => last = actual,
        }
    }
}

/// Interpret a snapshot id as a millisecond timestamp, if it is numeric.
pub fn parse_timestamp_id(id: &str) -> Option<i64> {
    id.parse::<i64>().ok()
}

/// Order two snapshot ids: numerically when both are numbers, otherwise
/// lexicographically.
pub fn compare_snapshot_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i128>(), b.parse::<i128>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

/// Sort ids newest first.
pub fn sort_ids_descending(ids: &mut [String]) {
    ids.sort_by(|a, b| compare_snapshot_ids(b, a));
}

/// A payload handed to the blob codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(s) => s.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }
}

/// Codec output: either the inline payload or a pointer to its blob file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBlob {
    /// Inline text, base64 for inline binary, or the blob path when offloaded.
    pub value: String,
    #[serde(default)]
    pub is_binary: bool,
    #[serde(default)]
    pub is_offloaded: bool,
}

/// A snapshot as persisted in a thread's checkpoint file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub thread_id: String,
    #[serde(default)]
    pub namespace: String,
    pub id: String,
    pub parent_id: Option<String>,
    pub format_tag: String,
    pub checkpoint: EncodedBlob,
    pub metadata: EncodedBlob,
    pub created_at: Timestamp,
}

impl StoredSnapshot {
    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(self.thread_id.clone(), self.namespace.clone())
    }

    /// Encoded blobs owned by this record.
    pub fn blobs(&self) -> [&EncodedBlob; 2] {
        [&self.checkpoint, &self.metadata]
    }
}

/// A single pending write recorded against a snapshot and task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WriteRecord {
    pub snapshot_id: String,
    pub task_id: String,
    /// Position within the put-writes batch that produced this record.
    pub index: usize,
    pub channel: String,
    pub format_tag: String,
    pub value: EncodedBlob,
}

/// Location of a snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotAddress {
    pub thread_id: String,
    pub namespace: String,
    pub snapshot_id: String,
}

impl SnapshotAddress {
    pub fn new(
        thread_id: impl Into<String>,
        namespace: impl Into<String>,
        snapshot_id: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            namespace: namespace.into(),
            snapshot_id: snapshot_id.into(),
        }
    }

    pub fn thread_key(&self) -> ThreadKey {
        ThreadKey::new(self.thread_id.clone(), self.namespace.clone())
    }
}

impl fmt::Display for SnapshotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            composite_key(&self.thread_id, &self.namespace, &self.snapshot_id)
        )
    }
}

/// Checkpoint content handed to `put` and returned by `get`.
#[derive(Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub id: String,

    /// Opaque serialized state.
    pub data: serde_json::Value,

    /// Task sends inherited from the parent snapshot. Derived on read and
    /// never persisted.
    pub pending_sends: Vec<serde_json::Value>,
}

impl Checkpoint {
    /// Create a checkpoint with a freshly generated id.
    pub fn new(data: serde_json::Value) -> Self {
        Self::with_id(generate_snapshot_id(), data)
    }

    pub fn with_id(id: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            data,
            pending_sends: Vec::new(),
        }
    }
}

/// Persisted form of a checkpoint (pending sends stripped).
#[derive(Serialize, Deserialize)]
pub(crate) struct CheckpointBody {
    pub id: String,
    pub data: serde_json::Value,
}

/// A decoded pending write.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingWrite {
    pub task_id: String,
    pub channel: String,
    pub value: serde_json::Value,
}

/// A fully reconstructed snapshot.
#[derive(Clone, Debug)]
pub struct CheckpointTuple {
    pub address: SnapshotAddress,
    pub checkpoint: Checkpoint,
    pub metadata: Metadata,
    pub parent_address: Option<SnapshotAddress>,
    pub pending_writes: Vec<PendingWrite>,
}

/// Options for listing snapshots.
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Maximum number of snapshots to return.
    pub limit: Option<usize>,

    /// Only snapshots whose id orders strictly before this one.
    pub before: Option<String>,

    /// Metadata equality filter (only allow-listed keys are honoured).
    pub filter: Option<Metadata>,
}

impl ListOptions {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn before(mut self, snapshot_id: impl Into<String>) -> Self {
        self.before = Some(snapshot_id.into());
        self
    }

    pub fn filter(mut self, filter: Metadata) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub thread_count: u64,
    pub snapshot_count: u64,
    pub loaded_thread_count: u64,
    pub dirty_thread_count: u64,
    pub blob_count: u64,
    pub blob_size_bytes: u64,
}
