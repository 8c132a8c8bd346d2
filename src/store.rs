//! Main store struct tying all components together.

use crate::blobs::{BlobCodec, DEFAULT_BLOB_CACHE_BYTES, DEFAULT_OFFLOAD_THRESHOLD};
use crate::branches::{fork_metadata, BranchOutcome, BranchRequest};
use crate::engine::{metadata_matches, sanitize_filter, ListEntry, Reconstructor, SnapshotIter};
use crate::error::{Result, StoreError};
use crate::format::{JsonSerializer, SnapshotSerializer};
use crate::index::IndexManager;
use crate::retention::{select_for_removal, CleanupOptions, CleanupReport};
use crate::subscriptions::{
    StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId, SubscriptionManager,
};
use crate::threads::{ThreadState, ThreadStore};
use crate::types::{
    compare_snapshot_ids, generate_snapshot_id, Checkpoint, CheckpointBody, CheckpointTuple,
    EncodedBlob, ListOptions, Metadata, SnapshotAddress, StoreStats, StoredSnapshot, ThreadKey,
    Timestamp, WriteRecord,
};
use fs2::FileExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base directory for the store.
    pub path: PathBuf,

    /// Payloads longer than this many bytes are offloaded to their own file.
    pub offload_threshold: usize,

    /// Offloaded blob cache size (number of blobs).
    pub blob_cache_size: usize,

    /// Offloaded blob cache budget in bytes. Larger blobs are never cached.
    pub blob_cache_bytes: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Hold an exclusive lock on the base directory while open.
    pub lock_directory: bool,

    /// Pretty-print the index and thread files.
    pub pretty_json: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./checkpoints"),
            offload_threshold: DEFAULT_OFFLOAD_THRESHOLD,
            blob_cache_size: 16,
            blob_cache_bytes: DEFAULT_BLOB_CACHE_BYTES,
            create_if_missing: true,
            lock_directory: true,
            pretty_json: false,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// The checkpoint store.
///
/// Provides a unified interface for:
/// - Storing and reading snapshots of thread partitions
/// - Recording pending writes against a snapshot
/// - Branching a thread off another thread's snapshot
/// - Deleting snapshots or threads and applying retention
///
/// Mutating calls are serialized by a store-wide lock. Thread records are
/// cached in memory and written back when dirty; the index is saved on every
/// change.
pub struct CheckpointStore {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: Option<File>,

    /// Format used for checkpoint bodies, metadata and write values.
    serializer: Arc<dyn SnapshotSerializer>,

    /// Inline/offload codec for encoded values.
    codec: BlobCodec,

    /// Known threads and snapshot count.
    index: IndexManager,

    /// Per-thread write-back cache.
    threads: ThreadStore,

    /// Event subscribers.
    events: SubscriptionManager,

    /// Lock for write operations.
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Open (or create) a store using the JSON format.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_serializer(config, Arc::new(JsonSerializer))
    }

    /// Open (or create) a store using the given serialization format.
    pub fn open_with_serializer(
        config: StoreConfig,
        serializer: Arc<dyn SnapshotSerializer>,
    ) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let lock_file = if config.lock_directory {
            Some(Self::acquire_lock(&config.path)?)
        } else {
            None
        };

        let threads = ThreadStore::new(&config.path, config.pretty_json)?;
        let codec = BlobCodec::new(
            &config.path,
            config.offload_threshold,
            config.blob_cache_size,
        )?
        .with_cache_bytes(config.blob_cache_bytes);
        let index = IndexManager::load(
            &config.path,
            threads.checkpoints_dir(),
            threads.writes_dir(),
            config.pretty_json,
        )?;

        debug!(
            target: "checkpoint::store",
            path = %config.path.display(),
            threads = index.thread_count(),
            snapshots = index.snapshot_count(),
            format = serializer.format_tag(),
            "Opened checkpoint store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            serializer,
            codec,
            index,
            threads,
            events: SubscriptionManager::new(),
            write_lock: Mutex::new(()),
        })
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn reconstructor(&self) -> Reconstructor<'_> {
        Reconstructor::new(&self.codec, self.serializer.as_ref())
    }

    fn require_thread(thread_id: &str) -> Result<()> {
        if thread_id.is_empty() {
            return Err(StoreError::MissingThreadId);
        }
        Ok(())
    }

    fn load_thread(&self, key: &ThreadKey) -> Result<()> {
        self.threads.load(key, self.index.contains(key))
    }

    /// Capture a record together with its writes and its parent's writes.
    fn list_entry(state: &ThreadState, key: &ThreadKey, record: &StoredSnapshot) -> ListEntry {
        let writes = state
            .writes
            .get(&key.record_key(&record.id))
            .cloned()
            .unwrap_or_default();
        let parent_writes = record
            .parent_id
            .as_ref()
            .and_then(|parent| state.writes.get(&key.record_key(parent)))
            .cloned()
            .unwrap_or_default();

        ListEntry {
            record: record.clone(),
            writes,
            parent_writes,
        }
    }

    // --- Reads ---

    /// Get a snapshot, or the latest one when `snapshot_id` is `None`.
    ///
    /// Returns `Ok(None)` when the thread has no such snapshot. A missing
    /// offloaded blob is an error, not "not found".
    pub fn get(
        &self,
        thread_id: &str,
        namespace: &str,
        snapshot_id: Option<&str>,
    ) -> Result<Option<CheckpointTuple>> {
        Self::require_thread(thread_id)?;
        let key = ThreadKey::new(thread_id, namespace);
        self.load_thread(&key)?;

        let entry = self
            .threads
            .read(&key, |state| {
                let record = match snapshot_id {
                    Some(id) => state.snapshots.get(&key.record_key(id)),
                    None => state
                        .snapshots
                        .values()
                        .max_by(|a, b| compare_snapshot_ids(&a.id, &b.id)),
                }?;
                Some(Self::list_entry(state, &key, record))
            })
            .flatten();

        match entry {
            Some(entry) => self
                .reconstructor()
                .build(&entry.record, &entry.writes, &entry.parent_writes)
                .map(Some),
            None => Ok(None),
        }
    }

    /// List a thread's snapshots, newest first.
    ///
    /// The selection is fixed when this returns; snapshots are decoded as the
    /// iterator is advanced.
    pub fn list(
        &self,
        thread_id: &str,
        namespace: &str,
        options: &ListOptions,
    ) -> Result<SnapshotIter<'_>> {
        Self::require_thread(thread_id)?;
        let key = ThreadKey::new(thread_id, namespace);
        self.load_thread(&key)?;

        let mut records: Vec<StoredSnapshot> = self
            .threads
            .read(&key, |state| {
                state
                    .snapshots
                    .values()
                    .filter(|s| match &options.before {
                        Some(before) => compare_snapshot_ids(&s.id, before) == Ordering::Less,
                        None => true,
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| compare_snapshot_ids(&b.id, &a.id));

        let limit = options.limit.unwrap_or(usize::MAX);
        let filter = options
            .filter
            .as_ref()
            .map(sanitize_filter)
            .filter(|f| !f.is_empty());

        let selected: Vec<StoredSnapshot> = match filter {
            Some(filter) => {
                let reconstructor = self.reconstructor();
                let mut kept = Vec::new();
                for record in records {
                    if kept.len() >= limit {
                        break;
                    }
                    // Undecodable records are kept so the iterator reports the
                    // error for that item alone.
                    let keep = match reconstructor.decode_metadata(&record) {
                        Ok(metadata) => metadata_matches(&metadata, &filter),
                        Err(e) => {
                            warn!(
                                target: "checkpoint::store",
                                snapshot = %record.id,
                                error = %e,
                                "Could not decode metadata while filtering"
                            );
                            true
                        }
                    };
                    if keep {
                        kept.push(record);
                    }
                }
                kept
            }
            None => records.into_iter().take(limit).collect(),
        };

        let entries = self
            .threads
            .read(&key, |state| {
                selected
                    .iter()
                    .map(|record| Self::list_entry(state, &key, record))
                    .collect()
            })
            .unwrap_or_default();

        Ok(SnapshotIter::new(self.reconstructor(), entries))
    }

    // --- Writes ---

    /// Store a snapshot and return its address.
    ///
    /// `pending_sends` on the checkpoint are derived data and are not stored.
    pub fn put(
        &self,
        thread_id: &str,
        namespace: &str,
        parent_id: Option<&str>,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<SnapshotAddress> {
        let _lock = self.write_lock.lock();
        self.put_locked(thread_id, namespace, parent_id, checkpoint, metadata)
    }

    fn put_locked(
        &self,
        thread_id: &str,
        namespace: &str,
        parent_id: Option<&str>,
        checkpoint: &Checkpoint,
        metadata: &Metadata,
    ) -> Result<SnapshotAddress> {
        Self::require_thread(thread_id)?;
        if checkpoint.id.is_empty() {
            return Err(StoreError::MissingSnapshotId);
        }

        let key = ThreadKey::new(thread_id, namespace);
        self.load_thread(&key)?;

        let body = serde_json::to_value(CheckpointBody {
            id: checkpoint.id.clone(),
            data: checkpoint.data.clone(),
        })?;
        let (format_tag, body_payload) = self.serializer.dumps_typed(&body)?;
        let (metadata_tag, metadata_payload) = self
            .serializer
            .dumps_typed(&Value::Object(metadata.clone()))?;
        if format_tag != metadata_tag {
            return Err(StoreError::FormatMismatch {
                expected: format_tag,
                got: metadata_tag,
            });
        }

        let record_key = key.record_key(&checkpoint.id);
        let replaced = self
            .threads
            .read(&key, |state| state.snapshots.get(&record_key).cloned())
            .flatten();

        let record = StoredSnapshot {
            thread_id: thread_id.to_string(),
            namespace: namespace.to_string(),
            id: checkpoint.id.clone(),
            parent_id: parent_id.map(str::to_string),
            checkpoint: self
                .codec
                .encode(&body_payload, &format!("{}_payload", record_key))?,
            metadata: self
                .codec
                .encode(&metadata_payload, &format!("{}_metadata", record_key))?,
            format_tag,
            created_at: Timestamp::now(),
        };

        // Blobs of the replaced record that the new one no longer points at.
        if let Some(old) = &replaced {
            let kept: Vec<&str> = record
                .blobs()
                .into_iter()
                .filter(|b| b.is_offloaded)
                .map(|b| b.value.as_str())
                .collect();
            for blob in old.blobs() {
                if !kept.contains(&blob.value.as_str()) {
                    self.codec.remove(blob)?;
                }
            }
        }

        self.threads.update(&key, |state| {
            state.snapshots.insert(record_key, record);
        });
        self.threads.mark_dirty(&key);
        self.index.record_put(&key, replaced.is_none())?;
        self.threads.save(&key)?;

        let address = SnapshotAddress::new(thread_id, namespace, checkpoint.id.clone());
        debug!(
            target: "checkpoint::store",
            snapshot = %address,
            parent = ?parent_id,
            replaced = replaced.is_some(),
            "Stored snapshot"
        );
        self.events.broadcast(StoreEvent::SnapshotPut {
            address: address.clone(),
            parent_id: parent_id.map(str::to_string),
        });

        Ok(address)
    }

    /// Append a batch of `(channel, value)` writes to a snapshot.
    ///
    /// Records are indexed by their position in this batch and appended after
    /// any writes already recorded for the snapshot.
    pub fn put_writes<C: AsRef<str>>(
        &self,
        thread_id: &str,
        namespace: &str,
        snapshot_id: &str,
        task_id: &str,
        writes: &[(C, Value)],
    ) -> Result<()> {
        Self::require_thread(thread_id)?;
        if snapshot_id.is_empty() {
            return Err(StoreError::MissingSnapshotId);
        }

        let _lock = self.write_lock.lock();
        let key = ThreadKey::new(thread_id, namespace);
        self.load_thread(&key)?;

        let record_key = key.record_key(snapshot_id);
        let mut records = Vec::with_capacity(writes.len());
        for (index, (channel, value)) in writes.iter().enumerate() {
            let (format_tag, payload) = self.serializer.dumps_typed(value)?;
            let blob_id = format!("{}:{}:{}", record_key, task_id, index);
            records.push(WriteRecord {
                snapshot_id: snapshot_id.to_string(),
                task_id: task_id.to_string(),
                index,
                channel: channel.as_ref().to_string(),
                format_tag,
                value: self.codec.encode(&payload, &blob_id)?,
            });
        }

        self.threads.update(&key, |state| {
            state.writes.entry(record_key).or_default().extend(records);
        });
        self.threads.mark_dirty(&key);
        self.index.register(&key)?;
        self.threads.save(&key)?;

        let address = SnapshotAddress::new(thread_id, namespace, snapshot_id);
        debug!(
            target: "checkpoint::store",
            snapshot = %address,
            task = task_id,
            count = writes.len(),
            "Recorded pending writes"
        );
        self.events.broadcast(StoreEvent::WritesPut {
            address,
            task_id: task_id.to_string(),
            count: writes.len(),
        });

        Ok(())
    }

    /// Remove offloaded blobs, returning how many files were deleted.
    fn remove_blobs<'b>(&self, blobs: impl IntoIterator<Item = &'b EncodedBlob>) -> Result<u64> {
        let mut removed = 0;
        for blob in blobs {
            if self.codec.remove(blob)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete one snapshot, or the whole thread partition when `snapshot_id`
    /// is `None`. Returns `false` if there was nothing to delete.
    pub fn delete(&self, thread_id: &str, namespace: &str, snapshot_id: Option<&str>) -> Result<bool> {
        Self::require_thread(thread_id)?;

        let _lock = self.write_lock.lock();
        let key = ThreadKey::new(thread_id, namespace);
        self.load_thread(&key)?;

        match snapshot_id {
            Some(snapshot_id) => {
                let record_key = key.record_key(snapshot_id);
                let removed = self.threads.update(&key, |state| {
                    let record = state.snapshots.remove(&record_key)?;
                    let writes = state.writes.remove(&record_key).unwrap_or_default();
                    Some((record, writes))
                });
                let Some((record, writes)) = removed else {
                    return Ok(false);
                };

                self.remove_blobs(record.blobs())?;
                self.remove_blobs(writes.iter().map(|w| &w.value))?;
                self.threads.mark_dirty(&key);
                self.threads.save(&key)?;
                self.index.record_removed(1)?;

                let address = SnapshotAddress::new(thread_id, namespace, snapshot_id);
                debug!(target: "checkpoint::store", snapshot = %address, "Deleted snapshot");
                self.events.broadcast(StoreEvent::SnapshotDeleted { address });
                Ok(true)
            }
            None => {
                let state = self.threads.evict(&key).unwrap_or_default();
                if state.is_empty() && !self.index.contains(&key) {
                    return Ok(false);
                }

                self.remove_blobs(state.snapshots.values().flat_map(|s| s.blobs()))?;
                self.remove_blobs(state.writes.values().flatten().map(|w| &w.value))?;
                self.threads.delete_files(&key)?;
                self.index
                    .remove_thread(&key, state.snapshots.len() as u64)?;

                debug!(
                    target: "checkpoint::store",
                    thread = %key,
                    snapshots = state.snapshots.len(),
                    "Deleted thread"
                );
                self.events.broadcast(StoreEvent::ThreadDeleted {
                    thread_id: thread_id.to_string(),
                    namespace: namespace.to_string(),
                });
                Ok(true)
            }
        }
    }

    /// Apply age and count retention to every indexed thread (or every
    /// namespace of one thread).
    pub fn cleanup(&self, options: &CleanupOptions) -> Result<CleanupReport> {
        let _lock = self.write_lock.lock();
        let now = Timestamp::now();
        let mut report = CleanupReport::default();

        let keys: Vec<ThreadKey> = self
            .index
            .thread_keys()
            .into_iter()
            .filter(|key| match &options.thread_id {
                Some(thread_id) => &key.thread_id == thread_id,
                None => true,
            })
            .collect();

        for key in keys {
            self.load_thread(&key)?;
            report.threads_scanned += 1;

            let sorted = self
                .threads
                .read(&key, |state| state.sorted_ids())
                .unwrap_or_default();
            let doomed = select_for_removal(&sorted, now, options);
            if doomed.is_empty() {
                continue;
            }

            let removed = self.threads.update(&key, |state| {
                doomed
                    .iter()
                    .filter_map(|id| {
                        let record_key = key.record_key(id);
                        let record = state.snapshots.remove(&record_key)?;
                        let writes = state.writes.remove(&record_key).unwrap_or_default();
                        Some((record, writes))
                    })
                    .collect::<Vec<_>>()
            });

            for (record, writes) in &removed {
                report.blobs_removed += self.remove_blobs(record.blobs())?;
                report.blobs_removed += self.remove_blobs(writes.iter().map(|w| &w.value))?;
            }
            report.snapshots_removed += removed.len() as u64;
            self.threads.mark_dirty(&key);
        }

        self.threads.flush_all()?;
        self.index.record_removed(report.snapshots_removed)?;

        info!(
            target: "checkpoint::retention",
            threads = report.threads_scanned,
            snapshots = report.snapshots_removed,
            blobs = report.blobs_removed,
            "Cleanup finished"
        );
        self.events.broadcast(StoreEvent::cleanup(&report));

        Ok(report)
    }

    /// Fork a new thread from a source snapshot.
    ///
    /// Returns `Ok(None)` when the source snapshot does not exist.
    pub fn branch(&self, request: &BranchRequest) -> Result<Option<BranchOutcome>> {
        Self::require_thread(&request.source_thread_id)?;

        let _lock = self.write_lock.lock();
        let Some(source) = self.get(
            &request.source_thread_id,
            &request.namespace,
            request.source_snapshot_id.as_deref(),
        )?
        else {
            return Ok(None);
        };

        let target = request.resolve_target(Timestamp::now());
        let checkpoint = Checkpoint::with_id(generate_snapshot_id(), source.checkpoint.data.clone());
        let metadata = fork_metadata(&source.address, &source.metadata);

        let address = self.put_locked(&target, &request.namespace, None, &checkpoint, &metadata)?;

        info!(
            target: "checkpoint::branches",
            source = %source.address,
            target = %address,
            "Branched thread"
        );
        self.events.broadcast(StoreEvent::Branched {
            source: source.address,
            target: address.clone(),
        });

        Ok(Some(BranchOutcome {
            thread_id: target,
            address,
        }))
    }

    // --- Cache control ---

    /// Write back every dirty thread. Returns the number of threads written.
    pub fn flush(&self) -> Result<usize> {
        let _lock = self.write_lock.lock();
        self.threads.flush_all()
    }

    /// Discard the cached copy of a thread and re-read it from disk.
    ///
    /// Pending changes are written back first.
    pub fn reload(&self, thread_id: &str, namespace: &str) -> Result<()> {
        Self::require_thread(thread_id)?;

        let _lock = self.write_lock.lock();
        let key = ThreadKey::new(thread_id, namespace);
        self.threads.save(&key)?;
        self.threads.evict(&key);
        self.load_thread(&key)
    }

    /// Write back and drop a thread's cached records. Returns whether the
    /// thread was loaded.
    pub fn evict(&self, thread_id: &str, namespace: &str) -> Result<bool> {
        Self::require_thread(thread_id)?;

        let _lock = self.write_lock.lock();
        let key = ThreadKey::new(thread_id, namespace);
        self.threads.save(&key)?;
        Ok(self.threads.evict(&key).is_some())
    }

    /// Wipe all persisted state.
    pub fn clear(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.threads.clear()?;
        self.codec.clear()?;
        self.index.reset()?;

        info!(target: "checkpoint::store", path = %self.config.path.display(), "Cleared store");
        self.events.broadcast(StoreEvent::Cleared);
        Ok(())
    }

    /// Rebuild the index from the checkpoint files on disk.
    pub fn rebuild_index(&self) -> Result<()> {
        let _lock = self.write_lock.lock();
        self.threads.flush_all()?;
        self.index.rebuild()
    }

    // --- Introspection ---

    /// All indexed thread partitions.
    pub fn list_threads(&self) -> Vec<ThreadKey> {
        self.index.thread_keys()
    }

    /// Get store statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            thread_count: self.index.thread_count() as u64,
            snapshot_count: self.index.snapshot_count(),
            loaded_thread_count: self.threads.loaded_count() as u64,
            dirty_thread_count: self.threads.dirty_count() as u64,
            blob_count: self.codec.list()?.len() as u64,
            blob_size_bytes: self.codec.total_size()?,
        })
    }

    // --- Subscriptions ---

    /// Subscribe to store events.
    pub fn subscribe(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.events.subscribe(config)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }
}

impl Drop for CheckpointStore {
    fn drop(&mut self) {
        // Best-effort write-back on drop
        if let Err(e) = self.threads.flush_all() {
            warn!(target: "checkpoint::store", error = %e, "Failed to flush threads on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TASKS;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            offload_threshold: 64,
            blob_cache_size: 16,
            ..Default::default()
        }
    }

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        assert!(store.path().join("index.json").exists());
        assert!(store.path().join("checkpoints").is_dir());
        assert!(store.path().join("writes").is_dir());
        assert!(store.path().join("data").is_dir());
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(
            CheckpointStore::open(config),
            Err(StoreError::NotInitialized)
        ));
    }

    #[test]
    fn test_store_lock() {
        let dir = TempDir::new().unwrap();
        let _store = CheckpointStore::open(test_config(&dir)).unwrap();

        assert!(matches!(
            CheckpointStore::open(test_config(&dir)),
            Err(StoreError::Locked)
        ));
    }

    #[test]
    fn test_put_then_get_latest() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        store
            .put("t", "", None, &Checkpoint::with_id("1", json!({"n": 1})), &meta(json!({"step": 0})))
            .unwrap();
        store
            .put("t", "", Some("1"), &Checkpoint::with_id("2", json!({"n": 2})), &meta(json!({"step": 1})))
            .unwrap();

        let latest = store.get("t", "", None).unwrap().unwrap();
        assert_eq!(latest.address.snapshot_id, "2");
        assert_eq!(latest.checkpoint.data, json!({"n": 2}));
        assert_eq!(latest.parent_address.unwrap().snapshot_id, "1");
        assert_eq!(store.stats().unwrap().snapshot_count, 2);
    }

    #[test]
    fn test_replacing_snapshot_keeps_count() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        let big = "z".repeat(200);
        store
            .put("t", "", None, &Checkpoint::with_id("1", json!(big)), &Metadata::new())
            .unwrap();
        store
            .put("t", "", None, &Checkpoint::with_id("1", json!("small")), &Metadata::new())
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.snapshot_count, 1);
        assert_eq!(stats.blob_count, 0);
        assert_eq!(
            store.get("t", "", Some("1")).unwrap().unwrap().checkpoint.data,
            json!("small")
        );
    }

    #[test]
    fn test_pending_sends_come_from_parent() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        store
            .put("t", "", None, &Checkpoint::with_id("1", json!({})), &Metadata::new())
            .unwrap();
        store
            .put_writes("t", "", "1", "task-a", &[(TASKS, json!({"node": "a"})), ("messages", json!("hi"))])
            .unwrap();

        let mut child = Checkpoint::with_id("2", json!({}));
        child.pending_sends = vec![json!("must not be stored")];
        store.put("t", "", Some("1"), &child, &Metadata::new()).unwrap();

        let parent = store.get("t", "", Some("1")).unwrap().unwrap();
        assert!(parent.checkpoint.pending_sends.is_empty());
        assert_eq!(parent.pending_writes.len(), 2);

        let child = store.get("t", "", Some("2")).unwrap().unwrap();
        assert_eq!(child.checkpoint.pending_sends, vec![json!({"node": "a"})]);
        assert!(child.pending_writes.is_empty());
    }

    #[test]
    fn test_index_saved_before_thread_flush() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        store
            .put("t", "", None, &Checkpoint::with_id("1", json!({})), &Metadata::new())
            .unwrap();
        assert_eq!(store.stats().unwrap().dirty_thread_count, 0);
        assert_eq!(store.list_threads(), vec![ThreadKey::new("t", "")]);
    }

    #[test]
    fn test_reload_sees_external_changes() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        store
            .put("t", "", None, &Checkpoint::with_id("1", json!({})), &Metadata::new())
            .unwrap();

        let key = ThreadKey::new("t", "");
        let file = store
            .path()
            .join("checkpoints")
            .join(format!("{}.json", key.file_digest()));
        fs::write(&file, b"{}").unwrap();

        assert!(store.get("t", "", Some("1")).unwrap().is_some());
        store.reload("t", "").unwrap();
        assert!(store.get("t", "", Some("1")).unwrap().is_none());
    }

    #[test]
    fn test_evict_keeps_data_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::open(test_config(&dir)).unwrap();

        store
            .put("t", "", None, &Checkpoint::with_id("1", json!({"a": 1})), &Metadata::new())
            .unwrap();
        assert!(store.evict("t", "").unwrap());
        assert_eq!(store.stats().unwrap().loaded_thread_count, 0);
        assert!(store.get("t", "", Some("1")).unwrap().is_some());
    }
}
