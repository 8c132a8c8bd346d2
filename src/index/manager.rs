//! Index manager implementation.

use crate::error::Result;
use crate::persist::{read_json, write_json_atomic, JsonFile};
use crate::types::{StoredSnapshot, ThreadKey, Timestamp, WriteRecord};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the index under the store root.
pub const INDEX_FILE: &str = "index.json";

/// Index as stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    /// Every thread partition that has been persisted.
    threads: BTreeSet<ThreadKey>,

    /// Aggregate number of stored snapshots.
    snapshot_count: u64,

    last_updated: Timestamp,
}

/// Tracks known threads and the total snapshot count.
pub struct IndexManager {
    /// Path to `index.json`.
    path: PathBuf,

    /// Directories scanned when the index has to be rebuilt.
    checkpoints_dir: PathBuf,
    writes_dir: PathBuf,

    pretty: bool,

    index: RwLock<IndexFile>,
}

impl IndexManager {
    /// Load the index, creating and persisting an empty one when absent.
    ///
    /// A damaged index is rebuilt from the per-thread files.
    pub fn load(
        root: impl AsRef<Path>,
        checkpoints_dir: impl AsRef<Path>,
        writes_dir: impl AsRef<Path>,
        pretty: bool,
    ) -> Result<Self> {
        let manager = Self {
            path: root.as_ref().join(INDEX_FILE),
            checkpoints_dir: checkpoints_dir.as_ref().to_path_buf(),
            writes_dir: writes_dir.as_ref().to_path_buf(),
            pretty,
            index: RwLock::new(IndexFile::default()),
        };

        match read_json::<IndexFile>(&manager.path)? {
            JsonFile::Loaded(index) => {
                debug!(
                    target: "checkpoint::index",
                    threads = index.threads.len(),
                    snapshots = index.snapshot_count,
                    "Loaded index"
                );
                *manager.index.write() = index;
            }
            JsonFile::Missing => manager.save()?,
            JsonFile::Corrupt(e) => {
                warn!(
                    target: "checkpoint::index",
                    path = %manager.path.display(),
                    error = %e,
                    "Index is unreadable, rebuilding from checkpoint files"
                );
                manager.rebuild()?;
            }
        }

        Ok(manager)
    }

    /// Whether a thread partition has ever been persisted.
    pub fn contains(&self, key: &ThreadKey) -> bool {
        self.index.read().threads.contains(key)
    }

    /// All known thread partitions.
    pub fn thread_keys(&self) -> Vec<ThreadKey> {
        self.index.read().threads.iter().cloned().collect()
    }

    pub fn thread_count(&self) -> usize {
        self.index.read().threads.len()
    }

    pub fn snapshot_count(&self) -> u64 {
        self.index.read().snapshot_count
    }

    /// Register a thread. Saves only if the key was new.
    pub fn register(&self, key: &ThreadKey) -> Result<bool> {
        let inserted = self.index.write().threads.insert(key.clone());
        if inserted {
            self.save()?;
        }
        Ok(inserted)
    }

    /// Record a stored snapshot; `is_new` is false when an existing id was replaced.
    pub fn record_put(&self, key: &ThreadKey, is_new: bool) -> Result<()> {
        let changed = {
            let mut index = self.index.write();
            let inserted = index.threads.insert(key.clone());
            if is_new {
                index.snapshot_count += 1;
            }
            inserted || is_new
        };

        if changed {
            self.save()?;
        }
        Ok(())
    }

    /// Subtract removed snapshots from the count and save.
    pub fn record_removed(&self, removed: u64) -> Result<()> {
        {
            let mut index = self.index.write();
            index.snapshot_count = index.snapshot_count.saturating_sub(removed);
        }
        self.save()
    }

    /// Forget a thread entirely and save.
    pub fn remove_thread(&self, key: &ThreadKey, removed: u64) -> Result<()> {
        {
            let mut index = self.index.write();
            index.threads.remove(key);
            index.snapshot_count = index.snapshot_count.saturating_sub(removed);
        }
        self.save()
    }

    /// Reset to an empty index and save.
    pub fn reset(&self) -> Result<()> {
        *self.index.write() = IndexFile::default();
        self.save()
    }

    /// Reconstruct the index by scanning every checkpoint and writes file.
    ///
    /// Threads that only have pending writes are kept. Files that cannot be
    /// parsed are skipped.
    pub fn rebuild(&self) -> Result<()> {
        let mut rebuilt = IndexFile::default();

        for path in json_files(&self.checkpoints_dir)? {
            match read_json::<BTreeMap<String, StoredSnapshot>>(&path)? {
                JsonFile::Loaded(snapshots) => {
                    if let Some(first) = snapshots.values().next() {
                        rebuilt.threads.insert(first.thread_key());
                        rebuilt.snapshot_count += snapshots.len() as u64;
                    }
                }
                JsonFile::Corrupt(e) => warn!(
                    target: "checkpoint::index",
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable checkpoint file during rebuild"
                ),
                JsonFile::Missing => {}
            }
        }

        for path in json_files(&self.writes_dir)? {
            match read_json::<BTreeMap<String, Vec<WriteRecord>>>(&path)? {
                JsonFile::Loaded(writes) => {
                    let owner = path.file_stem().and_then(|s| s.to_str()).and_then(|stem| {
                        writes.iter().find_map(|(record_key, records)| {
                            writes_owner(record_key, &records.first()?.snapshot_id, stem)
                        })
                    });
                    if let Some(key) = owner {
                        rebuilt.threads.insert(key);
                    }
                }
                JsonFile::Corrupt(e) => warn!(
                    target: "checkpoint::index",
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable writes file during rebuild"
                ),
                JsonFile::Missing => {}
            }
        }

        debug!(
            target: "checkpoint::index",
            threads = rebuilt.threads.len(),
            snapshots = rebuilt.snapshot_count,
            "Rebuilt index"
        );
        *self.index.write() = rebuilt;
        self.save()
    }

    /// Write the index to disk.
    pub fn save(&self) -> Result<()> {
        let snapshot = {
            let mut index = self.index.write();
            index.last_updated = Timestamp::now();
            index.clone()
        };
        write_json_atomic(&self.path, &snapshot, self.pretty)
    }
}

/// `*.json` files directly under `dir`; empty if it does not exist.
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    Ok(files)
}

/// Recover the thread a writes file belongs to from one of its record keys.
///
/// Thread ids and namespaces may contain `:`, so every split of the
/// `thread:ns` prefix is tried against the file's digest name.
fn writes_owner(record_key: &str, snapshot_id: &str, digest_hex: &str) -> Option<ThreadKey> {
    let prefix = record_key.strip_suffix(snapshot_id)?.strip_suffix(':')?;
    prefix
        .match_indices(':')
        .map(|(i, _)| ThreadKey::new(&prefix[..i], &prefix[i + 1..]))
        .find(|key| key.file_digest().to_hex() == digest_hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn load(dir: &TempDir) -> IndexManager {
        IndexManager::load(
            dir.path(),
            dir.path().join("checkpoints"),
            dir.path().join("writes"),
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_load_creates_file() {
        let dir = TempDir::new().unwrap();
        let index = load(&dir);

        assert!(dir.path().join(INDEX_FILE).exists());
        assert_eq!(index.snapshot_count(), 0);
        assert_eq!(index.thread_count(), 0);
    }

    #[test]
    fn test_mutations_are_saved_immediately() {
        let dir = TempDir::new().unwrap();
        let key = ThreadKey::new("t1", "");

        {
            let index = load(&dir);
            index.record_put(&key, true).unwrap();
            index.record_put(&key, true).unwrap();
            index.record_put(&key, false).unwrap();
        }

        let index = load(&dir);
        assert!(index.contains(&key));
        assert_eq!(index.snapshot_count(), 2);
    }

    #[test]
    fn test_remove_thread() {
        let dir = TempDir::new().unwrap();
        let index = load(&dir);
        let a = ThreadKey::new("a", "");
        let b = ThreadKey::new("b", "ns");

        index.record_put(&a, true).unwrap();
        index.record_put(&b, true).unwrap();
        index.record_put(&b, true).unwrap();
        index.remove_thread(&b, 2).unwrap();

        assert_eq!(index.thread_keys(), vec![a]);
        assert_eq!(index.snapshot_count(), 1);
    }

    #[test]
    fn test_count_never_underflows() {
        let dir = TempDir::new().unwrap();
        let index = load(&dir);

        index.record_removed(5).unwrap();
        assert_eq!(index.snapshot_count(), 0);
    }

    #[test]
    fn test_corrupt_index_is_rebuilt() {
        let dir = TempDir::new().unwrap();
        let checkpoints = dir.path().join("checkpoints");
        fs::create_dir_all(&checkpoints).unwrap();

        let key = ThreadKey::new("t1", "ns");
        let mut snapshots = BTreeMap::new();
        for id in ["1", "2"] {
            snapshots.insert(
                key.record_key(id),
                StoredSnapshot {
                    thread_id: "t1".into(),
                    namespace: "ns".into(),
                    id: id.into(),
                    parent_id: None,
                    format_tag: "json".into(),
                    checkpoint: crate::types::EncodedBlob {
                        value: "{}".into(),
                        is_binary: false,
                        is_offloaded: false,
                    },
                    metadata: crate::types::EncodedBlob {
                        value: "{}".into(),
                        is_binary: false,
                        is_offloaded: false,
                    },
                    created_at: Timestamp::now(),
                },
            );
        }
        write_json_atomic(
            &checkpoints.join(format!("{}.json", key.file_digest())),
            &snapshots,
            false,
        )
        .unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"garbage").unwrap();

        let index = load(&dir);
        assert!(index.contains(&key));
        assert_eq!(index.snapshot_count(), 2);
    }

    #[test]
    fn test_rebuild_keeps_threads_with_only_writes() {
        let dir = TempDir::new().unwrap();
        let writes_dir = dir.path().join("writes");
        fs::create_dir_all(&writes_dir).unwrap();

        let key = ThreadKey::new("run:7", "sub:graph");
        let mut writes = BTreeMap::new();
        writes.insert(
            key.record_key("42"),
            vec![WriteRecord {
                snapshot_id: "42".into(),
                task_id: "task".into(),
                index: 0,
                channel: "messages".into(),
                format_tag: "json".into(),
                value: crate::types::EncodedBlob {
                    value: "1".into(),
                    is_binary: false,
                    is_offloaded: false,
                },
            }],
        );
        write_json_atomic(
            &writes_dir.join(format!("{}.json", key.file_digest())),
            &writes,
            false,
        )
        .unwrap();

        let index = load(&dir);
        index.rebuild().unwrap();
        assert_eq!(index.thread_keys(), vec![key]);
        assert_eq!(index.snapshot_count(), 0);
    }

    #[test]
    fn test_writes_owner_matches_digest() {
        let key = ThreadKey::new("a:b", "c");
        let hex = key.file_digest().to_hex();

        assert_eq!(writes_owner(&key.record_key("9"), "9", &hex), Some(key));
        assert_eq!(writes_owner("a:b:c:9", "9", "00"), None);
        assert_eq!(writes_owner("unrelated", "9", &hex), None);
    }
}
