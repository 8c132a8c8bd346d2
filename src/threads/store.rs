//! Thread store implementation.

use crate::error::Result;
use crate::persist::{read_json, remove_if_exists, write_json_atomic, JsonFile};
use crate::types::{sort_ids_descending, StoredSnapshot, ThreadKey, WriteRecord};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory holding one snapshot map per thread partition.
pub const CHECKPOINTS_DIR: &str = "checkpoints";

/// Directory holding one write map per thread partition.
pub const WRITES_DIR: &str = "writes";

/// In-memory records of one thread partition.
#[derive(Clone, Debug, Default)]
pub struct ThreadState {
    /// Composite key -> snapshot.
    pub snapshots: BTreeMap<String, StoredSnapshot>,

    /// Composite key -> writes recorded against that snapshot, in append order.
    pub writes: BTreeMap<String, Vec<WriteRecord>>,
}

impl ThreadState {
    /// Snapshot ids, newest first.
    pub fn sorted_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.snapshots.values().map(|s| s.id.clone()).collect();
        sort_ids_descending(&mut ids);
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty() && self.writes.is_empty()
    }
}

/// Write-back cache over the per-thread JSON files.
pub struct ThreadStore {
    checkpoints_dir: PathBuf,
    writes_dir: PathBuf,
    pretty: bool,

    /// Loaded threads. Once present, a thread is never re-read from disk
    /// unless it is evicted.
    threads: RwLock<HashMap<ThreadKey, ThreadState>>,

    /// Threads with changes not yet written back.
    dirty: Mutex<HashSet<ThreadKey>>,
}

impl ThreadStore {
    /// Create a thread store under the store root.
    pub fn new(root: impl AsRef<Path>, pretty: bool) -> Result<Self> {
        let root = root.as_ref();
        let checkpoints_dir = root.join(CHECKPOINTS_DIR);
        let writes_dir = root.join(WRITES_DIR);
        fs::create_dir_all(&checkpoints_dir)?;
        fs::create_dir_all(&writes_dir)?;

        Ok(Self {
            checkpoints_dir,
            writes_dir,
            pretty,
            threads: RwLock::new(HashMap::new()),
            dirty: Mutex::new(HashSet::new()),
        })
    }

    pub fn checkpoints_dir(&self) -> &Path {
        &self.checkpoints_dir
    }

    pub fn writes_dir(&self) -> &Path {
        &self.writes_dir
    }

    fn checkpoints_path(&self, key: &ThreadKey) -> PathBuf {
        self.checkpoints_dir
            .join(format!("{}.json", key.file_digest().to_hex()))
    }

    fn writes_path(&self, key: &ThreadKey) -> PathBuf {
        self.writes_dir
            .join(format!("{}.json", key.file_digest().to_hex()))
    }

    pub fn is_loaded(&self, key: &ThreadKey) -> bool {
        self.threads.read().contains_key(key)
    }

    /// Load a thread into memory.
    ///
    /// No-op if already loaded. Threads the index has never seen start empty
    /// without touching disk. Unreadable files degrade to empty maps.
    pub fn load(&self, key: &ThreadKey, persisted: bool) -> Result<()> {
        if self.is_loaded(key) {
            return Ok(());
        }

        let state = if persisted {
            ThreadState {
                snapshots: self.read_map(&self.checkpoints_path(key), key)?,
                writes: self.read_map(&self.writes_path(key), key)?,
            }
        } else {
            ThreadState::default()
        };

        debug!(
            target: "checkpoint::threads",
            thread = %key,
            snapshots = state.snapshots.len(),
            persisted,
            "Loaded thread"
        );

        self.threads.write().entry(key.clone()).or_insert(state);
        Ok(())
    }

    fn read_map<T: DeserializeOwned>(
        &self,
        path: &Path,
        key: &ThreadKey,
    ) -> Result<BTreeMap<String, T>> {
        match read_json(path)? {
            JsonFile::Loaded(map) => Ok(map),
            JsonFile::Missing => Ok(BTreeMap::new()),
            JsonFile::Corrupt(e) => {
                warn!(
                    target: "checkpoint::threads",
                    thread = %key,
                    path = %path.display(),
                    error = %e,
                    "Thread file is unreadable, treating it as empty"
                );
                Ok(BTreeMap::new())
            }
        }
    }

    /// Run `f` against a loaded thread.
    pub fn read<R>(&self, key: &ThreadKey, f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
        self.threads.read().get(key).map(f)
    }

    /// Run `f` against a thread's mutable state, creating it if absent.
    ///
    /// Callers decide whether the change needs `mark_dirty`.
    pub fn update<R>(&self, key: &ThreadKey, f: impl FnOnce(&mut ThreadState) -> R) -> R {
        let mut threads = self.threads.write();
        f(threads.entry(key.clone()).or_default())
    }

    pub fn mark_dirty(&self, key: &ThreadKey) {
        self.dirty.lock().insert(key.clone());
    }

    pub fn is_dirty(&self, key: &ThreadKey) -> bool {
        self.dirty.lock().contains(key)
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.lock().len()
    }

    pub fn loaded_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Write a dirty thread back to disk. Returns whether anything was written.
    pub fn save(&self, key: &ThreadKey) -> Result<bool> {
        if !self.is_dirty(key) {
            return Ok(false);
        }

        {
            let threads = self.threads.read();
            if let Some(state) = threads.get(key) {
                write_json_atomic(&self.checkpoints_path(key), &state.snapshots, self.pretty)?;

                let prefix = key.key_prefix();
                let writes: BTreeMap<&String, &Vec<WriteRecord>> = state
                    .writes
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix))
                    .collect();
                write_json_atomic(&self.writes_path(key), &writes, self.pretty)?;

                debug!(
                    target: "checkpoint::threads",
                    thread = %key,
                    snapshots = state.snapshots.len(),
                    write_batches = writes.len(),
                    "Flushed thread"
                );
            }
        }

        self.dirty.lock().remove(key);
        Ok(true)
    }

    /// Write back every dirty thread. Returns the number of threads written.
    pub fn flush_all(&self) -> Result<usize> {
        let dirty: Vec<ThreadKey> = self.dirty.lock().iter().cloned().collect();
        let mut flushed = 0;
        for key in dirty {
            if self.save(&key)? {
                flushed += 1;
            }
        }
        Ok(flushed)
    }

    /// Drop a thread from memory without writing it back.
    pub fn evict(&self, key: &ThreadKey) -> Option<ThreadState> {
        self.dirty.lock().remove(key);
        self.threads.write().remove(key)
    }

    /// Delete a thread's files from disk.
    pub fn delete_files(&self, key: &ThreadKey) -> Result<()> {
        remove_if_exists(&self.checkpoints_path(key))?;
        remove_if_exists(&self.writes_path(key))?;
        Ok(())
    }

    /// Drop every cached thread and delete every thread file.
    pub fn clear(&self) -> Result<()> {
        self.dirty.lock().clear();
        self.threads.write().clear();

        for dir in [&self.checkpoints_dir, &self.writes_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
