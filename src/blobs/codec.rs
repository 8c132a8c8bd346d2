//! Blob codec implementation.

use crate::error::{Result, StoreError};
use crate::persist::write_bytes_atomic;
use crate::types::{EncodedBlob, KeyDigest, Payload};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Payloads strictly longer than this many bytes are offloaded.
pub const DEFAULT_OFFLOAD_THRESHOLD: usize = 5_000_000;

/// Default byte budget of the offloaded blob read cache.
pub const DEFAULT_BLOB_CACHE_BYTES: usize = 64 * 1024 * 1024;

/// Directory (relative to the store root) holding offloaded blobs.
const DATA_DIR: &str = "data";

/// Extension of offloaded blob files.
const BLOB_EXTENSION: &str = "data";

/// Encodes payloads for storage inside JSON records.
pub struct BlobCodec {
    /// Store root; offloaded paths are recorded relative to it.
    root: PathBuf,

    /// Size above which payloads are written to their own file.
    threshold: usize,

    /// Recently read offloaded blobs, keyed by relative path.
    cache: Mutex<BlobCache>,
}

/// LRU of blob contents bounded by entry count and total bytes.
struct BlobCache {
    entries: LruCache<String, Vec<u8>>,
    bytes: usize,
    max_bytes: usize,
}

impl BlobCache {
    fn new(capacity: NonZeroUsize, max_bytes: usize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            bytes: 0,
            max_bytes,
        }
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, value: Vec<u8>) {
        self.remove(&key);
        if value.len() > self.max_bytes {
            return;
        }

        self.bytes += value.len();
        if let Some((_, evicted)) = self.entries.push(key, value) {
            self.bytes = self.bytes.saturating_sub(evicted.len());
        }
        while self.bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.bytes = self.bytes.saturating_sub(evicted.len()),
                None => break,
            }
        }
    }

    fn remove(&mut self, key: &str) {
        if let Some(old) = self.entries.pop(key) {
            self.bytes = self.bytes.saturating_sub(old.len());
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

impl BlobCodec {
    /// Create a codec rooted at the store directory.
    pub fn new(root: impl AsRef<Path>, threshold: usize, cache_size: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(DATA_DIR))?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            root,
            threshold,
            cache: Mutex::new(BlobCache::new(cache_size, DEFAULT_BLOB_CACHE_BYTES)),
        })
    }

    /// Cap the read cache at `max_bytes` of blob content.
    pub fn with_cache_bytes(self, max_bytes: usize) -> Self {
        self.cache.lock().max_bytes = max_bytes;
        self
    }

    /// Bytes of blob content currently cached.
    pub fn cached_bytes(&self) -> usize {
        self.cache.lock().bytes
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode a payload under a logical blob id.
    ///
    /// Oversized payloads are written verbatim to `data/<digest(id)>.data` and
    /// the returned value is that relative path. Everything else is inlined:
    /// text as-is, binary as base64.
    pub fn encode(&self, payload: &Payload, id: &str) -> Result<EncodedBlob> {
        let is_binary = payload.is_binary();

        if payload.len() > self.threshold {
            let relative = self.blob_path(id);
            let bytes: &[u8] = match payload {
                Payload::Text(text) => text.as_bytes(),
                Payload::Binary(bytes) => bytes,
            };
            self.write_blob(&relative, bytes)?;
            debug!(
                target: "checkpoint::blobs",
                blob_id = %id,
                path = %relative,
                bytes = bytes.len(),
                "Offloaded payload"
            );
            return Ok(EncodedBlob {
                value: relative,
                is_binary,
                is_offloaded: true,
            });
        }

        let value = match payload {
            Payload::Text(text) => text.clone(),
            Payload::Binary(bytes) => STANDARD.encode(bytes),
        };

        Ok(EncodedBlob {
            value,
            is_binary,
            is_offloaded: false,
        })
    }

    /// Decode a stored blob back into its payload.
    ///
    /// The `is_binary` flag is trusted as recorded: offloaded bytes are never
    /// sniffed to guess whether they were text.
    pub fn decode(&self, blob: &EncodedBlob) -> Result<Payload> {
        if !blob.is_offloaded {
            return if blob.is_binary {
                Ok(Payload::Binary(STANDARD.decode(&blob.value)?))
            } else {
                Ok(Payload::Text(blob.value.clone()))
            };
        }

        let bytes = self.read_blob(&blob.value)?;
        if blob.is_binary {
            Ok(Payload::Binary(bytes))
        } else {
            String::from_utf8(bytes).map(Payload::Text).map_err(|_| {
                StoreError::Corruption(format!("text blob {} is not valid UTF-8", blob.value))
            })
        }
    }

    /// Remove the file behind an offloaded blob. Inline blobs are a no-op.
    pub fn remove(&self, blob: &EncodedBlob) -> Result<bool> {
        if !blob.is_offloaded {
            return Ok(false);
        }

        self.cache.lock().remove(&blob.value);

        match fs::remove_file(self.resolve(&blob.value)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Relative path of the blob file for a logical id.
    pub fn blob_path(&self, id: &str) -> String {
        format!(
            "{}/{}.{}",
            DATA_DIR,
            KeyDigest::from_key(id).to_hex(),
            BLOB_EXTENSION
        )
    }

    /// Whether a blob file exists for a logical id.
    pub fn exists(&self, id: &str) -> bool {
        self.resolve(&self.blob_path(id)).exists()
    }

    /// List the digests of all offloaded blob files.
    pub fn list(&self) -> Result<Vec<KeyDigest>> {
        let mut digests = Vec::new();

        for entry in fs::read_dir(self.root.join(DATA_DIR))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(digest) = KeyDigest::from_hex(stem) {
                    digests.push(digest);
                }
            }
        }

        Ok(digests)
    }

    /// Get total size of all offloaded blobs.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for entry in fs::read_dir(self.root.join(DATA_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                total += entry.metadata()?.len();
            }
        }

        Ok(total)
    }

    /// Delete every offloaded blob.
    pub fn clear(&self) -> Result<()> {
        self.cache.lock().clear();

        let dir = self.root.join(DATA_DIR);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(())
    }

    fn write_blob(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        self.cache.lock().remove(relative);
        write_bytes_atomic(&self.resolve(relative), bytes)
    }

    fn read_blob(&self, relative: &str) -> Result<Vec<u8>> {
        if let Some(cached) = self.cache.lock().get(relative) {
            return Ok(cached);
        }

        let path = self.resolve(relative);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::BlobNotFound(path));
            }
            Err(e) => return Err(e.into()),
        };

        self.cache.lock().insert(relative.to_string(), bytes.clone());
        Ok(bytes)
    }

    fn resolve(&self, relative: &str) -> PathBuf {
        let path = Path::new(relative);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn codec(dir: &TempDir, threshold: usize) -> BlobCodec {
        BlobCodec::new(dir.path(), threshold, 8).unwrap()
    }

    #[test]
    fn test_small_text_is_inline() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 16);

        let encoded = codec.encode(&Payload::Text("hello".into()), "t:ns:1_payload").unwrap();
        assert_eq!(encoded.value, "hello");
        assert!(!encoded.is_offloaded);
        assert!(!encoded.is_binary);
        assert!(!codec.exists("t:ns:1_payload"));
    }

    #[test]
    fn test_small_binary_is_base64() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 16);

        let encoded = codec.encode(&Payload::Binary(vec![0, 159, 146, 150]), "id").unwrap();
        assert!(encoded.is_binary);
        assert_eq!(encoded.value, STANDARD.encode([0u8, 159, 146, 150]));
        assert_eq!(
            codec.decode(&encoded).unwrap(),
            Payload::Binary(vec![0, 159, 146, 150])
        );
    }

    #[test]
    fn test_oversized_text_is_offloaded() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 16);

        let text = "x".repeat(17);
        let encoded = codec.encode(&Payload::Text(text.clone()), "big").unwrap();
        assert!(encoded.is_offloaded);
        assert_eq!(encoded.value, codec.blob_path("big"));
        assert_eq!(fs::read_to_string(dir.path().join(&encoded.value)).unwrap(), text);
        assert_eq!(codec.decode(&encoded).unwrap(), Payload::Text(text));
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 16);

        let at_limit = codec.encode(&Payload::Text("y".repeat(16)), "edge").unwrap();
        assert!(!at_limit.is_offloaded);
    }

    #[test]
    fn test_binary_that_parses_as_json_stays_binary() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let bytes = br#"{"looks": "like json"}"#.to_vec();
        let encoded = codec.encode(&Payload::Binary(bytes.clone()), "json-bytes").unwrap();
        assert!(encoded.is_offloaded);
        assert_eq!(codec.decode(&encoded).unwrap(), Payload::Binary(bytes));
    }

    #[test]
    fn test_missing_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let encoded = codec.encode(&Payload::Text("gone soon".into()), "gone").unwrap();
        fs::remove_file(dir.path().join(&encoded.value)).unwrap();

        assert!(matches!(
            codec.decode(&encoded),
            Err(StoreError::BlobNotFound(_))
        ));
    }

    #[test]
    fn test_same_id_overwrites_same_file() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let first = codec.encode(&Payload::Text("first value".into()), "k").unwrap();
        let second = codec.encode(&Payload::Text("second value".into()), "k").unwrap();
        assert_eq!(first.value, second.value);
        assert_eq!(codec.list().unwrap().len(), 1);
        assert_eq!(
            codec.decode(&first).unwrap(),
            Payload::Text("second value".into())
        );
    }

    #[test]
    fn test_remove() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let encoded = codec.encode(&Payload::Text("to be deleted".into()), "del").unwrap();
        assert!(codec.exists("del"));
        assert!(codec.remove(&encoded).unwrap());
        assert!(!codec.exists("del"));
        assert!(!codec.remove(&encoded).unwrap());
    }

    #[test]
    fn test_list_and_clear() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 2);

        codec.encode(&Payload::Text("content1".into()), "a").unwrap();
        codec.encode(&Payload::Text("content2".into()), "b").unwrap();
        codec.encode(&Payload::Binary(b"content3".to_vec()), "c").unwrap();

        assert_eq!(codec.list().unwrap().len(), 3);
        assert_eq!(codec.total_size().unwrap(), 24);

        codec.clear().unwrap();
        assert!(codec.list().unwrap().is_empty());
    }

    #[test]
    fn test_writes_are_not_cached() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let encoded = codec.encode(&Payload::Text("offloaded text".into()), "w").unwrap();
        assert_eq!(codec.cached_bytes(), 0);

        codec.decode(&encoded).unwrap();
        assert_eq!(codec.cached_bytes(), 14);
    }

    #[test]
    fn test_cache_is_bounded_by_bytes() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4).with_cache_bytes(25);

        let a = codec.encode(&Payload::Text("a".repeat(10)), "a").unwrap();
        let b = codec.encode(&Payload::Text("b".repeat(10)), "b").unwrap();
        let c = codec.encode(&Payload::Text("c".repeat(10)), "c").unwrap();
        let huge = codec.encode(&Payload::Text("h".repeat(40)), "huge").unwrap();

        codec.decode(&a).unwrap();
        codec.decode(&b).unwrap();
        assert_eq!(codec.cached_bytes(), 20);

        // Evicts `a` to stay under budget.
        codec.decode(&c).unwrap();
        assert_eq!(codec.cached_bytes(), 20);

        // Larger than the whole budget, never cached.
        assert_eq!(codec.decode(&huge).unwrap(), Payload::Text("h".repeat(40)));
        assert_eq!(codec.cached_bytes(), 20);

        fs::remove_file(dir.path().join(&a.value)).unwrap();
        assert!(matches!(codec.decode(&a), Err(StoreError::BlobNotFound(_))));
    }

    #[test]
    fn test_rewrite_invalidates_cached_copy() {
        let dir = TempDir::new().unwrap();
        let codec = codec(&dir, 4);

        let first = codec.encode(&Payload::Text("first value".into()), "k").unwrap();
        codec.decode(&first).unwrap();
        codec.encode(&Payload::Text("second value".into()), "k").unwrap();

        assert_eq!(
            codec.decode(&first).unwrap(),
            Payload::Text("second value".into())
        );
    }
}
