//! Blob codec: inline storage for small payloads, key-addressed files for
//! oversized ones.
//!
//! Offloaded blobs live under `data/`, named by a digest of the caller's
//! logical blob id (not of the content), so rewriting a payload under the
//! same id replaces the same file.

mod codec;

pub use codec::{BlobCodec, DEFAULT_BLOB_CACHE_BYTES, DEFAULT_OFFLOAD_THRESHOLD};
