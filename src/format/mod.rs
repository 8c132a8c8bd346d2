//! Pluggable serialization of checkpoint bodies, metadata, and write values.
//!
//! A serializer turns a JSON value into a tagged [`Payload`](crate::Payload).
//! The tag is stored next to the encoded blob so a record can only be read
//! back by the format that wrote it.

mod serializer;

pub use serializer::{JsonSerializer, MessagePackSerializer, SnapshotSerializer};
