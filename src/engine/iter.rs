//! Snapshot reconstruction and the lazy listing iterator.

use crate::blobs::BlobCodec;
use crate::error::{Result, StoreError};
use crate::format::SnapshotSerializer;
use crate::types::{
    Checkpoint, CheckpointBody, CheckpointTuple, EncodedBlob, Metadata, PendingWrite,
    SnapshotAddress, StoredSnapshot, WriteRecord, TASKS,
};
use serde_json::Value;

/// Decodes stored records into caller-facing snapshots.
#[derive(Clone, Copy)]
pub(crate) struct Reconstructor<'a> {
    codec: &'a BlobCodec,
    serializer: &'a dyn SnapshotSerializer,
}

impl<'a> Reconstructor<'a> {
    pub(crate) fn new(codec: &'a BlobCodec, serializer: &'a dyn SnapshotSerializer) -> Self {
        Self { codec, serializer }
    }

    fn decode_value(&self, tag: &str, blob: &EncodedBlob) -> Result<Value> {
        let payload = self.codec.decode(blob)?;
        self.serializer.loads_typed(tag, &payload)
    }

    pub(crate) fn decode_metadata(&self, record: &StoredSnapshot) -> Result<Metadata> {
        match self.decode_value(&record.format_tag, &record.metadata)? {
            Value::Object(map) => Ok(map),
            Value::Null => Ok(Metadata::new()),
            other => Err(StoreError::Corruption(format!(
                "metadata of snapshot {} is not an object: {}",
                record.id, other
            ))),
        }
    }

    pub(crate) fn decode_checkpoint(&self, record: &StoredSnapshot) -> Result<Checkpoint> {
        let body: CheckpointBody = serde_json::from_value(
            self.decode_value(&record.format_tag, &record.checkpoint)?,
        )
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;

        Ok(Checkpoint {
            id: body.id,
            data: body.data,
            pending_sends: Vec::new(),
        })
    }

    /// Task sends the parent forwarded, ordered by write index.
    fn pending_sends(&self, parent_writes: &[WriteRecord]) -> Result<Vec<Value>> {
        let mut sends: Vec<&WriteRecord> = parent_writes
            .iter()
            .filter(|w| w.channel == TASKS)
            .collect();
        sends.sort_by_key(|w| w.index);

        sends
            .into_iter()
            .map(|w| self.decode_value(&w.format_tag, &w.value))
            .collect()
    }

    /// Rebuild a full snapshot from its record, its writes, and its parent's writes.
    pub(crate) fn build(
        &self,
        record: &StoredSnapshot,
        writes: &[WriteRecord],
        parent_writes: &[WriteRecord],
    ) -> Result<CheckpointTuple> {
        let mut checkpoint = self.decode_checkpoint(record)?;
        let metadata = self.decode_metadata(record)?;

        if record.parent_id.is_some() {
            checkpoint.pending_sends = self.pending_sends(parent_writes)?;
        }

        let pending_writes = writes
            .iter()
            .map(|w| {
                Ok(PendingWrite {
                    task_id: w.task_id.clone(),
                    channel: w.channel.clone(),
                    value: self.decode_value(&w.format_tag, &w.value)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let address = SnapshotAddress::new(&record.thread_id, &record.namespace, &record.id);
        let parent_address = record
            .parent_id
            .as_ref()
            .map(|parent| SnapshotAddress::new(&record.thread_id, &record.namespace, parent));

        Ok(CheckpointTuple {
            address,
            checkpoint,
            metadata,
            parent_address,
            pending_writes,
        })
    }
}

/// Everything needed to rebuild one listed snapshot, captured at list time.
pub(crate) struct ListEntry {
    pub(crate) record: StoredSnapshot,
    pub(crate) writes: Vec<WriteRecord>,
    pub(crate) parent_writes: Vec<WriteRecord>,
}

/// Lazy, newest-first sequence of reconstructed snapshots.
///
/// The set of snapshots is fixed when the iterator is created; changes made
/// to the thread afterwards are not reflected. Blobs are decoded as items are
/// pulled, so a missing offloaded blob fails only its own item.
pub struct SnapshotIter<'a> {
    reconstructor: Reconstructor<'a>,
    entries: std::vec::IntoIter<ListEntry>,
}

impl<'a> SnapshotIter<'a> {
    pub(crate) fn new(reconstructor: Reconstructor<'a>, entries: Vec<ListEntry>) -> Self {
        Self {
            reconstructor,
            entries: entries.into_iter(),
        }
    }
}

impl Iterator for SnapshotIter<'_> {
    type Item = Result<CheckpointTuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entries.next()?;
        Some(
            self.reconstructor
                .build(&entry.record, &entry.writes, &entry.parent_writes),
        )
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for SnapshotIter<'_> {}
