// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicU64, Ordering};

use crate::tailing::record::Record;
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::tracked_file::FileSnapshot;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A batch of records on its way to the destination.
///
/// Buffer ids increase with creation order across the process and are used
/// to keep a late acknowledgement from moving a checkpoint backwards.
pub struct RecordBuffer {
    id: u64,
    records: Vec<Record>,
    created: Option<Instant>,
    size_bytes: u64,
    per_record_overhead: usize,
    per_buffer_overhead: usize,
    /// Highest end offset per file already delivered from an earlier,
    /// partially successful attempt of this buffer.
    acknowledged: HashMap<FileId, (Arc<FileSnapshot>, u64)>,
}

impl RecordBuffer {
    /// Id the next buffer created will get.
    pub fn next_id() -> u64 {
        NEXT_BUFFER_ID.load(Ordering::SeqCst)
    }

    pub fn new(per_record_overhead: usize, per_buffer_overhead: usize) -> Self {
        Self {
            id: NEXT_BUFFER_ID.fetch_add(1, Ordering::SeqCst),
            records: Vec::new(),
            created: None,
            size_bytes: 0,
            per_record_overhead,
            per_buffer_overhead,
            acknowledged: HashMap::new(),
        }
    }

    pub fn add(&mut self, record: Record) {
        self.size_bytes += record.length_with_overhead(self.per_record_overhead);
        self.records.push(record);
        if self.created.is_none() {
            self.created = Some(Instant::now());
        }
    }

    /// Size after adding a record of `record_bytes`, including all overhead.
    pub fn size_with(&self, record_bytes: u64) -> u64 {
        self.size_bytes_with_overhead() + record_bytes + self.per_record_overhead as u64
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the first record was added.
    pub fn age(&self) -> Duration {
        self.created.map(|c| c.elapsed()).unwrap_or_default()
    }

    pub fn size_records(&self) -> usize {
        self.records.len()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn size_bytes_with_overhead(&self) -> u64 {
        self.size_bytes + self.per_buffer_overhead as u64
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn last_record(&self) -> Option<&Record> {
        self.records.last()
    }

    pub fn checkpoint_file(&self) -> Option<&Arc<FileSnapshot>> {
        self.records.last().map(|r| r.file())
    }

    pub fn checkpoint_offset(&self) -> Option<u64> {
        self.records.last().map(|r| r.end_offset())
    }

    /// Remove the records at the given ascending indices, keeping the order
    /// of the rest. Returns the removed records.
    pub fn remove(&mut self, sorted_indices: &[usize]) -> Vec<Record> {
        if sorted_indices.is_empty() {
            return Vec::new();
        }
        let mut removed = Vec::with_capacity(sorted_indices.len());
        let mut kept = Vec::with_capacity(self.records.len());
        let mut targets = sorted_indices.iter().peekable();
        for (i, record) in self.records.drain(..).enumerate() {
            if targets.peek() == Some(&&i) {
                targets.next();
                self.size_bytes -= record.length_with_overhead(self.per_record_overhead);
                removed.push(record);
            } else {
                kept.push(record);
            }
        }
        self.records = kept;
        removed
    }

    /// Remember records delivered by a partially successful attempt so the
    /// final commit of this buffer covers them.
    pub fn mark_acknowledged(&mut self, delivered: &[Record]) {
        for record in delivered {
            let entry = self
                .acknowledged
                .entry(record.file().id)
                .or_insert_with(|| (record.file().clone(), 0));
            if record.end_offset() >= entry.1 {
                *entry = (record.file().clone(), record.end_offset());
            }
        }
    }

    /// End offset of the last record of each file, for a fully delivered buffer.
    pub fn end_offsets(&self) -> Vec<(Arc<FileSnapshot>, u64)> {
        let mut ends = self.acknowledged.clone();
        for record in &self.records {
            let entry = ends
                .entry(record.file().id)
                .or_insert_with(|| (record.file().clone(), 0));
            if record.end_offset() >= entry.1 {
                *entry = (record.file().clone(), record.end_offset());
            }
        }
        sorted(ends)
    }

    /// Offsets safe to commit when only `succeeded` records were delivered:
    /// per file, the end of the delivered run before its first failed record.
    pub fn committable_offsets(&self, succeeded: &[usize]) -> Vec<(Arc<FileSnapshot>, u64)> {
        let mut ends: HashMap<FileId, (Arc<FileSnapshot>, u64)> = HashMap::new();
        let mut blocked: Vec<FileId> = Vec::new();
        let mut delivered = succeeded.iter().peekable();
        for (i, record) in self.records.iter().enumerate() {
            let id = record.file().id;
            let ok = delivered.peek() == Some(&&i);
            if ok {
                delivered.next();
            }
            if blocked.contains(&id) {
                continue;
            }
            if ok {
                ends.insert(id, (record.file().clone(), record.end_offset()));
            } else {
                blocked.push(id);
            }
        }
        sorted(ends)
    }
}

fn sorted(ends: HashMap<FileId, (Arc<FileSnapshot>, u64)>) -> Vec<(Arc<FileSnapshot>, u64)> {
    let mut ends: Vec<_> = ends.into_values().collect();
    ends.sort_by_key(|(f, _)| f.id);
    ends
}

impl fmt::Debug for RecordBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordBuffer")
            .field("id", &self.id)
            .field("records", &self.records.len())
            .field("bytes", &self.size_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file(ino: u64) -> Arc<FileSnapshot> {
        Arc::new(FileSnapshot {
            id: FileId::new(1, ino),
            path: PathBuf::from(format!("/logs/{}.log", ino)),
            last_modified: 0,
            size: 1000,
        })
    }

    fn record(f: &Arc<FileSnapshot>, start: u64, len: u64) -> Record {
        let mut raw = vec![b'x'; len as usize - 1];
        raw.push(b'\n');
        Record::new(f.clone(), start, &raw, b'\n', false)
    }

    #[test]
    fn test_ids_increase() {
        let a = RecordBuffer::new(0, 0);
        let b = RecordBuffer::new(0, 0);
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_sizes_and_age() {
        let f = file(1);
        let mut buf = RecordBuffer::new(2, 10);
        assert_eq!(buf.age(), Duration::ZERO);
        buf.add(record(&f, 0, 5));
        buf.add(record(&f, 5, 5));
        // 4 payload bytes + 2 overhead each
        assert_eq!(buf.size_bytes(), 12);
        assert_eq!(buf.size_bytes_with_overhead(), 22);
        assert_eq!(buf.size_with(4), 28);
        assert_eq!(buf.checkpoint_offset(), Some(10));
    }

    #[test]
    fn test_remove_keeps_order() {
        let f = file(1);
        let mut buf = RecordBuffer::new(0, 0);
        for i in 0..10 {
            buf.add(record(&f, i * 10, 10));
        }
        let removed = buf.remove(&[0, 1, 3, 4, 5, 7, 8, 9]);
        assert_eq!(removed.len(), 8);
        let left: Vec<u64> = buf.iter().map(|r| r.start_offset()).collect();
        assert_eq!(left, vec![20, 60]);
        assert_eq!(buf.size_bytes(), 18);
    }

    #[test]
    fn test_committable_offsets_stop_at_first_failure() {
        let a = file(1);
        let b = file(2);
        let mut buf = RecordBuffer::new(0, 0);
        buf.add(record(&a, 0, 10)); // 0 ok
        buf.add(record(&b, 0, 10)); // 1 ok
        buf.add(record(&a, 10, 10)); // 2 failed
        buf.add(record(&a, 20, 10)); // 3 ok
        buf.add(record(&b, 10, 10)); // 4 ok

        let offsets = buf.committable_offsets(&[0, 1, 3, 4]);
        assert_eq!(offsets.len(), 2);
        assert_eq!(offsets[0].0.id, a.id);
        assert_eq!(offsets[0].1, 10);
        assert_eq!(offsets[1].0.id, b.id);
        assert_eq!(offsets[1].1, 20);
    }

    #[test]
    fn test_end_offsets_include_acknowledged() {
        let a = file(1);
        let mut buf = RecordBuffer::new(0, 0);
        buf.add(record(&a, 0, 10));
        buf.add(record(&a, 10, 10));
        buf.add(record(&a, 20, 10));

        let delivered = buf.remove(&[0, 2]);
        buf.mark_acknowledged(&delivered);
        assert_eq!(buf.size_records(), 1);

        let ends = buf.end_offsets();
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].1, 30);
    }
}
