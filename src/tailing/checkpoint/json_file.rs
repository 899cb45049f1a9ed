// SPDX-License-Identifier: Apache-2.0

//! Checkpoint store persisted as a single JSON file.
//!
//! Writes are atomic using a write-to-temp-then-rename strategy.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::tailing::checkpoint::schema::{
    CHECKPOINT_SCHEMA_VERSION, CheckpointEntryV1, CheckpointStateV1, FileCheckpoint,
    checkpoint_key,
};
use crate::tailing::checkpoint::store::CheckpointStore;
use crate::tailing::error::{Error, Result};
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::tracked_file::{FileSnapshot, TrackedFile};

pub struct JsonFileCheckpointStore {
    path: PathBuf,
    /// `None` after a failed write; reloaded from disk on next use.
    state: Mutex<Option<CheckpointStateV1>>,
}

impl JsonFileCheckpointStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = load(&path)?;
        info!(path = ?path, rows = state.checkpoints.len(), "Opened checkpoint store");
        Ok(Self {
            path,
            state: Mutex::new(Some(state)),
        })
    }

    /// Create an in-memory store (useful for testing)
    pub fn open_memory() -> Self {
        Self {
            path: PathBuf::new(),
            state: Mutex::new(Some(CheckpointStateV1::default())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn is_memory(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    fn read<T>(&self, f: impl FnOnce(&CheckpointStateV1) -> T) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if guard.is_none() {
            debug!(path = ?self.path, "Reloading checkpoint store");
            *guard = Some(load(&self.path)?);
        }
        match guard.as_ref() {
            Some(state) => Ok(f(state)),
            None => Err(Error::Persistence("checkpoint state unavailable".to_string())),
        }
    }

    /// Apply `f` and persist the result. `f` reports whether it changed
    /// anything; unchanged state is not rewritten.
    fn transaction<T>(&self, f: impl FnOnce(&mut CheckpointStateV1) -> (T, bool)) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if guard.is_none() {
            debug!(path = ?self.path, "Reloading checkpoint store");
            *guard = Some(load(&self.path)?);
        }
        let Some(state) = guard.as_mut() else {
            return Err(Error::Persistence("checkpoint state unavailable".to_string()));
        };

        let (out, changed) = f(state);
        if !changed || self.is_memory() {
            return Ok(out);
        }
        if let Err(e) = atomic_write(&self.path, state) {
            // the file still holds the last committed state
            *guard = None;
            return Err(e);
        }
        Ok(out)
    }
}

impl CheckpointStore for JsonFileCheckpointStore {
    fn save_checkpoint(&self, flow: &str, file: &TrackedFile, offset: u64) -> Result<()> {
        let entry = CheckpointEntryV1 {
            flow: flow.to_string(),
            path: file.path().to_string_lossy().into_owned(),
            dev: file.id().dev(),
            ino: file.id().ino(),
            last_modified: file.last_modified(),
            size: file.size(),
            offset,
            header_length: file.header().len(),
            header_sha256: Some(file.header().sha256().to_string()),
            last_updated: Utc::now(),
        };
        self.transaction(|state| {
            state.checkpoints.insert(entry.key(), entry);
            ((), true)
        })?;
        debug!(flow, file_id = %file.id(), path = ?file.path(), offset, "Saved checkpoint");
        Ok(())
    }

    fn save_checkpoint_batch_after_send(
        &self,
        flow: &str,
        offsets: &[(Arc<FileSnapshot>, u64)],
    ) -> Result<usize> {
        let now = Utc::now();
        self.transaction(|state| {
            let mut written = 0;
            for (file, offset) in offsets {
                let key = checkpoint_key(flow, file.id);
                match state.checkpoints.get_mut(&key) {
                    Some(entry) => {
                        entry.offset = entry.offset.max(*offset);
                        entry.path = file.path.to_string_lossy().into_owned();
                        entry.last_modified = file.last_modified;
                        entry.size = file.size;
                        entry.last_updated = now;
                        written += 1;
                    }
                    None if file.path.exists() => {
                        state.checkpoints.insert(
                            key,
                            CheckpointEntryV1 {
                                flow: flow.to_string(),
                                path: file.path.to_string_lossy().into_owned(),
                                dev: file.id.dev(),
                                ino: file.id.ino(),
                                last_modified: file.last_modified,
                                size: file.size,
                                offset: *offset,
                                header_length: 0,
                                header_sha256: None,
                                last_updated: now,
                            },
                        );
                        written += 1;
                    }
                    None => {
                        debug!(flow, path = ?file.path, "Not checkpointing file that no longer exists");
                    }
                }
            }
            (written, written > 0)
        })
    }

    fn get_offset_for_file_id(&self, flow: &str, id: FileId) -> Result<u64> {
        let key = checkpoint_key(flow, id);
        self.read(|state| state.checkpoints.get(&key).map(|e| e.offset).unwrap_or(0))
    }

    fn get_checkpoint_for_flow(&self, flow: &str) -> Result<Option<FileCheckpoint>> {
        self.read(|state| {
            state
                .checkpoints
                .values()
                .filter(|e| e.flow == flow)
                .max_by_key(|e| e.last_updated)
                .map(FileCheckpoint::from)
        })
    }

    fn get_all_checkpoints_for_flow(&self, flow: &str) -> Result<Vec<FileCheckpoint>> {
        self.read(|state| {
            let mut rows: Vec<FileCheckpoint> = state
                .checkpoints
                .values()
                .filter(|e| e.flow == flow)
                .map(FileCheckpoint::from)
                .collect();
            rows.sort_by(|a, b| {
                b.last_modified
                    .cmp(&a.last_modified)
                    .then_with(|| b.last_updated.cmp(&a.last_updated))
            });
            rows
        })
    }

    fn delete_old_data(&self, ttl: chrono::Duration) -> Result<usize> {
        let cutoff = Utc::now() - ttl;
        let removed = self.transaction(|state| {
            let before = state.checkpoints.len();
            state.checkpoints.retain(|_, e| e.last_updated >= cutoff);
            let removed = before - state.checkpoints.len();
            (removed, removed > 0)
        })?;
        if removed > 0 {
            info!(removed, ttl_days = ttl.num_days(), "Deleted expired checkpoints");
        }
        Ok(removed)
    }

    fn delete_checkpoints(&self, flow: &str, ids: &[FileId]) -> Result<usize> {
        self.transaction(|state| {
            let removed = ids
                .iter()
                .filter(|id| state.checkpoints.remove(&checkpoint_key(flow, **id)).is_some())
                .count();
            (removed, removed > 0)
        })
    }

    fn dump_checkpoints(&self) -> Result<Vec<FileCheckpoint>> {
        let rows = self.read(|state| {
            state
                .checkpoints
                .values()
                .map(FileCheckpoint::from)
                .collect::<Vec<_>>()
        })?;
        for row in &rows {
            info!(
                flow = %row.flow,
                file_id = %row.file_id,
                path = ?row.path,
                offset = row.offset,
                size = row.size,
                last_updated = %row.last_updated,
                "Checkpoint"
            );
        }
        Ok(rows)
    }
}

fn load(path: &Path) -> Result<CheckpointStateV1> {
    if path.as_os_str().is_empty() || !path.exists() {
        return Ok(CheckpointStateV1::default());
    }
    let file = File::open(path)
        .map_err(|e| Error::Persistence(format!("failed to open checkpoint file: {}", e)))?;
    let state: CheckpointStateV1 = serde_json::from_reader(BufReader::new(file))
        .map_err(|e| Error::Persistence(format!("failed to parse checkpoint file: {}", e)))?;
    if state.version > CHECKPOINT_SCHEMA_VERSION {
        return Err(Error::Persistence(format!(
            "checkpoint file version {} is newer than supported version {}",
            state.version, CHECKPOINT_SCHEMA_VERSION
        )));
    }
    Ok(state)
}

/// Write state to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, state: &CheckpointStateV1) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create parent directory: {}", e))
            })?;
        }
    }

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, state)
        .map_err(|e| Error::Persistence(format!("failed to write checkpoints: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Persistence(format!("failed to flush checkpoints: {}", e)))?;
    drop(writer);

    if let Err(e) = fs::rename(&temp_path, path) {
        if let Err(cleanup) = fs::remove_file(&temp_path) {
            warn!(path = ?temp_path, error = %cleanup, "Failed to remove temp checkpoint file");
        }
        return Err(Error::Persistence(format!(
            "failed to rename checkpoint file: {}",
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailing::source::file_id::InodeResolver;
    use crate::tailing::source::header::FileHeader;
    use crate::tailing::source::tracked_file::FileSnapshot;

    const FLOW: &str = "stream:dest:/logs/*.log";

    fn tracked(dir: &Path, name: &str, content: &[u8]) -> TrackedFile {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        TrackedFile::from_path(&path, 16, &InodeResolver).unwrap()
    }

    fn snapshot(path: PathBuf, ino: u64, mtime: i64) -> Arc<FileSnapshot> {
        Arc::new(FileSnapshot {
            id: FileId::new(1, ino),
            path,
            last_modified: mtime,
            size: 500,
        })
    }

    #[test]
    fn test_save_and_get_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::open_memory();
        let file = tracked(dir.path(), "a.log", b"header line\nmore\n");

        assert_eq!(store.get_offset_for_file_id(FLOW, file.id()).unwrap(), 0);
        store.save_checkpoint(FLOW, &file, 12).unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, file.id()).unwrap(), 12);
        assert_eq!(store.get_offset_for_file_id("other", file.id()).unwrap(), 0);

        // single writes overwrite, even downwards
        store.save_checkpoint(FLOW, &file, 0).unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, file.id()).unwrap(), 0);

        let row = store.get_checkpoint_for_flow(FLOW).unwrap().unwrap();
        let header = row.header.unwrap();
        assert_eq!(header.len(), 16);
        assert!(header.is_starting_same_as(file.header()));
    }

    #[test]
    fn test_batch_upsert_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::open_memory();
        let path = dir.path().join("a.log");
        fs::write(&path, b"x").unwrap();
        let file = snapshot(path, 5, 1000);

        assert_eq!(
            store
                .save_checkpoint_batch_after_send(FLOW, &[(file.clone(), 300)])
                .unwrap(),
            1
        );
        store
            .save_checkpoint_batch_after_send(FLOW, &[(file.clone(), 200)])
            .unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, file.id).unwrap(), 300);

        store
            .save_checkpoint_batch_after_send(FLOW, &[(file.clone(), 400)])
            .unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, file.id).unwrap(), 400);
    }

    #[test]
    fn test_batch_skips_vanished_files() {
        let store = JsonFileCheckpointStore::open_memory();
        let gone = snapshot(PathBuf::from("/definitely/not/here.log"), 9, 0);
        assert_eq!(
            store
                .save_checkpoint_batch_after_send(FLOW, &[(gone.clone(), 10)])
                .unwrap(),
            0
        );
        assert!(store.get_checkpoint_for_flow(FLOW).unwrap().is_none());
    }

    #[test]
    fn test_all_checkpoints_newest_file_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::open_memory();
        let mut batch = Vec::new();
        for (ino, mtime) in [(1, 100), (2, 300), (3, 200)] {
            let path = dir.path().join(format!("{}.log", ino));
            fs::write(&path, b"x").unwrap();
            batch.push((snapshot(path, ino, mtime), ino * 10));
        }
        store.save_checkpoint_batch_after_send(FLOW, &batch).unwrap();

        let rows = store.get_all_checkpoints_for_flow(FLOW).unwrap();
        let inos: Vec<u64> = rows.iter().map(|r| r.file_id.ino()).collect();
        assert_eq!(inos, vec![2, 3, 1]);
        assert!(store.get_all_checkpoints_for_flow("other").unwrap().is_empty());
    }

    #[test]
    fn test_delete_checkpoints_and_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileCheckpointStore::open_memory();
        let a = tracked(dir.path(), "a.log", b"a");
        let b = tracked(dir.path(), "b.log", b"b");
        store.save_checkpoint(FLOW, &a, 1).unwrap();
        store.save_checkpoint(FLOW, &b, 1).unwrap();

        assert_eq!(store.delete_checkpoints(FLOW, &[a.id()]).unwrap(), 1);
        assert_eq!(store.delete_checkpoints(FLOW, &[a.id()]).unwrap(), 0);
        assert_eq!(store.dump_checkpoints().unwrap().len(), 1);

        assert_eq!(store.delete_old_data(chrono::Duration::days(7)).unwrap(), 0);
        assert_eq!(store.delete_old_data(chrono::Duration::seconds(-5)).unwrap(), 1);
        assert!(store.dump_checkpoints().unwrap().is_empty());
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("state/checkpoints.json");
        let file = tracked(dir.path(), "a.log", b"some content\n");

        {
            let store = JsonFileCheckpointStore::open(&db).unwrap();
            store.save_checkpoint(FLOW, &file, 13).unwrap();
        }
        let store = JsonFileCheckpointStore::open(&db).unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, file.id()).unwrap(), 13);

        // no temp files left behind
        let leftovers: Vec<_> = fs::read_dir(db.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_failed_write_reloads_last_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoints.json");
        let file = tracked(dir.path(), "a.log", b"content\n");

        let store = JsonFileCheckpointStore::open(&db).unwrap();
        store.save_checkpoint(FLOW, &file, 5).unwrap();

        // renaming onto a directory fails
        let ro = dir.path().join("ro");
        fs::create_dir(&ro).unwrap();
        let broken = JsonFileCheckpointStore {
            path: ro.clone(),
            state: Mutex::new(Some(CheckpointStateV1::default())),
        };
        assert!(broken.save_checkpoint(FLOW, &file, 9).is_err());
        // the failed write left no in-memory row behind
        assert!(broken.state.lock().unwrap().is_none());

        assert_eq!(store.get_offset_for_file_id(FLOW, file.id()).unwrap(), 5);
    }

    #[test]
    fn test_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("checkpoints.json");
        fs::write(&db, r#"{"version": 99, "checkpoints": {}}"#).unwrap();
        assert!(matches!(
            JsonFileCheckpointStore::open(&db),
            Err(Error::Persistence(_))
        ));
    }

    #[test]
    fn test_digest_only_header_from_row() {
        let row = CheckpointEntryV1 {
            flow: FLOW.to_string(),
            path: "/logs/a.log".to_string(),
            dev: 1,
            ino: 2,
            last_modified: 0,
            size: 3,
            offset: 3,
            header_length: 3,
            header_sha256: Some(crate::tailing::source::header::sha256_hex(b"abc")),
            last_updated: Utc::now(),
        };
        let header = FileCheckpoint::from(&row).header.unwrap();
        assert!(header.is_starting_same_as(&FileHeader::from_bytes(b"abcdef".to_vec())));
        assert!(!header.is_starting_same_as(&FileHeader::from_bytes(b"xyzdef".to_vec())));
    }
}
