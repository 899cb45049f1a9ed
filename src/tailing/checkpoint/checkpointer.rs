// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::tailing::buffer::RecordBuffer;
use crate::tailing::checkpoint::store::CheckpointStore;
use crate::tailing::error::Result;
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::tracked_file::{FileSnapshot, TrackedFile};

/// How long checkpoint writes may keep failing before it is logged as an error
const CHECKPOINT_FAILURE_ALERT: Duration = Duration::from_secs(60);

#[derive(Default)]
struct CommitState {
    /// Lowest buffer id still allowed to commit, per file
    committed: HashMap<FileId, u64>,
    first_failure: Option<Instant>,
}

/// Commits acknowledged offsets for one flow.
///
/// Buffers can finish out of order when several workers send concurrently.
/// A commit from a buffer older than one already committed for the same
/// file is ignored. The same buffer may commit again, as it does after a
/// partially successful attempt. Once a file is reset, only buffers created
/// after the reset commit for it.
pub struct Checkpointer {
    flow: String,
    store: Arc<dyn CheckpointStore>,
    state: Mutex<CommitState>,
}

impl Checkpointer {
    pub fn new(flow: impl Into<String>, store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            flow: flow.into(),
            store,
            state: Mutex::new(CommitState::default()),
        }
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Commit end offsets acknowledged for `buffer_id`. Returns whether
    /// anything was written to the store.
    pub fn commit(&self, buffer_id: u64, offsets: &[(Arc<FileSnapshot>, u64)]) -> bool {
        if offsets.is_empty() {
            return false;
        }
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut accepted = Vec::with_capacity(offsets.len());
        for (file, offset) in offsets {
            match state.committed.get(&file.id) {
                Some(&latest) if latest > buffer_id => {
                    debug!(
                        flow = %self.flow,
                        file_id = %file.id,
                        buffer_id,
                        latest_buffer_id = latest,
                        offset,
                        "Ignoring checkpoint from buffer older than the last committed one"
                    );
                }
                _ => accepted.push((file.clone(), *offset)),
            }
        }
        if accepted.is_empty() {
            return false;
        }

        match self
            .store
            .save_checkpoint_batch_after_send(&self.flow, &accepted)
        {
            Ok(_) => {
                for (file, _) in &accepted {
                    state.committed.insert(file.id, buffer_id);
                }
                if state.first_failure.take().is_some() {
                    debug!(flow = %self.flow, "Checkpoint succeeded after previous failures");
                }
                true
            }
            Err(e) => {
                let first_failure = *state.first_failure.get_or_insert_with(Instant::now);
                let failing_for = first_failure.elapsed();
                if failing_for >= CHECKPOINT_FAILURE_ALERT {
                    error!(
                        flow = %self.flow,
                        buffer_id,
                        error = %e,
                        "Checkpoint writes failing for {:?}", failing_for
                    );
                } else {
                    warn!(
                        flow = %self.flow,
                        buffer_id,
                        error = %e,
                        "Checkpoint failed (failures started {:?} ago)", failing_for
                    );
                }
                false
            }
        }
    }

    /// Set the checkpoint of a truncated file back to 0. Buffers created
    /// before the reset still carry offsets into the old content and are
    /// ignored for this file from now on.
    pub fn reset(&self, file: &TrackedFile) -> Result<()> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        let floor = RecordBuffer::next_id();
        state.committed.insert(file.id(), floor);
        debug!(flow = %self.flow, file_id = %file.id(), floor, "Reset checkpoint of file");
        self.store.save_checkpoint(&self.flow, file, 0)
    }

    /// Lowest buffer id that may still commit for the file.
    pub fn commit_floor(&self, id: FileId) -> Option<u64> {
        match self.state.lock() {
            Ok(state) => state.committed.get(&id).copied(),
            Err(poisoned) => poisoned.into_inner().committed.get(&id).copied(),
        }
    }

    /// Forget commit history of files no longer tracked.
    pub fn forget(&self, ids: &[FileId]) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        for id in ids {
            state.committed.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailing::checkpoint::JsonFileCheckpointStore;
    use crate::tailing::source::file_id::InodeResolver;
    use std::path::PathBuf;

    const FLOW: &str = "stream:dest:/logs/*.log";

    fn file(dir: &std::path::Path, ino: u64) -> Arc<FileSnapshot> {
        let path: PathBuf = dir.join(format!("{}.log", ino));
        std::fs::write(&path, b"data").unwrap();
        Arc::new(FileSnapshot {
            id: FileId::new(1, ino),
            path,
            last_modified: 0,
            size: 1000,
        })
    }

    #[test]
    fn test_older_buffer_cannot_regress() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileCheckpointStore::open_memory());
        let cp = Checkpointer::new(FLOW, store.clone());
        let f = file(dir.path(), 1);

        assert!(cp.commit(5, &[(f.clone(), 500)]));
        assert!(!cp.commit(3, &[(f.clone(), 300)]));
        assert_eq!(store.get_offset_for_file_id(FLOW, f.id).unwrap(), 500);
        assert_eq!(cp.commit_floor(f.id), Some(5));

        // same buffer again after a partial success
        assert!(cp.commit(5, &[(f.clone(), 550)]));
        assert_eq!(store.get_offset_for_file_id(FLOW, f.id).unwrap(), 550);
    }

    #[test]
    fn test_ids_are_tracked_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileCheckpointStore::open_memory());
        let cp = Checkpointer::new(FLOW, store.clone());
        let a = file(dir.path(), 1);
        let b = file(dir.path(), 2);

        assert!(cp.commit(9, &[(a.clone(), 90)]));
        // buffer 4 only carried records of b, so it still commits
        assert!(cp.commit(4, &[(a.clone(), 40), (b.clone(), 40)]));
        assert_eq!(store.get_offset_for_file_id(FLOW, a.id).unwrap(), 90);
        assert_eq!(store.get_offset_for_file_id(FLOW, b.id).unwrap(), 40);

        cp.forget(&[a.id]);
        assert_eq!(cp.commit_floor(a.id), None);
    }

    #[test]
    fn test_reset_ignores_buffers_from_before_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileCheckpointStore::open_memory());
        let cp = Checkpointer::new(FLOW, store.clone());
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"hello world\n").unwrap();
        let tracked = TrackedFile::from_path(&path, 64, &InodeResolver).unwrap();
        let snapshot = tracked.snapshot().clone();

        let late = RecordBuffer::new(0, 0);
        std::fs::write(&path, b"bye\n").unwrap();
        cp.reset(&tracked).unwrap();
        assert_eq!(store.get_offset_for_file_id(FLOW, tracked.id()).unwrap(), 0);

        // acknowledgement of the old content arrives after the reset
        assert!(!cp.commit(late.id(), &[(snapshot.clone(), 12)]));
        assert_eq!(store.get_offset_for_file_id(FLOW, tracked.id()).unwrap(), 0);

        let fresh = RecordBuffer::new(0, 0);
        assert!(cp.commit(fresh.id(), &[(snapshot, 4)]));
        assert_eq!(store.get_offset_for_file_id(FLOW, tracked.id()).unwrap(), 4);
    }

    #[test]
    fn test_empty_commit_is_noop() {
        let store = Arc::new(JsonFileCheckpointStore::open_memory());
        let cp = Checkpointer::new(FLOW, store);
        assert!(!cp.commit(1, &[]));
    }
}
