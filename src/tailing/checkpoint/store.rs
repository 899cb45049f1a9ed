// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use crate::tailing::checkpoint::schema::FileCheckpoint;
use crate::tailing::error::Result;
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::tracked_file::{FileSnapshot, TrackedFile};

/// Durable offsets keyed by `(flow, file id)`.
///
/// Every write is all-or-nothing: if it cannot be persisted, the in-memory
/// view is dropped and reloaded from disk on the next call.
pub trait CheckpointStore: Send + Sync {
    /// Set the offset of one file, overwriting any stored value.
    fn save_checkpoint(&self, flow: &str, file: &TrackedFile, offset: u64) -> Result<()>;

    /// Raise the offsets of acknowledged files. A stored offset never moves
    /// backwards. Rows are only created for files that still exist.
    /// Returns the number of rows written.
    fn save_checkpoint_batch_after_send(
        &self,
        flow: &str,
        offsets: &[(Arc<FileSnapshot>, u64)],
    ) -> Result<usize>;

    /// Stored offset for the file, or 0.
    fn get_offset_for_file_id(&self, flow: &str, id: FileId) -> Result<u64>;

    /// The most recently updated row of the flow.
    fn get_checkpoint_for_flow(&self, flow: &str) -> Result<Option<FileCheckpoint>>;

    /// One row per file of the flow, most recently modified file first.
    fn get_all_checkpoints_for_flow(&self, flow: &str) -> Result<Vec<FileCheckpoint>>;

    /// Remove rows not updated within `ttl`. Returns how many were removed.
    fn delete_old_data(&self, ttl: chrono::Duration) -> Result<usize>;

    fn delete_checkpoints(&self, flow: &str, ids: &[FileId]) -> Result<usize>;

    /// Every row of every flow.
    fn dump_checkpoints(&self) -> Result<Vec<FileCheckpoint>>;
}
