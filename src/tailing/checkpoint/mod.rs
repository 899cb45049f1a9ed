// SPDX-License-Identifier: Apache-2.0

//! Persistence of acknowledged read positions.

mod checkpointer;
mod json_file;
mod schema;
mod store;

pub use checkpointer::Checkpointer;
pub use json_file::JsonFileCheckpointStore;
pub use schema::{
    CHECKPOINT_SCHEMA_VERSION, CheckpointEntryV1, CheckpointStateV1, FileCheckpoint,
    checkpoint_key,
};
pub use store::CheckpointStore;
