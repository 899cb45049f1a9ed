// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of the checkpoint file.
//!
//! One row per `(flow, file id)`, stored under the key `"<flow>|<dev>:<ino>"`.
//! Rows carry the file's path, size, modification time and header
//! fingerprint so identity can be verified again after a restart.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tailing::source::file_id::FileId;
use crate::tailing::source::header::FileHeader;

/// Current schema version for the checkpoint file
pub const CHECKPOINT_SCHEMA_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntryV1 {
    pub flow: String,
    pub path: String,
    pub dev: u64,
    pub ino: u64,
    /// Milliseconds since the Unix epoch
    pub last_modified: i64,
    pub size: u64,
    pub offset: u64,
    #[serde(default)]
    pub header_length: usize,
    /// Unknown for rows first written by an acknowledged send
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_sha256: Option<String>,
    pub last_updated: DateTime<Utc>,
}

impl CheckpointEntryV1 {
    pub fn file_id(&self) -> FileId {
        FileId::new(self.dev, self.ino)
    }

    pub fn key(&self) -> String {
        checkpoint_key(&self.flow, self.file_id())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointStateV1 {
    pub version: u8,
    pub checkpoints: BTreeMap<String, CheckpointEntryV1>,
}

impl Default for CheckpointStateV1 {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_SCHEMA_VERSION,
            checkpoints: BTreeMap::new(),
        }
    }
}

pub fn checkpoint_key(flow: &str, id: FileId) -> String {
    format!("{}|{}", flow, id)
}

/// A checkpoint row as handed to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct FileCheckpoint {
    pub flow: String,
    pub file_id: FileId,
    pub path: PathBuf,
    pub last_modified: i64,
    pub size: u64,
    pub offset: u64,
    pub header: Option<FileHeader>,
    pub last_updated: DateTime<Utc>,
}

impl From<&CheckpointEntryV1> for FileCheckpoint {
    fn from(entry: &CheckpointEntryV1) -> Self {
        Self {
            flow: entry.flow.clone(),
            file_id: entry.file_id(),
            path: PathBuf::from(&entry.path),
            last_modified: entry.last_modified,
            size: entry.size,
            offset: entry.offset,
            header: entry
                .header_sha256
                .as_ref()
                .map(|sha| FileHeader::from_digest(entry.header_length, sha.clone())),
            last_updated: entry.last_updated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip_without_header() {
        let json = r#"{
            "flow": "stream:dest:/var/log/*.log",
            "path": "/var/log/app.log",
            "dev": 2049,
            "ino": 77,
            "last_modified": 1700000000000,
            "size": 120,
            "offset": 100,
            "last_updated": "2024-05-01T10:00:00Z"
        }"#;
        let entry: CheckpointEntryV1 = serde_json::from_str(json).unwrap();
        assert_eq!(entry.key(), "stream:dest:/var/log/*.log|2049:77");
        assert_eq!(entry.header_length, 0);

        let checkpoint = FileCheckpoint::from(&entry);
        assert_eq!(checkpoint.file_id, FileId::new(2049, 77));
        assert!(checkpoint.header.is_none());

        let out = serde_json::to_string(&entry).unwrap();
        assert!(!out.contains("header_sha256"));
    }
}
