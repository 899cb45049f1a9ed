// SPDX-License-Identifier: Apache-2.0

use std::fmt;
use std::sync::Arc;

use crate::tailing::source::header::sha256_hex;
use crate::tailing::source::tracked_file::FileSnapshot;

/// How the partition key of a record is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionKeyOption {
    RandomInt,
    RandomDouble,
    FileName,
    /// Digest of the record payload
    Deterministic,
    Fixed(String),
}

impl PartitionKeyOption {
    pub fn parse(value: &str) -> Self {
        match value {
            "RANDOM_INT" => PartitionKeyOption::RandomInt,
            "RANDOM_DOUBLE" => PartitionKeyOption::RandomDouble,
            "FILE_NAME" => PartitionKeyOption::FileName,
            "DETERMINISTIC" => PartitionKeyOption::Deterministic,
            other => PartitionKeyOption::Fixed(other.to_string()),
        }
    }

    pub fn generate(&self, file: &FileSnapshot, data: &[u8]) -> String {
        match self {
            PartitionKeyOption::RandomInt => (rand::random::<u32>() % 1_000_000).to_string(),
            PartitionKeyOption::RandomDouble => (rand::random::<f64>() * 1_000_000.0).to_string(),
            PartitionKeyOption::FileName => file
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            PartitionKeyOption::Deterministic => sha256_hex(data),
            PartitionKeyOption::Fixed(key) => key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Inline(Vec<u8>),
    /// The record stands for the whole file; senders read it from its path.
    WholeFile,
}

/// A record parsed from a file.
///
/// `total_length` counts every byte consumed from the file, including a
/// stripped trailing delimiter, so `end_offset` is where the next record
/// starts.
#[derive(Clone, PartialEq, Eq)]
pub struct Record {
    file: Arc<FileSnapshot>,
    start_offset: u64,
    total_length: u64,
    payload: Payload,
    ends_with_delimiter: bool,
    partition_key: Option<String>,
}

impl Record {
    pub fn new(
        file: Arc<FileSnapshot>,
        start_offset: u64,
        raw: &[u8],
        delimiter: u8,
        retain_delimiter: bool,
    ) -> Self {
        let ends_with_delimiter = raw.last() == Some(&delimiter);
        let data = if ends_with_delimiter && !retain_delimiter {
            raw[..raw.len() - 1].to_vec()
        } else {
            raw.to_vec()
        };
        Self {
            file,
            start_offset,
            total_length: raw.len() as u64,
            payload: Payload::Inline(data),
            ends_with_delimiter,
            partition_key: None,
        }
    }

    pub fn whole_file(file: Arc<FileSnapshot>) -> Self {
        let total_length = file.size;
        Self {
            file,
            start_offset: 0,
            total_length,
            payload: Payload::WholeFile,
            ends_with_delimiter: false,
            partition_key: None,
        }
    }

    pub fn with_partition_key(mut self, option: Option<&PartitionKeyOption>) -> Self {
        self.partition_key = option.map(|o| o.generate(&self.file, self.data()));
        self
    }

    pub fn file(&self) -> &Arc<FileSnapshot> {
        &self.file
    }

    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }

    pub fn end_offset(&self) -> u64 {
        self.start_offset + self.total_length
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Inline bytes; empty for whole-file records.
    pub fn data(&self) -> &[u8] {
        match &self.payload {
            Payload::Inline(data) => data,
            Payload::WholeFile => &[],
        }
    }

    /// Size of what will be delivered.
    pub fn length(&self) -> u64 {
        match &self.payload {
            Payload::Inline(data) => data.len() as u64,
            Payload::WholeFile => self.file.size,
        }
    }

    pub fn length_with_overhead(&self, per_record_overhead: usize) -> u64 {
        self.length() + per_record_overhead as u64
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    /// Cut an inline payload down to `max_len` bytes. When the payload kept
    /// its delimiter, the tail is replaced with `terminator`.
    /// Returns whether anything was cut.
    pub fn truncate(&mut self, max_len: usize, terminator: &[u8], retain_delimiter: bool) -> bool {
        let ends_with_delimiter = self.ends_with_delimiter;
        let Payload::Inline(data) = &mut self.payload else {
            return false;
        };
        if data.len() <= max_len {
            return false;
        }
        data.truncate(max_len);
        if retain_delimiter && ends_with_delimiter && terminator.len() <= max_len {
            let at = max_len - terminator.len();
            data[at..].copy_from_slice(terminator);
        }
        true
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut preview = String::from_utf8_lossy(self.data()).replace('\n', "\\n");
        if preview.len() > 50 {
            let mut cut = 47;
            while !preview.is_char_boundary(cut) {
                cut -= 1;
            }
            preview.truncate(cut);
            preview.push_str("...");
        }
        f.debug_struct("Record")
            .field("file", &self.file.path)
            .field("start_offset", &self.start_offset)
            .field("end_offset", &self.end_offset())
            .field("length", &self.length())
            .field("data", &preview)
            .finish()
    }
}
