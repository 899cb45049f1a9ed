// SPDX-License-Identifier: Apache-2.0

//! Local file destination, mostly useful for testing flows end to end.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

use crate::tailing::buffer::RecordBuffer;
use crate::tailing::record::{Payload, Record};
use crate::tailing::sender::{SendError, SendOutcome, Sender};

#[derive(Serialize)]
struct JsonRecord<'a> {
    path: &'a Path,
    offset: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition_key: Option<&'a str>,
    data: String,
}

impl<'a> From<&'a Record> for JsonRecord<'a> {
    fn from(record: &'a Record) -> Self {
        Self {
            path: &record.file().path,
            offset: record.start_offset(),
            partition_key: record.partition_key(),
            data: String::from_utf8_lossy(record.data()).into_owned(),
        }
    }
}

/// Appends inline records to `path` as JSON lines and copies whole-file
/// records into the directory `path`.
pub struct FileSender {
    name: String,
    path: PathBuf,
    // serializes appends from concurrent workers
    lock: Mutex<()>,
}

impl FileSender {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn append_lines(&self, records: &[&Record]) -> Result<(), SendError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut out = BufWriter::new(file);
        for record in records {
            serde_json::to_writer(&mut out, &JsonRecord::from(*record))
                .map_err(|e| SendError::Other(e.into()))?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn copy_file(&self, record: &Record) -> Result<(), SendError> {
        let source = &record.file().path;
        let name = source.file_name().ok_or_else(|| {
            SendError::MalformedRequest(format!("{} has no file name", source.display()))
        })?;
        fs::create_dir_all(&self.path)?;
        let target = self.path.join(name);
        let mut input = File::open(source)?;
        let mut output = File::create(&target)?;
        let copied = std::io::copy(&mut input, &mut output)?;
        output.sync_all()?;
        debug!(source = ?source, target = ?target, bytes = copied, "Copied file");
        Ok(())
    }
}

impl Sender for FileSender {
    fn send(&self, buffer: &RecordBuffer) -> Result<SendOutcome, SendError> {
        let _guard = match self.lock.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut inline = Vec::new();
        for record in buffer.iter() {
            match record.payload() {
                Payload::Inline(_) => inline.push(record),
                Payload::WholeFile => self.copy_file(record)?,
            }
        }
        if !inline.is_empty() {
            self.append_lines(&inline)?;
        }
        Ok(SendOutcome::Success)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
