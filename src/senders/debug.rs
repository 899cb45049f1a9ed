// SPDX-License-Identifier: Apache-2.0

use tracing::{Level, event};

use crate::tailing::buffer::RecordBuffer;
use crate::tailing::record::Payload;
use crate::tailing::sender::{SendError, SendOutcome, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugVerbosity {
    /// One event per buffer
    Basic,
    /// One event per buffer plus one per record
    Detailed,
}

/// Logs buffers instead of delivering them.
pub struct DebugSender {
    name: String,
    verbosity: DebugVerbosity,
}

impl DebugSender {
    pub fn new(name: impl Into<String>, verbosity: DebugVerbosity) -> Self {
        Self {
            name: name.into(),
            verbosity,
        }
    }
}

impl Sender for DebugSender {
    fn send(&self, buffer: &RecordBuffer) -> Result<SendOutcome, SendError> {
        event!(
            Level::INFO,
            destination = %self.name,
            buffer_id = buffer.id(),
            records = buffer.size_records(),
            bytes = buffer.size_bytes(),
            "Received buffer."
        );
        if self.verbosity == DebugVerbosity::Detailed {
            for record in buffer.iter() {
                match record.payload() {
                    Payload::Inline(data) => event!(
                        Level::INFO,
                        path = ?record.file().path,
                        offset = record.start_offset(),
                        partition_key = record.partition_key(),
                        data = %String::from_utf8_lossy(data),
                        "Record."
                    ),
                    Payload::WholeFile => event!(
                        Level::INFO,
                        path = ?record.file().path,
                        size = record.length(),
                        partition_key = record.partition_key(),
                        "Whole file record."
                    ),
                }
            }
        }
        Ok(SendOutcome::Success)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
