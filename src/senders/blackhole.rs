// SPDX-License-Identifier: Apache-2.0

use tracing::trace;

use crate::tailing::buffer::RecordBuffer;
use crate::tailing::sender::{SendError, SendOutcome, Sender};

/// Accepts every buffer without looking at it.
pub struct BlackholeSender {
    name: String,
}

impl BlackholeSender {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Sender for BlackholeSender {
    fn send(&self, buffer: &RecordBuffer) -> Result<SendOutcome, SendError> {
        trace!(buffer_id = buffer.id(), records = buffer.size_records(), "Dropping buffer");
        Ok(SendOutcome::Success)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
