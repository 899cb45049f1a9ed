// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity byte buffer with a read/write cursor.
//!
//! While being filled, `position` is the write cursor and `limit` equals the
//! capacity. After [`ChunkBuffer::flip`], `position` is the read cursor and
//! `limit` marks the end of valid data.

use std::io::{self, Read};

#[derive(Debug)]
pub struct ChunkBuffer {
    data: Vec<u8>,
    position: usize,
    limit: usize,
}

impl ChunkBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            position: 0,
            limit: capacity,
        }
    }

    /// Readable buffer over `bytes`; capacity equals the content length.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: bytes.to_vec(),
            position: 0,
            limit: bytes.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        debug_assert!(position <= self.limit);
        self.position = position.min(self.limit);
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.data.len());
        if self.position > self.limit {
            self.position = self.limit;
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    pub fn is_full(&self) -> bool {
        self.limit == self.data.len()
    }

    /// Relative get: returns the byte at the cursor and advances.
    pub fn next_byte(&mut self) -> Option<u8> {
        if self.position < self.limit {
            let b = self.data[self.position];
            self.position += 1;
            Some(b)
        } else {
            None
        }
    }

    pub fn slice(&self, start: usize, end: usize) -> &[u8] {
        &self.data[start..end]
    }

    pub fn flip(&mut self) {
        self.limit = self.position;
        self.position = 0;
    }

    /// Move unread bytes to the front and switch back to writing.
    pub fn compact(&mut self) {
        let remaining = self.remaining();
        self.data.copy_within(self.position..self.limit, 0);
        self.position = remaining;
        self.limit = self.data.len();
    }

    /// Append the unread bytes of `other` at the write cursor.
    pub fn put(&mut self, other: &ChunkBuffer) {
        let src = &other.data[other.position..other.limit];
        let end = self.position + src.len();
        self.data[self.position..end].copy_from_slice(src);
        self.position = end;
    }

    /// Fill `[position, limit)` from `reader` with a single read call.
    /// Returns 0 at end of input or when there is no room left.
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        if self.position >= self.limit {
            return Ok(0);
        }
        let n = loop {
            match reader.read(&mut self.data[self.position..self.limit]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        };
        self.position += n;
        Ok(n)
    }
}
