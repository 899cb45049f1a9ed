// SPDX-License-Identifier: Apache-2.0

//! Record boundary detection inside a chunk buffer.

use regex::bytes::Regex;

use crate::tailing::chunk::ChunkBuffer;
use crate::tailing::error::{Error, Result};

/// Locates record boundaries in a readable [`ChunkBuffer`].
pub trait Splitter: Send {
    /// Advance the buffer cursor to the start of the next record and return
    /// that position. Returns `None` when no further boundary is known yet.
    fn locate_next_record(&self, buffer: &mut ChunkBuffer) -> Option<usize>;
}

/// Move the cursor just past the next `delimiter`. On a miss the cursor ends
/// at the buffer limit.
pub fn advance_to_next_line(buffer: &mut ChunkBuffer, delimiter: u8) -> Option<usize> {
    while let Some(b) = buffer.next_byte() {
        if b == delimiter {
            return Some(buffer.position());
        }
    }
    None
}

/// One record per delimiter-terminated line.
pub struct SingleLineSplitter {
    delimiter: u8,
}

impl SingleLineSplitter {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl Splitter for SingleLineSplitter {
    fn locate_next_record(&self, buffer: &mut ChunkBuffer) -> Option<usize> {
        advance_to_next_line(buffer, self.delimiter)
    }
}

/// Multi-line records: a new record starts at every line matching the
/// start pattern. The first line scanned always belongs to the record in
/// progress.
pub struct RegexSplitter {
    start_pattern: Regex,
    delimiter: u8,
}

impl RegexSplitter {
    pub fn new(pattern: &str, delimiter: u8) -> Result<Self> {
        if pattern.is_empty() {
            return Err(Error::Regex("empty record start pattern".to_string()));
        }
        let start_pattern = Regex::new(&format!("^(?:{})", pattern))
            .map_err(|e| Error::Regex(format!("invalid record start pattern: {}", e)))?;
        Ok(Self {
            start_pattern,
            delimiter,
        })
    }

    pub fn pattern(&self) -> &str {
        self.start_pattern.as_str()
    }
}

impl Splitter for RegexSplitter {
    fn locate_next_record(&self, buffer: &mut ChunkBuffer) -> Option<usize> {
        // start of the line currently being scanned
        let mut line_start = buffer.position();
        let mut first_line = true;

        while let Some(b) = buffer.next_byte() {
            if b != self.delimiter {
                continue;
            }
            if !first_line {
                let line = buffer.slice(line_start, buffer.position());
                if self.start_pattern.is_match(line) {
                    buffer.set_position(line_start);
                    return Some(line_start);
                }
            }
            first_line = false;
            line_start = buffer.position();
        }

        // Short read: nothing more is buffered, so the complete lines scanned
        // so far form the last record.
        if !first_line && !buffer.is_full() {
            buffer.set_position(line_start);
            return Some(line_start);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splitter: &dyn Splitter, buffer: &mut ChunkBuffer) -> Vec<usize> {
        let mut found = Vec::new();
        while let Some(pos) = splitter.locate_next_record(buffer) {
            found.push(pos);
        }
        found
    }

    #[test]
    fn test_single_line_boundaries() {
        let splitter = SingleLineSplitter::new(b'\n');
        let mut buf = ChunkBuffer::from_bytes(b"x\ny\nz");
        assert_eq!(collect(&splitter, &mut buf), vec![2, 4]);
        assert_eq!(buf.position(), buf.limit());
    }

    #[test]
    fn test_single_line_custom_delimiter() {
        let splitter = SingleLineSplitter::new(b'|');
        let mut buf = ChunkBuffer::from_bytes(b"a|bb|");
        assert_eq!(collect(&splitter, &mut buf), vec![2, 5]);
    }

    #[test]
    fn test_regex_groups_continuation_lines() {
        let splitter = RegexSplitter::new(r"\d{4}-", b'\n').unwrap();
        let data = b"2024-01 start\n  at foo\n  at bar\n2024-02 next\n";
        let mut buf = ChunkBuffer::with_capacity(data.len() + 16);
        let mut input: &[u8] = data;
        buf.read_from(&mut input).unwrap();
        buf.flip();

        // first boundary is the second timestamped line
        assert_eq!(splitter.locate_next_record(&mut buf), Some(32));
        // the final record ends at the last complete line of a short read
        assert_eq!(splitter.locate_next_record(&mut buf), Some(data.len()));
        assert_eq!(splitter.locate_next_record(&mut buf), None);
    }

    #[test]
    fn test_regex_first_line_is_never_a_boundary() {
        let splitter = RegexSplitter::new("E", b'\n').unwrap();
        let mut buf = ChunkBuffer::from_bytes(b"E1\nE2\n");
        // from_bytes yields a full buffer, so only the matched line counts
        assert_eq!(splitter.locate_next_record(&mut buf), Some(3));
        assert_eq!(splitter.locate_next_record(&mut buf), None);
    }

    #[test]
    fn test_regex_ignores_partial_trailing_line() {
        let splitter = RegexSplitter::new("E", b'\n').unwrap();
        let mut buf = ChunkBuffer::with_capacity(32);
        let mut input: &[u8] = b"E1\n more\nE2 partial";
        buf.read_from(&mut input).unwrap();
        buf.flip();
        assert_eq!(splitter.locate_next_record(&mut buf), Some(9));
        assert_eq!(splitter.locate_next_record(&mut buf), None);
    }

    #[test]
    fn test_regex_rejects_bad_pattern() {
        assert!(RegexSplitter::new("(", b'\n').is_err());
        assert!(RegexSplitter::new("", b'\n').is_err());
    }
}
