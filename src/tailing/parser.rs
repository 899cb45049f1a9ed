// SPDX-License-Identifier: Apache-2.0

//! Turns the bytes of a tracked file into records.
//!
//! The chunked parser reads fixed-size chunks from the file handle it is
//! lent, asks the splitter for record boundaries, and carries only the
//! undelimited tail of a chunk into the next one. A record larger than the
//! chunk is emitted once at chunk size and the rest of it is discarded until
//! the next boundary.

use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

use crate::tailing::chunk::ChunkBuffer;
use crate::tailing::config::{FlowConfig, InitialPosition};
use crate::tailing::error::Result;
use crate::tailing::record::{PartitionKeyOption, Record};
use crate::tailing::source::file_id::FileId;
use crate::tailing::source::tracked_file::{FileSnapshot, TrackedFile};
use crate::tailing::splitter::{RegexSplitter, SingleLineSplitter, Splitter, advance_to_next_line};

#[derive(Debug, Default)]
pub struct ParserMetrics {
    pub bytes_consumed: AtomicU64,
    pub bytes_discarded: AtomicU64,
    pub records_parsed: AtomicU64,
    pub records_larger_than_buffer: AtomicU64,
    pub records_skipped: AtomicU64,
    pub unhandled_errors: AtomicU64,
    pub files_parsed: AtomicU64,
}

/// Parser operations driven by the tailer.
///
/// The tracker owns every [`TrackedFile`] and lends the current one to each
/// call; the parser only remembers which file it is attached to.
pub trait RecordParser: Send {
    fn is_parsing(&self) -> bool;

    /// Attach to a file and move to the configured initial position.
    fn start_parsing(&mut self, file: &mut TrackedFile) -> bool;

    /// Attach to a newer snapshot of the file being parsed, keeping any
    /// buffered bytes when the handle position is unchanged.
    fn continue_parsing(&mut self, file: &mut TrackedFile) -> bool;

    /// Drop all parsing state and attach to `file`, if any.
    fn switch_parsing(&mut self, file: Option<&mut TrackedFile>) -> bool;

    fn stop_parsing(&mut self, reason: &str) -> bool;

    fn is_at_end_of_current_file(&mut self, file: &mut TrackedFile) -> bool;

    /// Next complete record, or `None` when none is available yet.
    fn read_record(&mut self, file: &mut TrackedFile) -> Option<Record>;

    fn buffered_bytes_remaining(&self) -> usize;

    /// File offset of the next record, when the parser buffers bytes.
    fn next_record_offset(&self) -> Option<u64> {
        None
    }

    fn metrics(&self) -> &Arc<ParserMetrics>;
}

/// Parsing knobs taken from the flow.
#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub buffer_size: usize,
    pub delimiter: u8,
    pub skip_header_lines: usize,
    pub initial_position: InitialPosition,
    pub appendable: bool,
    pub miss_last_record_delimiter: bool,
    pub max_file_checking: Duration,
    pub retain_delimiter: bool,
    pub ignore_empty_data: bool,
    pub partition_key: Option<PartitionKeyOption>,
}

impl ParserOptions {
    pub fn from_flow(flow: &FlowConfig) -> Self {
        Self {
            buffer_size: flow.limits().parser_buffer_size_bytes,
            delimiter: flow.delimiter_byte(),
            skip_header_lines: flow.skip_header_lines,
            initial_position: flow.initial_position,
            appendable: flow.file_appendable(),
            miss_last_record_delimiter: flow.miss_last_record_delimiter,
            max_file_checking: flow.max_file_checking(),
            retain_delimiter: flow.retain_record_delimiter,
            ignore_empty_data: flow.ignore_empty_data,
            partition_key: flow.partition_key.as_deref().map(PartitionKeyOption::parse),
        }
    }
}

/// Splitter selected by the flow: multi-line when a start pattern is set.
pub fn build_splitter(flow: &FlowConfig) -> Result<Box<dyn Splitter>> {
    Ok(match &flow.multi_line_start_pattern {
        Some(pattern) => Box::new(RegexSplitter::new(pattern, flow.delimiter_byte())?),
        None => Box::new(SingleLineSplitter::new(flow.delimiter_byte())),
    })
}

pub struct ChunkParser {
    name: String,
    splitter: Box<dyn Splitter>,
    options: ParserOptions,

    current: Option<(FileId, PathBuf)>,
    channel_offset: Option<u64>,
    header_lines_to_skip: usize,

    buffer: Option<ChunkBuffer>,
    buffer_start_offset: Option<u64>,
    buffer_file: Option<Arc<FileSnapshot>>,
    buffer_exhausted: bool,
    buffer_file_ended: bool,
    records_from_buffer: usize,
    saved_read_position: Option<usize>,

    awaiting_delimiter: bool,
    last_record_unterminated: bool,

    metrics: Arc<ParserMetrics>,
}

impl ChunkParser {
    pub fn new(name: impl Into<String>, splitter: Box<dyn Splitter>, options: ParserOptions) -> Self {
        Self {
            name: name.into(),
            splitter,
            options,
            current: None,
            channel_offset: None,
            header_lines_to_skip: 0,
            buffer: None,
            buffer_start_offset: None,
            buffer_file: None,
            buffer_exhausted: false,
            buffer_file_ended: false,
            records_from_buffer: 0,
            saved_read_position: None,
            awaiting_delimiter: false,
            last_record_unterminated: false,
            metrics: Arc::new(ParserMetrics::default()),
        }
    }

    fn unhandled(&mut self, what: &str, e: io::Error) {
        error!(parser = %self.name, file = ?self.current, error = %e, "{}", what);
        self.stop_parsing("Unhandled error.");
        self.metrics.unhandled_errors.fetch_add(1, Ordering::Relaxed);
    }

    fn set_current_file(&mut self, file: Option<&mut TrackedFile>, reset: bool) -> bool {
        if reset || file.is_none() {
            self.stop_parsing("Parsing is reset by caller.");
        }
        let Some(file) = file else {
            return false;
        };
        if !file.is_open() {
            error!(parser = %self.name, file = %file, "Cannot parse a file that is not open");
            return false;
        }
        let new_offset = match file.current_offset() {
            Ok(offset) => offset,
            Err(e) => {
                self.unhandled("Failed reading the position of the file to parse", e);
                return false;
            }
        };

        if self.current.is_none() || reset {
            debug!(parser = %self.name, path = ?file.path(), "Opening file for parsing");
            self.buffer_file_ended = true;
        } else {
            self.buffer_file_ended =
                self.buffer_file_ended || self.channel_offset != Some(new_offset);
            let same = self
                .current
                .as_ref()
                .is_some_and(|(id, path)| *id == file.id() && path == file.path());
            if !same {
                info!(parser = %self.name, path = ?file.path(), "Continuing to parse");
            }
            debug!(
                parser = %self.name,
                old_offset = ?self.channel_offset,
                new_offset,
                "Continuing with newer snapshot"
            );
        }

        self.current = Some((file.id(), file.path().to_path_buf()));
        self.channel_offset = Some(new_offset);
        self.header_lines_to_skip = if new_offset == 0 {
            self.options.skip_header_lines
        } else {
            0
        };
        true
    }

    fn go_to_initial_position(&mut self, file: &mut TrackedFile) -> io::Result<()> {
        if self.options.initial_position != InitialPosition::EndOfFile {
            return Ok(());
        }
        trace!(parser = %self.name, file = %file, "Moving to last record of file");
        if !self.ensure_header_lines_skipped(file)? {
            return Ok(());
        }

        // never scan back into skipped header lines
        let header_end = self
            .buffer
            .as_ref()
            .map_or(0, |buf| self.to_channel_offset(buf.position()));
        let last_chunk = file
            .size()
            .saturating_sub(self.options.buffer_size as u64)
            .max(header_end);
        self.reset_current_buffer();
        channel(file)?.seek(SeekFrom::Start(last_chunk))?;
        self.channel_offset = Some(last_chunk);

        if self.read_next_chunk(file)? > 0 {
            let Some(buf) = self.buffer.as_mut() else {
                return Ok(());
            };
            let mut previous = 0;
            while let Some(next) = self.splitter.locate_next_record(buf) {
                previous = next;
            }
            buf.set_position(previous);
            trace!(
                parser = %self.name,
                offset = self.buffer_start_offset.unwrap_or_default() + previous as u64,
                "Advanced to last record boundary"
            );
        }
        Ok(())
    }

    fn try_read_record(&mut self, file: &mut TrackedFile) -> io::Result<Option<Record>> {
        if self.buffer.is_none() || self.buffer_exhausted {
            self.try_read_more(file)?;
        }
        if let Some(record) = self.read_from_current_buffer(file)? {
            return Ok(Some(record));
        }
        self.buffer_exhausted = true;
        self.try_read_more(file)?;
        self.read_from_current_buffer(file)
    }

    fn read_from_current_buffer(&mut self, file: &mut TrackedFile) -> io::Result<Option<Record>> {
        let delimiter = self.options.delimiter;
        let Some(buf) = self.buffer.as_mut() else {
            return Ok(None);
        };

        let mut record_start = buf.position();
        let mut next = self.splitter.locate_next_record(buf);

        // A delimiter arriving after its record was already emitted.
        if self.last_record_unterminated
            && next == Some(record_start + 1)
            && buf.slice(record_start, record_start + 1) == [delimiter]
        {
            self.last_record_unterminated = false;
            record_start += 1;
            next = self.splitter.locate_next_record(buf);
        }

        if let Some(next) = next {
            return Ok(Some(self.build_record(file, record_start, next - record_start)));
        }

        if record_start == 0 && buf.is_full() {
            let limit = buf.limit();
            warn!(
                parser = %self.name,
                buffer_size = self.options.buffer_size,
                file = ?self.buffer_file.as_ref().map(|f| &f.path),
                offset = self.buffer_start_offset.unwrap_or_default(),
                "Detected record larger than buffer size, discarding data until next record"
            );
            self.metrics
                .records_larger_than_buffer
                .fetch_add(1, Ordering::Relaxed);
            buf.set_position(limit);
            let record = self.build_record(file, 0, limit);

            while self.read_next_chunk(file)? > 0 {
                let Some(buf) = self.buffer.as_mut() else {
                    break;
                };
                match self.splitter.locate_next_record(buf) {
                    Some(next) if next > 0 => {
                        self.on_discarded_data(0, next - 1, "Runaway record.");
                        break;
                    }
                    _ => {
                        let limit = buf.limit();
                        buf.set_position(limit);
                        self.on_discarded_data(0, limit, "Runaway record.");
                    }
                }
            }
            return Ok(Some(record));
        }

        let limit = buf.limit();
        if self.buffer_exhausted && limit > record_start {
            if !self.options.appendable {
                return Ok(Some(self.build_record(file, record_start, limit - record_start)));
            }
            if self.options.miss_last_record_delimiter {
                match file.miss_delimiter_since() {
                    Some(since) if since.elapsed() >= self.options.max_file_checking => {
                        debug!(
                            parser = %self.name,
                            path = ?file.path(),
                            waited = ?since.elapsed(),
                            "Emitting final record without delimiter"
                        );
                        let record = self.build_record(file, record_start, limit - record_start);
                        self.last_record_unterminated = true;
                        return Ok(Some(record));
                    }
                    Some(_) => {}
                    None => {
                        file.set_miss_delimiter_since(Some(Instant::now()));
                        self.awaiting_delimiter = true;
                    }
                }
            }
        }

        if let Some(buf) = self.buffer.as_mut() {
            buf.set_position(record_start);
        }
        self.buffer_exhausted = true;
        Ok(None)
    }

    fn read_next_chunk(&mut self, file: &mut TrackedFile) -> io::Result<usize> {
        self.prepare_buffer_for_writing();

        let channel = channel(file)?;
        let start = channel.stream_position()?;
        if let Some(expected) = self.channel_offset {
            if expected != start {
                return Err(io::Error::other(format!(
                    "channel expected to be at offset {} but was at offset {}",
                    expected, start
                )));
            }
        }
        if self.buffer_start_offset.is_none() {
            self.buffer_start_offset = Some(start);
        }

        let Some(buf) = self.buffer.as_mut() else {
            return Ok(0);
        };
        let bytes = buf.read_from(channel)?;
        let position = start + bytes as u64;
        self.channel_offset = Some(position);
        self.buffer_file = Some(file.snapshot().clone());
        self.prepare_buffer_for_reading();

        if bytes > 0 {
            self.buffer_exhausted = false;
            self.metrics
                .bytes_consumed
                .fetch_add(bytes as u64, Ordering::Relaxed);
            trace!(
                parser = %self.name,
                from = self.buffer_start_offset,
                to = position,
                path = ?file.path(),
                "Consumed bytes"
            );
        }
        Ok(bytes)
    }

    fn try_read_more(&mut self, file: &mut TrackedFile) -> io::Result<()> {
        if self.current.is_some() {
            self.ensure_header_lines_skipped(file)?;
            self.read_next_chunk(file)?;
        }
        Ok(())
    }

    /// False while header lines remain to be skipped.
    fn ensure_header_lines_skipped(&mut self, file: &mut TrackedFile) -> io::Result<bool> {
        if self.header_lines_to_skip > 0 && self.skip_header_lines(file)? > 0 {
            return Ok(false);
        }
        Ok(true)
    }

    fn skip_header_lines(&mut self, file: &mut TrackedFile) -> io::Result<usize> {
        let mut skipped = 0;
        trace!(parser = %self.name, lines = self.header_lines_to_skip, "Skipping header lines");
        while self.header_lines_to_skip > 0 {
            let bytes = self.read_next_chunk(file)?;
            if let Some(buf) = self.buffer.as_mut() {
                while self.header_lines_to_skip > 0
                    && advance_to_next_line(buf, self.options.delimiter).is_some()
                {
                    skipped += 1;
                    self.header_lines_to_skip -= 1;
                }
            }
            if bytes == 0 {
                break;
            }
        }
        if self.header_lines_to_skip > 0 {
            trace!(
                parser = %self.name,
                skipped,
                remaining = self.header_lines_to_skip,
                "Read through the entire file while skipping header lines"
            );
        }
        debug!(parser = %self.name, skipped, path = ?file.path(), "Skipped header lines");
        Ok(self.header_lines_to_skip)
    }

    fn prepare_buffer_for_writing(&mut self) {
        self.saved_read_position = None;
        let Some(buf) = self.buffer.as_mut() else {
            self.new_buffer();
            return;
        };

        if self.buffer_file_ended {
            self.discard_current_buffer("New file was opened.");
            self.new_buffer();
        } else if buf.is_full() {
            if self.records_from_buffer > 0 {
                if buf.has_remaining() {
                    let old = self.buffer.take();
                    let old_file = self.buffer_file.take();
                    let old_start = self.buffer_start_offset;
                    self.new_buffer();
                    if let (Some(old), Some(new)) = (old, self.buffer.as_mut()) {
                        self.buffer_start_offset =
                            old_start.map(|start| start + old.position() as u64);
                        new.put(&old);
                        trace!(parser = %self.name, bytes = new.position(), "Copied tail to new buffer");
                    }
                    self.buffer_file = old_file;
                } else {
                    self.new_buffer();
                }
            } else {
                trace!(
                    parser = %self.name,
                    capacity = buf.capacity(),
                    remaining = buf.remaining(),
                    "Reusing current buffer"
                );
                self.buffer_start_offset = self
                    .buffer_start_offset
                    .map(|start| start + buf.position() as u64);
                buf.compact();
            }
        } else {
            self.saved_read_position = Some(buf.position());
            let limit = buf.limit();
            buf.set_position(limit);
            buf.set_limit(buf.capacity());
        }
    }

    fn prepare_buffer_for_reading(&mut self) {
        if let Some(buf) = self.buffer.as_mut() {
            buf.flip();
            if let Some(saved) = self.saved_read_position.take() {
                buf.set_position(saved);
            }
        }
    }

    fn new_buffer(&mut self) {
        if self.buffer.is_some() {
            trace!(
                parser = %self.name,
                records = self.records_from_buffer,
                size = self.options.buffer_size,
                "Allocating new buffer"
            );
        }
        self.records_from_buffer = 0;
        self.buffer = Some(ChunkBuffer::with_capacity(self.options.buffer_size));
        self.buffer_start_offset = None;
        self.buffer_file = None;
        self.buffer_file_ended = false;
        self.buffer_exhausted = true;
    }

    fn discard_current_buffer(&mut self, reason: &str) {
        if let Some(buf) = &self.buffer {
            let (position, remaining) = (buf.position(), buf.remaining());
            if remaining > 0 && !self.awaiting_delimiter {
                self.on_discarded_data(position, remaining, reason);
            }
            self.reset_current_buffer();
        }
    }

    fn reset_current_buffer(&mut self) {
        self.buffer = None;
        self.buffer_start_offset = None;
        self.buffer_file = None;
        self.buffer_exhausted = false;
        self.records_from_buffer = 0;
        self.buffer_file_ended = false;
        self.awaiting_delimiter = false;
        self.last_record_unterminated = false;
    }

    fn build_record(&mut self, file: &mut TrackedFile, offset: usize, length: usize) -> Record {
        self.records_from_buffer += 1;
        self.awaiting_delimiter = false;
        self.last_record_unterminated = false;
        let start = self.to_channel_offset(offset);
        // bytes carried over from an older snapshot of the same file take
        // the newest path and size
        let snapshot = match &self.buffer_file {
            Some(f) if f.id != file.id() => f.clone(),
            _ => file.snapshot().clone(),
        };

        if snapshot.id == file.id() {
            file.set_miss_delimiter_since(None);
            file.set_last_offset(start + length as u64);
        }
        self.metrics.records_parsed.fetch_add(1, Ordering::Relaxed);

        let raw = match &self.buffer {
            Some(buf) => buf.slice(offset, offset + length),
            None => &[],
        };
        Record::new(
            snapshot,
            start,
            raw,
            self.options.delimiter,
            self.options.retain_delimiter,
        )
        .with_partition_key(self.options.partition_key.as_ref())
    }

    fn to_channel_offset(&self, buffer_offset: usize) -> u64 {
        self.buffer_start_offset.unwrap_or_default() + buffer_offset as u64
    }

    fn on_discarded_data(&self, buffer_offset: usize, length: usize, reason: &str) {
        self.metrics
            .bytes_discarded
            .fetch_add(length as u64, Ordering::Relaxed);
        warn!(
            parser = %self.name,
            bytes = length,
            file = ?self.buffer_file.as_ref().map(|f| &f.path),
            offset = self.to_channel_offset(buffer_offset),
            reason,
            "Discarded bytes"
        );
    }
}

fn channel(file: &mut TrackedFile) -> io::Result<&mut std::fs::File> {
    let path = file.path().to_path_buf();
    file.channel_mut()
        .ok_or_else(|| io::Error::other(format!("{} is not open", path.display())))
}

impl RecordParser for ChunkParser {
    fn is_parsing(&self) -> bool {
        self.current.is_some()
    }

    fn start_parsing(&mut self, file: &mut TrackedFile) -> bool {
        if !self.set_current_file(Some(&mut *file), true) {
            return false;
        }
        match self.go_to_initial_position(file) {
            Ok(()) => true,
            Err(e) => {
                self.unhandled("Failed setting the initial position", e);
                false
            }
        }
    }

    fn continue_parsing(&mut self, file: &mut TrackedFile) -> bool {
        self.set_current_file(Some(file), false)
    }

    fn switch_parsing(&mut self, file: Option<&mut TrackedFile>) -> bool {
        self.set_current_file(file, true)
    }

    fn stop_parsing(&mut self, reason: &str) -> bool {
        if self.buffer.is_none() && self.current.is_none() {
            return false;
        }
        self.discard_current_buffer(reason);
        self.current = None;
        self.channel_offset = None;
        self.header_lines_to_skip = 0;
        true
    }

    fn is_at_end_of_current_file(&mut self, file: &mut TrackedFile) -> bool {
        if self.current.is_none() {
            return false;
        }
        match channel(file).and_then(|c| c.metadata()) {
            Ok(metadata) => self.channel_offset.unwrap_or_default() >= metadata.len(),
            Err(e) => {
                self.unhandled("Failed getting the size of the current file", e);
                false
            }
        }
    }

    fn read_record(&mut self, file: &mut TrackedFile) -> Option<Record> {
        if self.current.is_none() {
            return None;
        }
        loop {
            match self.try_read_record(file) {
                Ok(Some(record)) if self.options.ignore_empty_data && record.length() == 0 => {
                    self.metrics.records_skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                Ok(record) => return record,
                Err(e) => {
                    self.unhandled("Failed parsing record from current file", e);
                    return None;
                }
            }
        }
    }

    fn buffered_bytes_remaining(&self) -> usize {
        self.buffer.as_ref().map(|b| b.remaining()).unwrap_or(0)
    }

    fn next_record_offset(&self) -> Option<u64> {
        match &self.buffer {
            Some(buf) => Some(self.to_channel_offset(buf.position())),
            None => self.channel_offset,
        }
    }

    fn metrics(&self) -> &Arc<ParserMetrics> {
        &self.metrics
    }
}

/// Hands out each file as a single record.
pub struct WholeFileParser {
    current: Option<FileId>,
    delivered: bool,
    partition_key: Option<PartitionKeyOption>,
    metrics: Arc<ParserMetrics>,
}

impl WholeFileParser {
    pub fn new(partition_key: Option<PartitionKeyOption>) -> Self {
        Self {
            current: None,
            delivered: false,
            partition_key,
            metrics: Arc::new(ParserMetrics::default()),
        }
    }
}

impl RecordParser for WholeFileParser {
    fn is_parsing(&self) -> bool {
        self.current.is_some()
    }

    fn start_parsing(&mut self, file: &mut TrackedFile) -> bool {
        self.current = Some(file.id());
        self.delivered = false;
        true
    }

    fn continue_parsing(&mut self, file: &mut TrackedFile) -> bool {
        if file.is_open() {
            file.close();
        }
        true
    }

    fn switch_parsing(&mut self, _file: Option<&mut TrackedFile>) -> bool {
        true
    }

    fn stop_parsing(&mut self, _reason: &str) -> bool {
        self.current = None;
        true
    }

    fn is_at_end_of_current_file(&mut self, _file: &mut TrackedFile) -> bool {
        self.current.is_none() || self.delivered
    }

    fn read_record(&mut self, file: &mut TrackedFile) -> Option<Record> {
        if self.current != Some(file.id()) || self.delivered {
            return None;
        }
        self.delivered = true;
        self.metrics.files_parsed.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .bytes_consumed
            .fetch_add(file.size(), Ordering::Relaxed);
        self.metrics.records_parsed.fetch_add(1, Ordering::Relaxed);
        Some(Record::whole_file(file.snapshot().clone()).with_partition_key(self.partition_key.as_ref()))
    }

    fn buffered_bytes_remaining(&self) -> usize {
        0
    }

    fn metrics(&self) -> &Arc<ParserMetrics> {
        &self.metrics
    }
}
