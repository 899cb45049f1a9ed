// SPDX-License-Identifier: Apache-2.0

//! Drives one flow: refreshes the tracker, feeds files through the parser
//! and offers the records to the publishing queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::tailing::backoff::sleep_unless_cancelled;
use crate::tailing::config::FlowConfig;
use crate::tailing::error::Result;
use crate::tailing::parser::RecordParser;
use crate::tailing::publisher::PublisherMetrics;
use crate::tailing::queue::PublishingQueue;
use crate::tailing::record::Record;
use crate::tailing::tracker::{SourceFileTracker, TrackingMode};

#[derive(Debug, Default)]
pub struct TailerMetrics {
    pub records_published: AtomicU64,
    pub records_truncated: AtomicU64,
    pub files_behind: AtomicU64,
    pub bytes_behind: AtomicU64,
}

/// Records longer than the destination accepts are cut down.
struct RecordSizeLimit {
    max_len: usize,
    terminator: Vec<u8>,
    retain_delimiter: bool,
}

impl RecordSizeLimit {
    fn enforce(&self, record: &mut Record, tailer: &str, metrics: &TailerMetrics) {
        let length = record.length();
        if record.truncate(self.max_len, &self.terminator, self.retain_delimiter) {
            metrics.records_truncated.fetch_add(1, Ordering::Relaxed);
            warn!(
                tailer = %tailer,
                path = ?record.file().path,
                offset = record.start_offset(),
                length,
                max_record_size = self.max_len,
                "Truncated record larger than the maximum record size"
            );
        }
    }
}

pub struct FileTailer {
    name: String,
    tracker: SourceFileTracker,
    parser: Box<dyn RecordParser>,
    queue: Arc<PublishingQueue>,
    publisher_metrics: Arc<PublisherMetrics>,
    cancel: CancellationToken,
    /// Record the queue refused, offered again before reading further
    pending_record: Option<Record>,
    limit: RecordSizeLimit,
    min_poll: Duration,
    refresh_interval: Duration,
    status_interval: Duration,
    bytes_behind_info: u64,
    bytes_behind_warn: u64,
    last_status: Instant,
    initialized: bool,
    metrics: Arc<TailerMetrics>,
}

impl FileTailer {
    pub fn new(
        flow: &FlowConfig,
        tracker: SourceFileTracker,
        parser: Box<dyn RecordParser>,
        queue: Arc<PublishingQueue>,
        publisher_metrics: Arc<PublisherMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        let limits = flow.limits();
        let parser_buffer = limits.parser_buffer_size_bytes as u64;
        Self {
            name: flow.flow_id(),
            tracker,
            parser,
            queue,
            publisher_metrics,
            cancel,
            pending_record: None,
            limit: RecordSizeLimit {
                max_len: limits.max_record_size_bytes,
                terminator: flow.truncated_record_terminator.as_bytes().to_vec(),
                retain_delimiter: flow.retain_record_delimiter,
            },
            min_poll: flow.min_time_between_file_polls(),
            refresh_interval: flow.tracker_refresh_interval(),
            status_interval: flow.status_interval(),
            bytes_behind_info: 5 * parser_buffer,
            bytes_behind_warn: 10 * parser_buffer,
            last_status: Instant::now(),
            initialized: false,
            metrics: Arc::new(TailerMetrics::default()),
        }
    }

    pub fn metrics(&self) -> &Arc<TailerMetrics> {
        &self.metrics
    }

    pub fn tracker(&self) -> &SourceFileTracker {
        &self.tracker
    }

    /// Resume from checkpoints, or from the files on disk when the flow has
    /// none.
    pub fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        let resumed = self.tracker.init_from_history()?;
        if !resumed {
            self.tracker.init_from_current_files()?;
        }
        if let Some(current) = self.tracker.current_mut() {
            if resumed {
                self.parser.continue_parsing(current);
            } else if self.parser.start_parsing(current) {
                if let Some(offset) = self.parser.next_record_offset() {
                    self.tracker.checkpoint_current_at(offset);
                }
            }
        }
        self.initialized = true;
        Ok(())
    }

    /// Thread body. Returns once the cancellation token fires.
    pub fn run(mut self) {
        if let Err(e) = self.initialize() {
            error!(tailer = %self.name, error = %e, "Failed to initialize tailer");
            return;
        }
        info!(tailer = %self.name, "Tailer started");

        while !self.cancel.is_cancelled() {
            let processed = self.run_once();
            if self.last_status.elapsed() >= self.status_interval {
                self.emit_status();
            }
            // only idle when the last pass found nothing to do
            if processed == 0 && !sleep_unless_cancelled(&self.cancel, self.min_poll) {
                break;
            }
        }

        self.emit_status();
        self.parser.stop_parsing("Tailer stopped.");
        self.tracker.stop_tailing_current_file();
        if let Some(record) = self.pending_record.take() {
            debug!(tailer = %self.name, record = ?record, "Dropping record not accepted before shutdown");
        }
        info!(tailer = %self.name, "Tailer stopped");
    }

    /// One pass over the pending files. Returns the number of records
    /// handed to the queue.
    pub fn run_once(&mut self) -> usize {
        match self.tracker.mode() {
            TrackingMode::Continuous => self.process_continuous(),
            TrackingMode::WholeFile => self.process_whole_files(),
        }
    }

    fn refresh_if_needed(&mut self) -> bool {
        if !self.tracker.refresh_due(self.refresh_interval) && !self.tracker.must_refresh_snapshot()
        {
            return false;
        }
        match self.tracker.refresh() {
            Ok(pending) => {
                trace!(tailer = %self.name, pending, "Tracker refreshed");
                true
            }
            Err(e) => {
                error!(tailer = %self.name, error = %e, "Failed to refresh tracked files");
                false
            }
        }
    }

    fn process_continuous(&mut self) -> usize {
        let mut processed = 0;
        let mut refreshed = self.refresh_if_needed();

        let mut work = self.tracker.pending_files();
        if work.is_empty() {
            if let Some(current) = self.tracker.current() {
                work.push(current.detached());
            }
        }
        if work.is_empty() {
            if self.parser.is_parsing() {
                self.fall_back_to_newest_file();
            }
            return processed;
        }

        // pending files are ordered newest first
        let mut next = work.len();
        while next > 0 && !self.cancel.is_cancelled() {
            let target = &work[next - 1];
            if !self.tracker.is_current(target.id()) {
                if let Err(e) = self.tracker.start_tailing_new_file(target.detached()) {
                    warn!(tailer = %self.name, file = %target, error = %e, "Failed to open file, skipping until next refresh");
                    self.parser.switch_parsing(None);
                    next -= 1;
                    continue;
                }
                info!(tailer = %self.name, file = %target, offset = target.last_offset(), "Switching to file");
                self.parser.switch_parsing(self.tracker.current_mut());
            } else if (refreshed && self.pending_record.is_none()) || !self.parser.is_parsing() {
                if let Some(current) = self.tracker.current_mut() {
                    self.parser.continue_parsing(current);
                }
                refreshed = false;
            }

            processed += self.process_records_in_current_file();
            if self.pending_record.is_some() {
                debug!(tailer = %self.name, processed, "Publisher is exerting backpressure, backing off");
                sleep_unless_cancelled(&self.cancel, self.min_poll);
                break;
            }
            if !self.parser.is_parsing() {
                // the parser gave up on the file after an error
                self.tracker.stop_tailing_current_file();
                break;
            }
            let Some(current) = self.tracker.current_mut() else {
                break;
            };
            if !self.parser.is_at_end_of_current_file(current) {
                // a partial record is waiting for more bytes
                break;
            }
            trace!(tailer = %self.name, file = %current, "Reached end of file");
            if !self.tracker.on_end_of_current_file() {
                break;
            }
            next -= 1;
        }
        processed
    }

    /// The current file is gone and nothing is pending: follow the newest
    /// file still listed, or stop parsing.
    fn fall_back_to_newest_file(&mut self) {
        let Some(file) = self.tracker.newest_live_file() else {
            info!(tailer = %self.name, "No file left to tail");
            self.parser.switch_parsing(None);
            return;
        };
        match self.tracker.start_tailing_new_file(file) {
            Ok(()) => {
                self.parser.switch_parsing(self.tracker.current_mut());
            }
            Err(e) => {
                warn!(tailer = %self.name, error = %e, "Failed to open newest file");
                self.parser.switch_parsing(None);
            }
        }
    }

    fn process_records_in_current_file(&mut self) -> usize {
        let Some(file) = self.tracker.current_mut() else {
            return 0;
        };
        let mut processed = 0;
        let mut next = match self.pending_record.take() {
            Some(record) => Some(record),
            None => self.parser.read_record(file),
        };
        while let Some(mut record) = next {
            self.limit.enforce(&mut record, &self.name, &self.metrics);
            if self.cancel.is_cancelled() {
                self.pending_record = Some(record);
                break;
            }
            match self.queue.offer_record(record) {
                Ok(()) => {
                    processed += 1;
                    next = self.parser.read_record(file);
                }
                Err(record) => {
                    self.pending_record = Some(record);
                    break;
                }
            }
        }
        self.metrics
            .records_published
            .fetch_add(processed as u64, Ordering::Relaxed);
        processed
    }

    fn process_whole_files(&mut self) -> usize {
        let mut processed = 0;
        self.refresh_if_needed();

        let mut work = self.tracker.pending_files();
        // oldest first
        while let Some(mut file) = work.pop() {
            loop {
                if self.cancel.is_cancelled() {
                    return processed;
                }
                let record = match self.pending_record.take() {
                    Some(record) => Some(record),
                    None if self.parser.start_parsing(&mut file) => {
                        let record = self.parser.read_record(&mut file);
                        self.parser.stop_parsing("Finished.");
                        record
                    }
                    None => None,
                };
                let Some(mut record) = record else {
                    break;
                };
                self.limit.enforce(&mut record, &self.name, &self.metrics);
                match self.queue.offer_record(record) {
                    Ok(()) => {
                        processed += 1;
                        self.metrics.records_published.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(record) => {
                        self.pending_record = Some(record);
                        if !sleep_unless_cancelled(&self.cancel, self.min_poll) {
                            return processed;
                        }
                    }
                }
            }
            self.tracker.remove_pending(file.id());
        }
        processed
    }

    fn bytes_behind(&mut self) -> u64 {
        let mut behind = self.parser.buffered_bytes_remaining() as u64;
        if let Some(current) = self.tracker.current_mut() {
            if current.is_open() {
                match (current.current_size(), current.current_offset()) {
                    (Ok(size), Ok(offset)) => behind += size.saturating_sub(offset),
                    (Err(e), _) | (_, Err(e)) => {
                        error!(tailer = %self.name, error = %e, "Failed to compute bytes behind")
                    }
                }
            }
        }
        behind + self.tracker.pending_bytes()
    }

    fn emit_status(&mut self) {
        self.last_status = Instant::now();
        let files_behind = self.tracker.pending().len() as u64;
        let bytes_behind = self.bytes_behind();
        self.metrics.files_behind.store(files_behind, Ordering::Relaxed);
        self.metrics.bytes_behind.store(bytes_behind, Ordering::Relaxed);

        let parser = self.parser.metrics();
        let publisher = &self.publisher_metrics;
        info!(
            tailer = %self.name,
            files_tracked = self.tracker.snapshot().len(),
            files_behind,
            bytes_behind,
            records_parsed = parser.records_parsed.load(Ordering::Relaxed),
            records_truncated = self.metrics.records_truncated.load(Ordering::Relaxed),
            records_sent = publisher.records_sent.load(Ordering::Relaxed),
            send_errors = publisher.send_errors.load(Ordering::Relaxed),
            buffers_dropped = publisher.buffers_dropped.load(Ordering::Relaxed),
            current = ?self.tracker.current().map(|f| f.path()),
            "Tailer status"
        );

        let mb = bytes_behind as f64 / (1024.0 * 1024.0);
        if bytes_behind >= self.bytes_behind_warn {
            warn!(tailer = %self.name, files_behind, "Tailer is {:.2} MB ({} bytes) behind", mb, bytes_behind);
        } else if bytes_behind >= self.bytes_behind_info {
            info!(tailer = %self.name, files_behind, "Tailer is {:.2} MB ({} bytes) behind", mb, bytes_behind);
        } else if bytes_behind > 0 {
            debug!(tailer = %self.name, files_behind, "Tailer is {} bytes behind", bytes_behind);
        }
    }
}
