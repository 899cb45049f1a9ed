// SPDX-License-Identifier: Apache-2.0

//! Accumulates records into buffers and hands ready buffers to publisher
//! workers.
//!
//! A buffer is cut when adding a record would exceed the record count or
//! byte limit, or when it has been open longer than the maximum age. Ready
//! buffers wait in a bounded channel; a full channel pushes back on the
//! producer. Buffers queued for retry are taken before ready ones.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::tailing::buffer::RecordBuffer;
use crate::tailing::config::FlowConfig;
use crate::tailing::record::Record;

/// Longest a waiting `take` goes without checking buffer age and retries
const TAKE_POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_buffer_records: usize,
    pub max_buffer_bytes: u64,
    pub max_buffer_age: Duration,
    pub capacity: usize,
    pub wait_on_full: Duration,
    pub wait_on_empty: Duration,
    pub per_record_overhead: usize,
    pub per_buffer_overhead: usize,
}

impl QueueConfig {
    pub fn from_flow(flow: &FlowConfig) -> Self {
        let limits = flow.limits();
        Self {
            max_buffer_records: flow.buffer_size_records(),
            max_buffer_bytes: flow.buffer_size_bytes() as u64,
            max_buffer_age: flow.max_buffer_age(),
            capacity: flow.publish_queue_capacity,
            wait_on_full: flow.wait_on_full_publish_queue(),
            wait_on_empty: flow.wait_on_empty_publish_queue(),
            per_record_overhead: limits.per_record_overhead_bytes,
            per_buffer_overhead: limits.per_buffer_overhead_bytes,
        }
    }
}

#[derive(Debug, Default)]
pub struct QueueMetrics {
    pub records_queued: AtomicU64,
    pub buffers_queued: AtomicU64,
    pub buffers_retried: AtomicU64,
    pub offers_rejected: AtomicU64,
}

pub struct PublishingQueue {
    name: String,
    config: QueueConfig,
    current: Mutex<Option<RecordBuffer>>,
    ready_tx: BoundedSender<RecordBuffer>,
    ready_rx: BoundedReceiver<RecordBuffer>,
    retry_tx: BoundedSender<RecordBuffer>,
    retry_rx: BoundedReceiver<RecordBuffer>,
    closed: AtomicBool,
    metrics: QueueMetrics,
}

impl PublishingQueue {
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        let (ready_tx, ready_rx) = bounded_channel::bounded(config.capacity.max(1));
        let (retry_tx, retry_rx) = bounded_channel::unbounded();
        Self {
            name: name.into(),
            config,
            current: Mutex::new(None),
            ready_tx,
            ready_rx,
            retry_tx,
            retry_rx,
            closed: AtomicBool::new(false),
            metrics: QueueMetrics::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn metrics(&self) -> &QueueMetrics {
        &self.metrics
    }

    /// Add a record to the current buffer. When the current buffer has to be
    /// cut and the ready queue stays full for the configured wait, the record
    /// is handed back so the caller can offer it again later.
    pub fn offer_record(&self, record: Record) -> Result<(), Record> {
        if self.is_closed() {
            return Err(record);
        }
        let mut current = match self.current.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };

        let must_cut = current.as_ref().is_some_and(|buf| {
            !buf.is_empty()
                && (buf.size_records() >= self.config.max_buffer_records
                    || buf.size_with(record.length()) > self.config.max_buffer_bytes
                    || buf.age() >= self.config.max_buffer_age)
        });
        if must_cut {
            if let Some(full) = current.take() {
                if let Err(full) = self.queue_ready(full, self.config.wait_on_full) {
                    *current = Some(full);
                    self.metrics.offers_rejected.fetch_add(1, Ordering::Relaxed);
                    trace!(queue = %self.name, "Publishing queue is full");
                    return Err(record);
                }
            }
        }

        let buf = current.get_or_insert_with(|| self.new_buffer());
        buf.add(record);
        self.metrics.records_queued.fetch_add(1, Ordering::Relaxed);

        // a buffer at its record limit goes out right away if there is room
        if buf.size_records() >= self.config.max_buffer_records {
            if let Some(full) = current.take() {
                if let Err(full) = self.queue_ready(full, Duration::ZERO) {
                    *current = Some(full);
                }
            }
        }
        Ok(())
    }

    /// Next buffer to send: retries first, then ready buffers, then the
    /// current buffer once it is old enough. Waits up to `timeout`.
    pub fn take(&self, timeout: Duration) -> Option<RecordBuffer> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(buf) = self.retry_rx.try_recv() {
                return Some(buf);
            }
            if let Some(buf) = self.ready_rx.try_recv() {
                return Some(buf);
            }
            if let Some(buf) = self.cut_if_aged() {
                return Some(buf);
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let wait = TAKE_POLL_SLICE.min(deadline - now);
            if let Some(buf) = self.ready_rx.recv_timeout(wait) {
                return Some(buf);
            }
        }
    }

    /// Put a failed buffer back ahead of newer ones. Returns false, dropping
    /// the buffer, once the queue is closed.
    pub fn queue_for_retry(&self, buffer: RecordBuffer) -> bool {
        if self.is_closed() {
            debug!(queue = %self.name, buffer_id = buffer.id(), "Queue closed, not retrying buffer");
            return false;
        }
        self.metrics.buffers_retried.fetch_add(1, Ordering::Relaxed);
        match self.retry_tx.try_send(buffer) {
            Ok(()) => true,
            Err(e) => {
                warn!(queue = %self.name, buffer_id = e.into_inner().id(), "Failed to queue buffer for retry");
                false
            }
        }
    }

    /// Move the current buffer to the ready queue, waiting up to `timeout`
    /// for room. Returns false if it stayed where it was.
    pub fn flush(&self, timeout: Duration) -> bool {
        let mut current = match self.current.lock() {
            Ok(current) => current,
            Err(poisoned) => poisoned.into_inner(),
        };
        match current.take() {
            Some(buf) if !buf.is_empty() => match self.queue_ready(buf, timeout) {
                Ok(()) => true,
                Err(buf) => {
                    *current = Some(buf);
                    false
                }
            },
            _ => true,
        }
    }

    /// Stop accepting records and retries.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(queue = %self.name, pending = self.pending_buffers(), "Publishing queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop everything not yet sent. Returns the number of buffers and
    /// records discarded.
    pub fn discard_all(&self) -> (usize, usize) {
        let mut buffers = self.retry_rx.drain();
        buffers.extend(self.ready_rx.drain());
        let current = match self.current.lock() {
            Ok(mut current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        buffers.extend(current);

        let records: usize = buffers.iter().map(|b| b.size_records()).sum();
        if records > 0 {
            warn!(
                queue = %self.name,
                buffers = buffers.len(),
                records,
                "Discarding records that were not sent"
            );
        }
        (buffers.len(), records)
    }

    /// Buffers waiting to be taken, not counting the current one.
    pub fn pending_buffers(&self) -> usize {
        self.ready_rx.len() + self.retry_rx.len()
    }

    pub fn current_records(&self) -> usize {
        match self.current.lock() {
            Ok(current) => current.as_ref().map(|b| b.size_records()).unwrap_or(0),
            Err(_) => 0,
        }
    }

    fn new_buffer(&self) -> RecordBuffer {
        RecordBuffer::new(
            self.config.per_record_overhead,
            self.config.per_buffer_overhead,
        )
    }

    fn queue_ready(&self, buf: RecordBuffer, timeout: Duration) -> Result<(), RecordBuffer> {
        let (id, records) = (buf.id(), buf.size_records());
        let sent = if timeout.is_zero() {
            self.ready_tx.try_send(buf)
        } else {
            self.ready_tx.send_timeout(buf, timeout)
        };
        match sent {
            Ok(()) => {
                self.metrics.buffers_queued.fetch_add(1, Ordering::Relaxed);
                trace!(queue = %self.name, buffer_id = id, records, "Buffer ready");
                Ok(())
            }
            Err(e) => Err(e.into_inner()),
        }
    }

    /// The current buffer, if it is past its maximum age. Skipped while a
    /// producer holds the buffer.
    fn cut_if_aged(&self) -> Option<RecordBuffer> {
        let mut current = self.current.try_lock().ok()?;
        let aged = current
            .as_ref()
            .is_some_and(|b| !b.is_empty() && b.age() >= self.config.max_buffer_age);
        if aged {
            let buf = current.take();
            if let Some(b) = &buf {
                trace!(queue = %self.name, buffer_id = b.id(), age = ?b.age(), "Cutting aged buffer");
            }
            buf
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailing::source::file_id::FileId;
    use crate::tailing::source::tracked_file::FileSnapshot;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn config() -> QueueConfig {
        QueueConfig {
            max_buffer_records: 2,
            max_buffer_bytes: 1024,
            max_buffer_age: Duration::from_secs(60),
            capacity: 1,
            wait_on_full: Duration::from_millis(50),
            wait_on_empty: Duration::from_millis(50),
            per_record_overhead: 0,
            per_buffer_overhead: 0,
        }
    }

    fn record(n: u64) -> Record {
        let file = Arc::new(FileSnapshot {
            id: FileId::new(1, 1),
            path: PathBuf::from("/logs/a.log"),
            last_modified: 0,
            size: 1000,
        });
        Record::new(file, n * 10, b"012345678\n", b'\n', false)
    }

    #[test]
    fn test_backpressure_returns_record() {
        let queue = PublishingQueue::new("test", config());
        for i in 0..4 {
            assert!(queue.offer_record(record(i)).is_ok());
        }
        // one buffer ready, the second one full and waiting
        assert_eq!(queue.pending_buffers(), 1);
        assert_eq!(queue.current_records(), 2);

        let start = Instant::now();
        let rejected = queue.offer_record(record(4)).unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(rejected.start_offset(), 40);
        assert_eq!(queue.metrics().offers_rejected.load(Ordering::Relaxed), 1);

        let first = queue.take(Duration::from_millis(10)).unwrap();
        assert_eq!(first.size_records(), 2);
        assert!(queue.offer_record(rejected).is_ok());

        let second = queue.take(Duration::from_millis(10)).unwrap();
        assert!(second.id() > first.id());
        let offsets: Vec<u64> = second.iter().map(|r| r.start_offset()).collect();
        assert_eq!(offsets, vec![20, 30]);
        assert_eq!(queue.current_records(), 1);
    }

    #[test]
    fn test_byte_limit_cuts_buffer() {
        let mut cfg = config();
        cfg.max_buffer_records = 100;
        cfg.max_buffer_bytes = 20;
        cfg.capacity = 10;
        let queue = PublishingQueue::new("test", cfg);
        for i in 0..3 {
            queue.offer_record(record(i)).unwrap();
        }
        let buf = queue.take(Duration::from_millis(10)).unwrap();
        assert_eq!(buf.size_records(), 2);
        assert_eq!(queue.current_records(), 1);
    }

    #[test]
    fn test_aged_buffer_is_taken() {
        let mut cfg = config();
        cfg.max_buffer_records = 100;
        cfg.max_buffer_age = Duration::from_millis(30);
        let queue = PublishingQueue::new("test", cfg);
        queue.offer_record(record(0)).unwrap();

        assert!(queue.take(Duration::ZERO).is_none());
        let buf = queue.take(Duration::from_secs(2)).unwrap();
        assert_eq!(buf.size_records(), 1);
        assert!(buf.age() >= Duration::from_millis(30));
    }

    #[test]
    fn test_retry_has_priority() {
        let mut cfg = config();
        cfg.capacity = 4;
        let queue = PublishingQueue::new("test", cfg);
        for i in 0..4 {
            queue.offer_record(record(i)).unwrap();
        }
        let first = queue.take(Duration::ZERO).unwrap();
        let first_id = first.id();
        assert!(queue.queue_for_retry(first));

        assert_eq!(queue.take(Duration::ZERO).unwrap().id(), first_id);
        assert_eq!(queue.metrics().buffers_retried.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_flush_and_take_timeout() {
        let mut cfg = config();
        cfg.max_buffer_records = 100;
        let queue = PublishingQueue::new("test", cfg);
        let start = Instant::now();
        assert!(queue.take(Duration::from_millis(30)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        queue.offer_record(record(0)).unwrap();
        assert!(queue.flush(Duration::from_millis(10)));
        assert_eq!(queue.take(Duration::ZERO).unwrap().size_records(), 1);
    }

    #[test]
    fn test_close_and_discard() {
        let mut cfg = config();
        cfg.capacity = 4;
        let queue = PublishingQueue::new("test", cfg);
        for i in 0..5 {
            queue.offer_record(record(i)).unwrap();
        }
        let taken = queue.take(Duration::ZERO).unwrap();

        queue.close();
        assert!(queue.is_closed());
        assert!(queue.offer_record(record(9)).is_err());
        assert!(!queue.queue_for_retry(taken));
        assert_eq!(queue.discard_all(), (2, 3));
        assert!(queue.take(Duration::ZERO).is_none());
    }
}
