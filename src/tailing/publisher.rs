// SPDX-License-Identifier: Apache-2.0

//! Worker pool that sends ready buffers and commits what was delivered.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::tailing::backoff::{Backoff, sleep_unless_cancelled};
use crate::tailing::buffer::RecordBuffer;
use crate::tailing::checkpoint::Checkpointer;
use crate::tailing::cleanup::FileCleanup;
use crate::tailing::config::FlowConfig;
use crate::tailing::error::{Error, Result};
use crate::tailing::queue::PublishingQueue;
use crate::tailing::record::Record;
use crate::tailing::sender::{SendError, SendOutcome, Sender};

/// Longest a worker blocks in `take` before checking for shutdown
const MAX_TAKE_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
pub struct PublisherMetrics {
    pub send_success: AtomicU64,
    pub partial_success: AtomicU64,
    pub send_errors: AtomicU64,
    pub buffers_dropped: AtomicU64,
    pub buffers_sent: AtomicU64,
    pub records_sent: AtomicU64,
    pub records_failed: AtomicU64,
}

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub workers: usize,
    pub retry_initial_backoff: Duration,
    pub retry_max_backoff: Duration,
    pub take_timeout: Duration,
}

impl PublisherConfig {
    pub fn from_flow(flow: &FlowConfig) -> Self {
        Self {
            workers: flow.sending_threads(),
            retry_initial_backoff: flow.retry_initial_backoff(),
            retry_max_backoff: flow.retry_max_backoff(),
            take_timeout: flow.wait_on_empty_publish_queue(),
        }
    }
}

struct Shared {
    name: String,
    config: PublisherConfig,
    queue: Arc<PublishingQueue>,
    sender: Arc<dyn Sender>,
    checkpointer: Arc<Checkpointer>,
    cleanup: Option<FileCleanup>,
    metrics: Arc<PublisherMetrics>,
    in_flight: AtomicUsize,
    cancel: CancellationToken,
}

pub struct AsyncPublisher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncPublisher {
    pub fn new(
        name: impl Into<String>,
        config: PublisherConfig,
        queue: Arc<PublishingQueue>,
        sender: Arc<dyn Sender>,
        checkpointer: Arc<Checkpointer>,
        cleanup: Option<FileCleanup>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                queue,
                sender,
                checkpointer,
                cleanup,
                metrics: Arc::new(PublisherMetrics::default()),
                in_flight: AtomicUsize::new(0),
                cancel: CancellationToken::new(),
            }),
            workers: Vec::new(),
        }
    }

    /// Spawn the worker threads.
    pub fn start(&mut self) -> Result<()> {
        let workers = self.shared.config.workers.max(1);
        for i in 0..workers {
            let shared = self.shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("logship-publish-{}", i))
                .spawn(move || run_worker(shared, i))
                .map_err(|e| Error::Shutdown(format!("failed to spawn publisher worker: {}", e)))?;
            self.workers.push(handle);
        }
        info!(
            publisher = %self.shared.name,
            workers,
            destination = self.shared.sender.name(),
            "Publisher started"
        );
        Ok(())
    }

    /// Hand a record to the queue; see [`PublishingQueue::offer_record`].
    pub fn publish_record(&self, record: Record) -> std::result::Result<(), Record> {
        self.shared.queue.offer_record(record)
    }

    /// Cut the current buffer so workers can send it.
    pub fn flush(&self) -> bool {
        self.shared
            .queue
            .flush(self.shared.queue.config().wait_on_full)
    }

    pub fn queue(&self) -> &Arc<PublishingQueue> {
        &self.shared.queue
    }

    pub fn metrics(&self) -> &Arc<PublisherMetrics> {
        &self.shared.metrics
    }

    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// True when nothing is queued and no send is in progress.
    pub fn is_idle(&self) -> bool {
        let queue = &self.shared.queue;
        self.in_flight() == 0 && queue.pending_buffers() == 0 && queue.current_records() == 0
    }

    /// Wait for every queued buffer to be sent.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        true
    }

    /// Close the queue, discard what was not sent yet and give in-flight
    /// sends up to `timeout` to finish. Workers are signalled to stop; the
    /// returned handles can be joined.
    pub fn shutdown(&mut self, timeout: Duration) -> Vec<JoinHandle<()>> {
        let shared = &self.shared;
        shared.queue.close();
        let (buffers, records) = shared.queue.discard_all();
        shared
            .metrics
            .buffers_dropped
            .fetch_add(buffers as u64, Ordering::Relaxed);

        let deadline = Instant::now() + timeout;
        while shared.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        let in_flight = shared.in_flight.load(Ordering::SeqCst);
        if in_flight > 0 {
            warn!(publisher = %shared.name, in_flight, "Sends still in progress at shutdown");
        }
        shared.cancel.cancel();
        info!(
            publisher = %shared.name,
            discarded_buffers = buffers,
            discarded_records = records,
            "Publisher stopped"
        );
        std::mem::take(&mut self.workers)
    }
}

fn run_worker(shared: Arc<Shared>, index: usize) {
    debug!(publisher = %shared.name, worker = index, "Publisher worker started");
    let mut backoff = Backoff::new(
        shared.config.retry_initial_backoff,
        shared.config.retry_max_backoff,
    );
    let take_wait = shared.config.take_timeout.min(MAX_TAKE_WAIT);
    let mut delay: Option<Duration> = None;

    while !shared.cancel.is_cancelled() {
        if let Some(d) = delay.take() {
            trace!(publisher = %shared.name, worker = index, delay = ?d, "Backing off");
            if !sleep_unless_cancelled(&shared.cancel, d) {
                break;
            }
        }

        let Some(buffer) = shared.queue.take(take_wait) else {
            continue;
        };
        // a worker waiting on an empty queue is not sending
        shared.in_flight.fetch_add(1, Ordering::SeqCst);

        let delivered = send_buffer(&shared, buffer);
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);

        if delivered {
            backoff.reset();
        } else {
            delay = Some(backoff.next_delay());
        }
    }
    debug!(publisher = %shared.name, worker = index, "Publisher worker stopped");
}

/// Returns true when the whole buffer was delivered.
fn send_buffer(shared: &Shared, mut buffer: RecordBuffer) -> bool {
    let started = Instant::now();
    match shared.sender.send(&buffer) {
        Ok(SendOutcome::Success) => {
            on_success(shared, &buffer, started);
            true
        }
        Ok(SendOutcome::PartialSuccess { mut succeeded }) => {
            succeeded.sort_unstable();
            succeeded.dedup();
            succeeded.retain(|i| *i < buffer.size_records());
            if succeeded.len() == buffer.size_records() {
                on_success(shared, &buffer, started);
                return true;
            }
            on_partial_success(shared, &mut buffer, &succeeded);
            requeue(shared, buffer, "partial success");
            false
        }
        Err(e) => {
            on_error(shared, buffer, e);
            false
        }
    }
}

fn on_success(shared: &Shared, buffer: &RecordBuffer, started: Instant) {
    let m = &shared.metrics;
    m.send_success.fetch_add(1, Ordering::Relaxed);
    m.buffers_sent.fetch_add(1, Ordering::Relaxed);
    m.records_sent
        .fetch_add(buffer.size_records() as u64, Ordering::Relaxed);

    let offsets = buffer.end_offsets();
    shared.checkpointer.commit(buffer.id(), &offsets);
    if let Some(cleanup) = &shared.cleanup {
        cleanup.apply(&offsets);
    }
    debug!(
        publisher = %shared.name,
        buffer_id = buffer.id(),
        records = buffer.size_records(),
        bytes = buffer.size_bytes(),
        elapsed = ?started.elapsed(),
        "Buffer sent"
    );
}

fn on_partial_success(shared: &Shared, buffer: &mut RecordBuffer, succeeded: &[usize]) {
    let m = &shared.metrics;
    m.partial_success.fetch_add(1, Ordering::Relaxed);
    m.records_sent
        .fetch_add(succeeded.len() as u64, Ordering::Relaxed);
    m.records_failed.fetch_add(
        (buffer.size_records() - succeeded.len()) as u64,
        Ordering::Relaxed,
    );

    let offsets = buffer.committable_offsets(succeeded);
    shared.checkpointer.commit(buffer.id(), &offsets);

    let delivered = buffer.remove(succeeded);
    buffer.mark_acknowledged(&delivered);
    info!(
        publisher = %shared.name,
        buffer_id = buffer.id(),
        delivered = delivered.len(),
        remaining = buffer.size_records(),
        "Buffer partially sent, retrying the remainder"
    );
}

fn on_error(shared: &Shared, buffer: RecordBuffer, e: SendError) {
    shared.metrics.send_errors.fetch_add(1, Ordering::Relaxed);
    if !e.is_retriable() {
        shared.metrics.buffers_dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            publisher = %shared.name,
            buffer_id = buffer.id(),
            records = buffer.size_records(),
            error = %e,
            "Dropping buffer after non-retriable error"
        );
        return;
    }
    warn!(
        publisher = %shared.name,
        buffer_id = buffer.id(),
        records = buffer.size_records(),
        error = %e,
        "Failed to send buffer, will retry"
    );
    if let Some(pause) = e.retry_pause() {
        if !sleep_unless_cancelled(&shared.cancel, pause) {
            shared.metrics.buffers_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    requeue(shared, buffer, "send error");
}

fn requeue(shared: &Shared, buffer: RecordBuffer, reason: &str) {
    let (id, records) = (buffer.id(), buffer.size_records());
    if !shared.queue.queue_for_retry(buffer) {
        shared.metrics.buffers_dropped.fetch_add(1, Ordering::Relaxed);
        warn!(
            publisher = %shared.name,
            buffer_id = id,
            records,
            reason,
            "Dropping buffer, publisher is shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailing::checkpoint::{CheckpointStore, JsonFileCheckpointStore};
    use crate::tailing::queue::QueueConfig;
    use crate::tailing::source::file_id::FileId;
    use crate::tailing::source::tracked_file::FileSnapshot;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    const FLOW: &str = "stream:dest:/logs/*.log";

    /// Replays scripted outcomes and records what each attempt carried.
    struct ScriptedSender {
        script: Mutex<VecDeque<std::result::Result<SendOutcome, SendError>>>,
        attempts: Mutex<Vec<Vec<u64>>>,
    }

    impl ScriptedSender {
        fn new(script: Vec<std::result::Result<SendOutcome, SendError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                attempts: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> Vec<Vec<u64>> {
            self.attempts.lock().unwrap().clone()
        }
    }

    impl Sender for ScriptedSender {
        fn send(&self, buffer: &RecordBuffer) -> std::result::Result<SendOutcome, SendError> {
            self.attempts
                .lock()
                .unwrap()
                .push(buffer.iter().map(|r| r.start_offset()).collect());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(SendOutcome::Success))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        file: Arc<FileSnapshot>,
        store: Arc<JsonFileCheckpointStore>,
        publisher: AsyncPublisher,
    }

    fn fixture(sender: Arc<ScriptedSender>, max_records: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("a.log");
        std::fs::write(&path, vec![b'x'; 100]).unwrap();
        let file = Arc::new(FileSnapshot {
            id: FileId::new(1, 42),
            path,
            last_modified: 0,
            size: 100,
        });

        let store = Arc::new(JsonFileCheckpointStore::open_memory());
        let checkpointer = Arc::new(Checkpointer::new(FLOW, store.clone()));
        let queue = Arc::new(PublishingQueue::new(
            "test",
            QueueConfig {
                max_buffer_records: max_records,
                max_buffer_bytes: 1 << 20,
                max_buffer_age: Duration::from_secs(60),
                capacity: 10,
                wait_on_full: Duration::from_millis(100),
                wait_on_empty: Duration::from_millis(100),
                per_record_overhead: 0,
                per_buffer_overhead: 0,
            },
        ));
        let publisher = AsyncPublisher::new(
            "test",
            PublisherConfig {
                workers: 1,
                retry_initial_backoff: Duration::from_millis(1),
                retry_max_backoff: Duration::from_millis(5),
                take_timeout: Duration::from_millis(50),
            },
            queue,
            sender,
            checkpointer,
            None,
        );
        Fixture {
            _dir: dir,
            file,
            store,
            publisher,
        }
    }

    fn record(file: &Arc<FileSnapshot>, i: u64) -> Record {
        Record::new(file.clone(), i * 10, b"012345678\n", b'\n', false)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_success_commits_last_offset() {
        let sender = ScriptedSender::new(vec![]);
        let mut fx = fixture(sender.clone(), 3);
        fx.publisher.start().unwrap();
        for i in 0..3 {
            fx.publisher.publish_record(record(&fx.file, i)).unwrap();
        }
        wait_until(|| sender.attempts().len() == 1);
        assert!(fx.publisher.wait_for_idle(Duration::from_secs(5)));

        assert_eq!(
            fx.store.get_offset_for_file_id(FLOW, fx.file.id).unwrap(),
            30
        );
        let m = fx.publisher.metrics();
        assert_eq!(m.send_success.load(Ordering::Relaxed), 1);
        assert_eq!(m.records_sent.load(Ordering::Relaxed), 3);

        for h in fx.publisher.shutdown(Duration::from_secs(1)) {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_waiting_workers_are_not_in_flight() {
        let sender = ScriptedSender::new(vec![]);
        let mut fx = fixture(sender, 3);
        fx.publisher.start().unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(fx.publisher.in_flight(), 0);
        assert!(fx.publisher.is_idle());

        let started = Instant::now();
        let handles = fx.publisher.shutdown(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(1));
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_partial_success_retries_failed_records_in_order() {
        let succeeded: Vec<usize> = (0..10).filter(|i| *i != 3 && *i != 7).collect();
        let sender = ScriptedSender::new(vec![Ok(SendOutcome::PartialSuccess { succeeded })]);
        let mut fx = fixture(sender.clone(), 10);
        for i in 0..10 {
            fx.publisher.publish_record(record(&fx.file, i)).unwrap();
        }

        // first attempt driven by hand to observe the checkpoint in between
        let buffer = fx.publisher.queue().take(Duration::ZERO).unwrap();
        assert!(!send_buffer(&fx.publisher.shared, buffer));
        // records 0..=2 delivered before the first failure
        assert_eq!(
            fx.store.get_offset_for_file_id(FLOW, fx.file.id).unwrap(),
            30
        );

        let retry = fx.publisher.queue().take(Duration::ZERO).unwrap();
        let left: Vec<u64> = retry.iter().map(|r| r.start_offset()).collect();
        assert_eq!(left, vec![30, 70]);

        assert!(send_buffer(&fx.publisher.shared, retry));
        assert_eq!(
            fx.store.get_offset_for_file_id(FLOW, fx.file.id).unwrap(),
            100
        );
        assert_eq!(sender.attempts().len(), 2);
        assert_eq!(
            fx.publisher
                .metrics()
                .partial_success
                .load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_retriable_error_is_retried() {
        let sender = ScriptedSender::new(vec![Err(SendError::Service {
            status: 500,
            message: "oops".to_string(),
        })]);
        let mut fx = fixture(sender.clone(), 2);
        fx.publisher.start().unwrap();
        fx.publisher.publish_record(record(&fx.file, 0)).unwrap();
        fx.publisher.publish_record(record(&fx.file, 1)).unwrap();

        wait_until(|| sender.attempts().len() == 2);
        assert!(fx.publisher.wait_for_idle(Duration::from_secs(5)));
        assert_eq!(sender.attempts()[0], sender.attempts()[1]);
        assert_eq!(
            fx.store.get_offset_for_file_id(FLOW, fx.file.id).unwrap(),
            20
        );
        assert_eq!(fx.publisher.metrics().send_errors.load(Ordering::Relaxed), 1);
        for h in fx.publisher.shutdown(Duration::from_secs(1)) {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_non_retriable_error_drops_buffer() {
        let sender =
            ScriptedSender::new(vec![Err(SendError::Authentication("denied".to_string()))]);
        let fx = fixture(sender.clone(), 1);
        fx.publisher.publish_record(record(&fx.file, 0)).unwrap();

        let buffer = fx.publisher.queue().take(Duration::ZERO).unwrap();
        assert!(!send_buffer(&fx.publisher.shared, buffer));
        assert!(fx.publisher.queue().take(Duration::ZERO).is_none());
        assert_eq!(
            fx.publisher
                .metrics()
                .buffers_dropped
                .load(Ordering::Relaxed),
            1
        );
        assert_eq!(fx.store.get_offset_for_file_id(FLOW, fx.file.id).unwrap(), 0);
    }

    #[test]
    fn test_shutdown_discards_unsent() {
        let sender = ScriptedSender::new(vec![]);
        let mut fx = fixture(sender.clone(), 100);
        fx.publisher.publish_record(record(&fx.file, 0)).unwrap();
        fx.publisher.publish_record(record(&fx.file, 1)).unwrap();

        let handles = fx.publisher.shutdown(Duration::from_millis(100));
        assert!(handles.is_empty());
        assert!(fx.publisher.publish_record(record(&fx.file, 2)).is_err());
        assert_eq!(
            fx.publisher
                .metrics()
                .buffers_dropped
                .load(Ordering::Relaxed),
            1
        );
        assert!(sender.attempts().is_empty());
    }
}
