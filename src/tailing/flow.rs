// SPDX-License-Identifier: Apache-2.0

//! A flow ties one source pattern to one destination: tracker, parser,
//! tailer thread, publishing queue and publisher workers.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::tailing::checkpoint::{CheckpointStore, Checkpointer};
use crate::tailing::cleanup::FileCleanup;
use crate::tailing::config::{FlowConfig, FlowKind, FlowLimits};
use crate::tailing::error::{Error, Result};
use crate::tailing::parser::{ChunkParser, ParserOptions, RecordParser, WholeFileParser, build_splitter};
use crate::tailing::publisher::{AsyncPublisher, PublisherConfig, PublisherMetrics};
use crate::tailing::queue::{PublishingQueue, QueueConfig};
use crate::tailing::record::PartitionKeyOption;
use crate::tailing::sender::Sender;
use crate::tailing::source::{IdentityResolver, InodeResolver, SourceFile};
use crate::tailing::tailer::{FileTailer, TailerMetrics};
use crate::tailing::tracker::SourceFileTracker;

/// What a destination kind provides to a flow.
pub trait FlowCapabilities: Send + Sync {
    fn kind(&self) -> FlowKind;

    fn limits(&self) -> &'static FlowLimits {
        self.kind().limits()
    }

    fn build_sender(&self, flow: &FlowConfig) -> Result<Arc<dyn Sender>>;

    fn build_parser(&self, flow: &FlowConfig) -> Result<Box<dyn RecordParser>> {
        let parser: Box<dyn RecordParser> = match self.kind() {
            FlowKind::Stream => Box::new(ChunkParser::new(
                flow.flow_id(),
                build_splitter(flow)?,
                ParserOptions::from_flow(flow),
            )),
            FlowKind::WholeFile => Box::new(WholeFileParser::new(
                flow.partition_key.as_deref().map(PartitionKeyOption::parse),
            )),
        };
        Ok(parser)
    }
}

/// Notification sent when a flow's tailer thread exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowExit {
    pub flow_id: String,
    pub cancelled: bool,
}

pub struct Flow {
    id: String,
    publisher: AsyncPublisher,
    tailer: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    tailer_metrics: Arc<TailerMetrics>,
}

impl Flow {
    /// Build every part of the flow and start the publisher workers and the
    /// tailer thread. `exits` is told when the tailer thread ends.
    pub fn start(
        config: &FlowConfig,
        capabilities: &dyn FlowCapabilities,
        store: Arc<dyn CheckpointStore>,
        exits: Option<BoundedSender<FlowExit>>,
    ) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        if capabilities.kind() != config.kind {
            return Err(Error::Config(format!(
                "flow kind {} does not match destination kind {}",
                config.kind.as_str(),
                capabilities.kind().as_str()
            )));
        }
        let id = config.flow_id();
        let resolver: Arc<dyn IdentityResolver> = Arc::new(InodeResolver);

        let source = SourceFile::new(config, resolver.clone())?;
        let checkpointer = Arc::new(Checkpointer::new(id.clone(), store));
        let queue = Arc::new(PublishingQueue::new(id.clone(), QueueConfig::from_flow(config)));
        let sender = capabilities.build_sender(config)?;
        let parser = capabilities.build_parser(config)?;

        let mut publisher = AsyncPublisher::new(
            id.clone(),
            PublisherConfig::from_flow(config),
            queue.clone(),
            sender,
            checkpointer.clone(),
            FileCleanup::from_flow(config, resolver),
        );
        publisher.start()?;

        let cancel = CancellationToken::new();
        let tracker = SourceFileTracker::new(config, source, checkpointer);
        let tailer = FileTailer::new(
            config,
            tracker,
            parser,
            queue,
            publisher.metrics().clone(),
            cancel.clone(),
        );
        let tailer_metrics = tailer.metrics().clone();

        let thread_cancel = cancel.clone();
        let thread_id = id.clone();
        let handle = std::thread::Builder::new()
            .name("logship-tailer".to_string())
            .spawn(move || {
                tailer.run();
                if let Some(exits) = exits {
                    let exit = FlowExit {
                        flow_id: thread_id,
                        cancelled: thread_cancel.is_cancelled(),
                    };
                    if exits.send_blocking(exit).is_err() {
                        debug!("Flow exit receiver is gone");
                    }
                }
            });
        let handle = match handle {
            Ok(handle) => handle,
            Err(e) => {
                let panicked = join_workers(publisher.shutdown(Duration::ZERO));
                if panicked > 0 {
                    error!(flow = %id, panicked, "Publisher workers panicked");
                }
                return Err(Error::Shutdown(format!("failed to spawn tailer: {}", e)));
            }
        };

        info!(flow = %id, destination = %config.destination, "Flow started");
        Ok(Self {
            id,
            publisher,
            tailer: Some(handle),
            cancel,
            tailer_metrics,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tailer_metrics(&self) -> &Arc<TailerMetrics> {
        &self.tailer_metrics
    }

    pub fn publisher_metrics(&self) -> &Arc<PublisherMetrics> {
        self.publisher.metrics()
    }

    /// Stop reading, give in-flight sends up to `timeout` and join every
    /// thread of the flow. Records not yet sent are discarded.
    pub async fn stop(mut self, timeout: Duration) -> Result<()> {
        info!(flow = %self.id, "Stopping flow");
        self.cancel.cancel();

        let id = self.id.clone();
        let tailer = self.tailer.take();
        let mut publisher = self.publisher;
        let join = tokio::task::spawn_blocking(move || {
            let workers = publisher.shutdown(timeout);
            join_workers(tailer.into_iter().chain(workers))
        });

        // shutdown itself waits up to `timeout`, leave room for the joins
        match tokio::time::timeout(timeout + Duration::from_secs(1), join).await {
            Ok(Ok(0)) => {
                info!(flow = %id, "Flow stopped");
                Ok(())
            }
            Ok(Ok(panicked)) => {
                error!(flow = %id, panicked, "Flow threads panicked");
                Err(Error::Shutdown(format!("{} threads of flow {} panicked", panicked, id)))
            }
            Ok(Err(e)) => {
                error!(flow = %id, error = %e, "Failed to join flow threads");
                Err(Error::Shutdown(e.to_string()))
            }
            Err(_) => {
                warn!(flow = %id, "Timeout waiting for flow threads to stop");
                Err(Error::Shutdown(format!("timeout stopping flow {}", id)))
            }
        }
    }
}

/// Join every thread and return how many of them panicked.
fn join_workers(handles: impl IntoIterator<Item = JoinHandle<()>>) -> usize {
    handles
        .into_iter()
        .map(|handle| {
            let name = handle.thread().name().map(str::to_string);
            match handle.join() {
                Ok(()) => 0,
                Err(_) => {
                    warn!(thread = ?name, "Flow thread panicked");
                    1
                }
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::bounded;
    use crate::tailing::buffer::RecordBuffer;
    use crate::tailing::checkpoint::JsonFileCheckpointStore;
    use crate::tailing::sender::{SendError, SendOutcome};
    use crate::tailing::source::FileId;
    use std::sync::Mutex;
    use std::time::Instant;

    #[derive(Default)]
    struct CollectingSender {
        lines: Mutex<Vec<String>>,
    }

    impl Sender for CollectingSender {
        fn send(&self, buffer: &RecordBuffer) -> std::result::Result<SendOutcome, SendError> {
            let mut lines = self.lines.lock().unwrap();
            lines.extend(
                buffer
                    .iter()
                    .map(|r| String::from_utf8_lossy(r.data()).into_owned()),
            );
            Ok(SendOutcome::Success)
        }

        fn name(&self) -> &str {
            "collect"
        }
    }

    struct TestCapabilities {
        sender: Arc<CollectingSender>,
    }

    impl FlowCapabilities for TestCapabilities {
        fn kind(&self) -> FlowKind {
            FlowKind::Stream
        }

        fn build_sender(&self, _flow: &FlowConfig) -> Result<Arc<dyn Sender>> {
            Ok(self.sender.clone())
        }
    }

    fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        cond()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_flow_delivers_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"one\ntwo\n").unwrap();

        let mut config = FlowConfig::new(format!("{}/*.log", dir.path().display()), "collect");
        config.min_time_between_file_polls_ms = Some(10);
        config.max_buffer_age_ms = 500;
        config.wait_on_empty_publish_queue_ms = 1000;

        let sender = Arc::new(CollectingSender::default());
        let store: Arc<dyn CheckpointStore> = Arc::new(JsonFileCheckpointStore::open_memory());
        let (exit_tx, mut exit_rx) = bounded(1);
        let flow = Flow::start(
            &config,
            &TestCapabilities {
                sender: sender.clone(),
            },
            store.clone(),
            Some(exit_tx),
        )
        .unwrap();

        let id = FileId::from_path(&path).unwrap();
        let flow_id = config.flow_id();
        let delivered = wait_until(Duration::from_secs(5), || {
            store.get_offset_for_file_id(&flow_id, id).unwrap() == 8
        });
        assert!(delivered);
        assert_eq!(*sender.lines.lock().unwrap(), vec!["one", "two"]);

        flow.stop(Duration::from_secs(1)).await.unwrap();
        let exit = exit_rx.next().await.unwrap();
        assert_eq!(exit.flow_id, flow_id);
        assert!(exit.cancelled);
    }

    #[test]
    fn test_rejects_mismatched_kind() {
        let mut config = FlowConfig::new("/tmp/*.bin", "collect");
        config.kind = FlowKind::WholeFile;
        let capabilities = TestCapabilities {
            sender: Arc::new(CollectingSender::default()),
        };
        let store: Arc<dyn CheckpointStore> = Arc::new(JsonFileCheckpointStore::open_memory());
        assert!(matches!(
            Flow::start(&config, &capabilities, store, None),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_join_workers_counts_panics() {
        let ok = std::thread::spawn(|| {});
        let failed = std::thread::Builder::new()
            .name("logship-publisher-0".to_string())
            .spawn(|| panic!("send failed"))
            .unwrap();
        assert_eq!(join_workers(vec![ok, failed]), 1);
        assert_eq!(join_workers(Vec::new()), 0);
    }

    #[test]
    fn test_default_parser_follows_kind() {
        let capabilities = TestCapabilities {
            sender: Arc::new(CollectingSender::default()),
        };
        let mut config = FlowConfig::new("/logs/*.log", "collect");
        config.multi_line_start_pattern = Some("(".to_string());
        assert!(capabilities.build_parser(&config).is_err());
    }
}
