// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use tokio::select;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::bounded;
use crate::init::config::AgentConfig;
use crate::senders::BuiltinCapabilities;
use crate::tailing::checkpoint::{CheckpointStore, JsonFileCheckpointStore};
use crate::tailing::flow::Flow;

/// Runs every configured flow until cancelled.
pub struct Agent {
    config: AgentConfig,
    store: Option<Arc<dyn CheckpointStore>>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Use `store` instead of the file named by the configuration.
    pub fn with_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn open_store(&self) -> Result<Arc<dyn CheckpointStore>, BoxError> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        if let Some(parent) = self.config.checkpoint_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Arc::new(JsonFileCheckpointStore::open(
            &self.config.checkpoint_file,
        )?))
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<(), BoxError> {
        let store = self.open_store()?;
        match store.delete_old_data(self.config.checkpoint_ttl()) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Removed expired checkpoints"),
            Err(e) => warn!(error = %e, "Failed to remove expired checkpoints"),
        }
        if tracing::enabled!(tracing::Level::DEBUG) {
            match store.dump_checkpoints() {
                Ok(rows) => {
                    for row in rows {
                        debug!(
                            flow = %row.flow,
                            file_id = %row.file_id,
                            path = ?row.path,
                            offset = row.offset,
                            size = row.size,
                            last_updated = %row.last_updated,
                            "Checkpoint"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "Failed to read checkpoints"),
            }
        }

        let (exit_tx, mut exit_rx) = bounded(self.config.flows.len().max(1));
        let mut flows = Vec::with_capacity(self.config.flows.len());
        for flow_config in &self.config.flows {
            let capabilities = BuiltinCapabilities::new(flow_config.kind);
            match Flow::start(
                flow_config,
                &capabilities,
                store.clone(),
                Some(exit_tx.clone()),
            ) {
                Ok(flow) => flows.push(flow),
                Err(e) => {
                    error!(flow = %flow_config.flow_id(), error = %e, "Failed to start flow");
                    stop_flows(flows, &self.config).await;
                    return Err(e.into());
                }
            }
        }
        drop(exit_tx);
        info!(flows = flows.len(), "Agent started");

        let mut result = Ok(());
        select! {
            _ = cancel.cancelled() => {
                info!("Agent cancelled, stopping flows");
            }
            exit = exit_rx.next() => {
                if let Some(exit) = exit {
                    error!(flow = %exit.flow_id, "Flow exited unexpectedly, stopping agent");
                    result = Err(format!("flow {} exited", exit.flow_id).into());
                }
            }
        }

        stop_flows(flows, &self.config).await;
        info!("Agent stopped");
        result
    }
}

async fn stop_flows(flows: Vec<Flow>, config: &AgentConfig) {
    let timeout = config.shutdown_timeout();
    let stops = flows.into_iter().map(|flow| async move {
        let id = flow.id().to_string();
        if let Err(e) = flow.stop(timeout).await {
            warn!(flow = %id, error = %e, "Flow did not stop cleanly");
        }
    });
    for stop in stops {
        stop.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tailing::config::FlowConfig;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_agent_ships_to_file_until_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        std::fs::create_dir_all(&logs).unwrap();
        std::fs::write(logs.join("app.log"), b"first\nsecond\n").unwrap();
        let out = dir.path().join("out.jsonl");

        let mut flow = FlowConfig::new(
            format!("{}/*.log", logs.display()),
            format!("file:{}", out.display()),
        );
        flow.min_time_between_file_polls_ms = Some(10);
        flow.max_buffer_age_ms = 500;
        flow.wait_on_empty_publish_queue_ms = 1000;
        let config = AgentConfig {
            checkpoint_file: dir.path().join("state").join("checkpoints.json"),
            shutdown_timeout_ms: 1000,
            flows: vec![flow],
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        let agent = Agent::new(config);
        let handle = tokio::spawn(agent.run(cancel.clone()));

        let mut delivered = String::new();
        for _ in 0..100 {
            delivered = std::fs::read_to_string(&out).unwrap_or_default();
            if delivered.lines().count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(delivered.lines().count(), 2);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
        assert!(dir.path().join("state").join("checkpoints.json").exists());
    }

    #[tokio::test]
    async fn test_unknown_destination_fails_start() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            flows: vec![FlowConfig::new(
                format!("{}/*.log", dir.path().display()),
                "nowhere",
            )],
            ..Default::default()
        };
        let agent = Agent::new(config)
            .with_store(Arc::new(JsonFileCheckpointStore::open_memory()));
        assert!(agent.run(CancellationToken::new()).await.is_err());
    }
}
