// SPDX-License-Identifier: Apache-2.0

//! Agent settings: a JSON file, `LOGSHIP_` environment variables and the
//! command line, in increasing order of precedence.

use std::path::PathBuf;
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Json};
use serde::Deserialize;
use tower::BoxError;

use crate::init::args::AgentRun;
use crate::tailing::config::FlowConfig;

pub const DEFAULT_CHECKPOINT_FILE: &str = "/var/lib/logship/checkpoints.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub checkpoint_file: PathBuf,
    pub checkpoint_ttl_days: u32,
    pub shutdown_timeout_ms: u64,
    pub flows: Vec<FlowConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            checkpoint_file: PathBuf::from(DEFAULT_CHECKPOINT_FILE),
            checkpoint_ttl_days: 7,
            shutdown_timeout_ms: 10_000,
            flows: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn load(args: &AgentRun) -> Result<Self, BoxError> {
        let mut figment = Figment::new();
        if let Some(path) = &args.config {
            if !path.exists() {
                return Err(format!("config file {} does not exist", path.display()).into());
            }
            figment = figment.merge(Json::file(path));
        }
        figment = figment.merge(Env::prefixed("LOGSHIP_").only(&[
            "checkpoint_file",
            "checkpoint_ttl_days",
            "shutdown_timeout_ms",
        ]));

        let mut config: AgentConfig = figment
            .extract()
            .map_err(|e| format!("failed to load configuration: {}", e))?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn apply_args(&mut self, args: &AgentRun) {
        if let Some(path) = &args.checkpoint_file {
            self.checkpoint_file = path.clone();
        }
        if let Some(days) = args.checkpoint_ttl_days {
            self.checkpoint_ttl_days = days;
        }
        if let Some(ms) = args.shutdown_timeout_ms {
            self.shutdown_timeout_ms = ms;
        }
        if let (Some(pattern), Some(destination)) =
            (&args.flow.file_pattern, &args.flow.destination)
        {
            let mut flow = FlowConfig::new(pattern.clone(), destination.clone());
            flow.kind = args.flow.kind.into();
            flow.initial_position = args.flow.initial_position.into();
            flow.multi_line_start_pattern = args.flow.multi_line_start_pattern.clone();
            self.flows.push(flow);
        }
    }

    pub fn validate(&self) -> Result<(), BoxError> {
        if self.flows.is_empty() {
            return Err("no flows configured".into());
        }
        let mut ids = Vec::with_capacity(self.flows.len());
        for flow in &self.flows {
            flow.validate()
                .map_err(|e| format!("invalid flow {}: {}", flow.file_pattern, e))?;
            let id = flow.flow_id();
            if ids.contains(&id) {
                return Err(format!("duplicate flow {}", id).into());
            }
            ids.push(id);
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn checkpoint_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.checkpoint_ttl_days))
    }
}
