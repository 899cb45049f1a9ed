// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::tailing::config::{FlowKind, InitialPosition};

#[derive(Debug, Args, Clone, Default)]
pub struct AgentRun {
    /// JSON file with the agent settings and its flows
    #[arg(long, env = "LOGSHIP_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where checkpoints are persisted
    #[arg(long, env = "LOGSHIP_CHECKPOINT_FILE")]
    pub checkpoint_file: Option<PathBuf>,

    /// Days after which checkpoints that were not updated are removed
    #[arg(long, env = "LOGSHIP_CHECKPOINT_TTL_DAYS")]
    pub checkpoint_ttl_days: Option<u32>,

    /// Time given to in-flight sends when stopping
    #[arg(long, env = "LOGSHIP_SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: Option<u64>,

    #[command(flatten)]
    pub flow: FlowArgs,
}

/// A single flow given on the command line, added to the configured ones.
#[derive(Debug, Args, Clone, Default)]
pub struct FlowArgs {
    /// Files to tail, as `directory/glob`
    #[arg(long, env = "LOGSHIP_FILE_PATTERN", requires = "destination")]
    pub file_pattern: Option<String>,

    /// Destination: blackhole, debug, debug:detailed or file:<path>
    #[arg(long, env = "LOGSHIP_DESTINATION", requires = "file_pattern")]
    pub destination: Option<String>,

    /// How files are delivered
    #[arg(value_enum, long, env = "LOGSHIP_FLOW_KIND", default_value = "stream")]
    pub kind: FlowKindArg,

    /// Where tailing starts for files without a checkpoint
    #[arg(
        value_enum,
        long,
        env = "LOGSHIP_INITIAL_POSITION",
        default_value = "start-of-file"
    )]
    pub initial_position: InitialPositionArg,

    /// Regex matching the first line of multi-line records
    #[arg(long, env = "LOGSHIP_MULTI_LINE_START_PATTERN")]
    pub multi_line_start_pattern: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum FlowKindArg {
    #[default]
    Stream,
    WholeFile,
}

impl From<FlowKindArg> for FlowKind {
    fn from(value: FlowKindArg) -> Self {
        match value {
            FlowKindArg::Stream => FlowKind::Stream,
            FlowKindArg::WholeFile => FlowKind::WholeFile,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum InitialPositionArg {
    #[default]
    StartOfFile,
    EndOfFile,
}

impl From<InitialPositionArg> for InitialPosition {
    fn from(value: InitialPositionArg) -> Self {
        match value {
            InitialPositionArg::StartOfFile => InitialPosition::StartOfFile,
            InitialPositionArg::EndOfFile => InitialPosition::EndOfFile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct TestArgs {
        #[command(flatten)]
        agent: AgentRun,
    }

    #[test]
    fn test_flow_args() {
        let args = TestArgs::try_parse_from([
            "logship",
            "--file-pattern",
            "/var/log/app/*.log",
            "--destination",
            "debug",
            "--kind",
            "whole-file",
            "--initial-position",
            "end-of-file",
        ])
        .unwrap();
        let flow = args.agent.flow;
        assert_eq!(flow.file_pattern.as_deref(), Some("/var/log/app/*.log"));
        assert_eq!(FlowKind::from(flow.kind), FlowKind::WholeFile);
        assert_eq!(
            InitialPosition::from(flow.initial_position),
            InitialPosition::EndOfFile
        );
    }

    #[test]
    fn test_pattern_requires_destination() {
        assert!(TestArgs::try_parse_from(["logship", "--file-pattern", "/logs/*"]).is_err());
    }
}
