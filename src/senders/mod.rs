// SPDX-License-Identifier: Apache-2.0

//! Built-in destinations.
//!
//! The destination of a flow names one of them:
//!
//! - `blackhole` accepts and drops every buffer
//! - `debug` or `debug:detailed` logs buffers through `tracing`
//! - `file:<path>` appends records to a local file as JSON lines, or copies
//!   whole files into the directory `<path>`

pub mod blackhole;
pub mod debug;
pub mod file;

use std::path::PathBuf;
use std::sync::Arc;

use crate::tailing::config::{FlowConfig, FlowKind};
use crate::tailing::error::{Error, Result};
use crate::tailing::flow::FlowCapabilities;
use crate::tailing::sender::Sender;

pub use blackhole::BlackholeSender;
pub use debug::{DebugSender, DebugVerbosity};
pub use file::FileSender;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Blackhole,
    Debug(DebugVerbosity),
    File(PathBuf),
}

impl Destination {
    pub fn parse(destination: &str) -> Result<Self> {
        let (scheme, rest) = match destination.split_once(':') {
            Some((scheme, rest)) => (scheme, Some(rest)),
            None => (destination, None),
        };
        match (scheme, rest) {
            ("blackhole", None) => Ok(Destination::Blackhole),
            ("debug", None) => Ok(Destination::Debug(DebugVerbosity::Basic)),
            ("debug", Some("basic")) => Ok(Destination::Debug(DebugVerbosity::Basic)),
            ("debug", Some("detailed")) => Ok(Destination::Debug(DebugVerbosity::Detailed)),
            ("file", Some(path)) if !path.is_empty() => Ok(Destination::File(PathBuf::from(path))),
            _ => Err(Error::Config(format!("unknown destination {}", destination))),
        }
    }
}

/// Capabilities of the built-in destinations for one kind of flow.
pub struct BuiltinCapabilities {
    kind: FlowKind,
}

impl BuiltinCapabilities {
    pub fn new(kind: FlowKind) -> Self {
        Self { kind }
    }
}

impl FlowCapabilities for BuiltinCapabilities {
    fn kind(&self) -> FlowKind {
        self.kind
    }

    fn build_sender(&self, flow: &FlowConfig) -> Result<Arc<dyn Sender>> {
        let sender: Arc<dyn Sender> = match Destination::parse(&flow.destination)? {
            Destination::Blackhole => Arc::new(BlackholeSender::new(&flow.destination)),
            Destination::Debug(verbosity) => {
                Arc::new(DebugSender::new(&flow.destination, verbosity))
            }
            Destination::File(path) => Arc::new(FileSender::new(&flow.destination, path)),
        };
        Ok(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_destination() {
        assert_eq!(Destination::parse("blackhole").unwrap(), Destination::Blackhole);
        assert_eq!(
            Destination::parse("debug").unwrap(),
            Destination::Debug(DebugVerbosity::Basic)
        );
        assert_eq!(
            Destination::parse("debug:detailed").unwrap(),
            Destination::Debug(DebugVerbosity::Detailed)
        );
        assert_eq!(
            Destination::parse("file:/var/out/app.jsonl").unwrap(),
            Destination::File(PathBuf::from("/var/out/app.jsonl"))
        );
        assert!(Destination::parse("file:").is_err());
        assert!(Destination::parse("kinesis").is_err());
        assert!(Destination::parse("debug:loud").is_err());
    }

    #[test]
    fn test_builds_named_sender() {
        let flow = FlowConfig::new("/logs/*.log", "debug:detailed");
        let sender = BuiltinCapabilities::new(FlowKind::Stream)
            .build_sender(&flow)
            .unwrap();
        assert_eq!(sender.name(), "debug:detailed");
    }
}
