// SPDX-License-Identifier: Apache-2.0

//! Tailing rotating log files and shipping their records.
//!
//! A [`flow::Flow`] runs one tailer thread that follows files matched by a
//! glob through rotations, parses them into records and hands the records
//! to a [`queue::PublishingQueue`]. Publisher workers send the buffers cut
//! from that queue and commit the delivered offsets as checkpoints.

pub mod backoff;
pub mod buffer;
pub mod checkpoint;
pub mod chunk;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod flow;
pub mod parser;
pub mod publisher;
pub mod queue;
pub mod record;
pub mod sender;
pub mod source;
pub mod splitter;
pub mod tailer;
pub mod tracker;

pub use config::{FlowConfig, FlowKind};
pub use error::{Error, Result};
pub use flow::{Flow, FlowCapabilities, FlowExit};
