// SPDX-License-Identifier: Apache-2.0

//! Per-flow configuration and the destination policy tables.

use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

const ONE_MB: usize = 1024 * 1024;

const MIN_BUFFER_AGE: Duration = Duration::from_millis(500);
const MAX_BUFFER_AGE: Duration = Duration::from_secs(15 * 60);
const MIN_QUEUE_WAIT: Duration = Duration::from_secs(1);
const MAX_QUEUE_WAIT: Duration = Duration::from_secs(15 * 60);

/// How a flow delivers its files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Tail files continuously as they are appended to
    #[default]
    Stream,
    /// Ship each file as one record once it stops changing
    WholeFile,
}

impl FlowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowKind::Stream => "stream",
            FlowKind::WholeFile => "whole_file",
        }
    }

    pub fn limits(&self) -> &'static FlowLimits {
        match self {
            FlowKind::Stream => &STREAM_LIMITS,
            FlowKind::WholeFile => &WHOLE_FILE_LIMITS,
        }
    }
}

/// Where tailing starts for files seen for the first time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    #[default]
    StartOfFile,
    EndOfFile,
}

/// Ordering of a directory snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileComparator {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// What happens to a fully delivered, non-appendable file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    #[default]
    Never,
    Immediate,
}

/// Destination-specific limits. One table per [`FlowKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowLimits {
    pub max_record_size_bytes: usize,
    pub per_record_overhead_bytes: usize,
    pub per_buffer_overhead_bytes: usize,
    pub max_buffer_size_records: usize,
    pub max_buffer_size_bytes: usize,
    pub default_buffer_size_records: usize,
    pub parser_buffer_size_bytes: usize,
    pub default_sending_threads: usize,
    pub default_min_poll: Duration,
    pub appendable: bool,
    pub ignored_extensions: &'static [&'static str],
}

pub static STREAM_LIMITS: FlowLimits = FlowLimits {
    max_record_size_bytes: ONE_MB,
    per_record_overhead_bytes: 0,
    per_buffer_overhead_bytes: 0,
    max_buffer_size_records: 10_000,
    max_buffer_size_bytes: 4 * ONE_MB,
    default_buffer_size_records: 500,
    parser_buffer_size_bytes: 6 * ONE_MB,
    default_sending_threads: 1,
    default_min_poll: Duration::from_millis(100),
    appendable: true,
    ignored_extensions: &[".gz", ".bz2", ".zip", ".tar"],
};

pub static WHOLE_FILE_LIMITS: FlowLimits = FlowLimits {
    max_record_size_bytes: 128 * ONE_MB,
    per_record_overhead_bytes: 0,
    per_buffer_overhead_bytes: 0,
    max_buffer_size_records: 10,
    max_buffer_size_bytes: 128 * ONE_MB,
    default_buffer_size_records: 1,
    parser_buffer_size_bytes: 128 * ONE_MB,
    default_sending_threads: 10,
    default_min_poll: Duration::from_millis(1000),
    appendable: false,
    ignored_extensions: &[],
};

/// Configuration of a single flow: one source glob shipped to one destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// `directory/glob`; a trailing separator means every file in the directory
    pub file_pattern: String,
    /// Destination name, part of the flow id
    pub destination: String,
    pub kind: FlowKind,
    pub initial_position: InitialPosition,
    pub file_comparator: FileComparator,
    pub directory_recursion: bool,
    /// Number of leading bytes used to fingerprint a file
    pub header_bytes: usize,
    pub record_delimiter: char,
    /// A line matching this pattern starts a new record
    pub multi_line_start_pattern: Option<String>,
    pub skip_header_lines: usize,
    /// Keep the trailing delimiter in record payloads
    pub retain_record_delimiter: bool,
    pub truncated_record_terminator: String,
    pub ignore_empty_data: bool,
    pub file_appendable: Option<bool>,
    pub miss_last_record_delimiter: bool,
    pub max_file_checking_ms: u64,
    pub min_time_between_file_polls_ms: Option<u64>,
    pub max_time_between_tracker_refresh_ms: Option<u64>,
    pub max_buffer_size_records: Option<usize>,
    pub max_buffer_size_bytes: usize,
    pub max_buffer_age_ms: u64,
    pub publish_queue_capacity: usize,
    pub wait_on_full_publish_queue_ms: u64,
    pub wait_on_empty_publish_queue_ms: u64,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub sending_threads: Option<usize>,
    pub delete_policy: DeletePolicy,
    /// Consumed files are renamed with this suffix and excluded from listing
    pub file_suffix: Option<String>,
    pub file_move_to_dir: Option<PathBuf>,
    pub partition_key: Option<String>,
    pub status_interval_ms: u64,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            file_pattern: String::new(),
            destination: String::new(),
            kind: FlowKind::Stream,
            initial_position: InitialPosition::StartOfFile,
            file_comparator: FileComparator::NewestFirst,
            directory_recursion: false,
            header_bytes: 512,
            record_delimiter: '\n',
            multi_line_start_pattern: None,
            skip_header_lines: 0,
            retain_record_delimiter: false,
            truncated_record_terminator: "\n".to_string(),
            ignore_empty_data: true,
            file_appendable: None,
            miss_last_record_delimiter: false,
            max_file_checking_ms: 5_000,
            min_time_between_file_polls_ms: None,
            max_time_between_tracker_refresh_ms: None,
            max_buffer_size_records: None,
            max_buffer_size_bytes: 4 * ONE_MB,
            max_buffer_age_ms: 5_000,
            publish_queue_capacity: 100,
            wait_on_full_publish_queue_ms: 60_000,
            wait_on_empty_publish_queue_ms: 60_000,
            retry_initial_backoff_ms: 100,
            retry_max_backoff_ms: 10_000,
            sending_threads: None,
            delete_policy: DeletePolicy::Never,
            file_suffix: None,
            file_move_to_dir: None,
            partition_key: None,
            status_interval_ms: 30_000,
        }
    }
}

impl FlowConfig {
    pub fn new(file_pattern: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            file_pattern: file_pattern.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn limits(&self) -> &'static FlowLimits {
        self.kind.limits()
    }

    /// Stable identifier used to key checkpoints across restarts.
    pub fn flow_id(&self) -> String {
        let (dir, glob) = split_pattern(&self.file_pattern);
        format!(
            "{}:{}:{}",
            self.kind.as_str(),
            self.destination,
            dir.join(glob).display()
        )
    }

    /// Directory and file-name glob of the source pattern.
    pub fn source_parts(&self) -> (PathBuf, String) {
        split_pattern(&self.file_pattern)
    }

    pub fn delimiter_byte(&self) -> u8 {
        // validate() rejects non-ASCII delimiters
        self.record_delimiter as u8
    }

    pub fn file_appendable(&self) -> bool {
        self.file_appendable.unwrap_or(self.limits().appendable)
    }

    pub fn buffer_size_records(&self) -> usize {
        self.max_buffer_size_records
            .unwrap_or(self.limits().default_buffer_size_records)
    }

    pub fn buffer_size_bytes(&self) -> usize {
        self.max_buffer_size_bytes
            .min(self.limits().max_buffer_size_bytes)
    }

    pub fn sending_threads(&self) -> usize {
        self.sending_threads
            .unwrap_or(self.limits().default_sending_threads)
    }

    pub fn min_time_between_file_polls(&self) -> Duration {
        self.min_time_between_file_polls_ms
            .map(Duration::from_millis)
            .unwrap_or(self.limits().default_min_poll)
    }

    /// Grace period for a missing final delimiter and dwell time for whole files.
    /// Never shorter than the poll interval.
    pub fn max_file_checking(&self) -> Duration {
        Duration::from_millis(self.max_file_checking_ms).max(self.min_time_between_file_polls())
    }

    pub fn tracker_refresh_interval(&self) -> Duration {
        self.max_time_between_tracker_refresh_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.max_file_checking())
    }

    pub fn max_buffer_age(&self) -> Duration {
        Duration::from_millis(self.max_buffer_age_ms)
    }

    pub fn wait_on_full_publish_queue(&self) -> Duration {
        Duration::from_millis(self.wait_on_full_publish_queue_ms)
    }

    pub fn wait_on_empty_publish_queue(&self) -> Duration {
        Duration::from_millis(self.wait_on_empty_publish_queue_ms)
    }

    pub fn retry_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_initial_backoff_ms)
    }

    pub fn retry_max_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_max_backoff_ms)
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.file_pattern.is_empty() {
            return Err("file_pattern must be specified".to_string());
        }
        if self.destination.is_empty() {
            return Err("destination must be specified".to_string());
        }
        let (dir, glob) = split_pattern(&self.file_pattern);
        if dir.as_os_str().is_empty() {
            return Err(format!(
                "file_pattern {} must include a directory",
                self.file_pattern
            ));
        }
        if let Err(e) = glob::Pattern::new(&glob) {
            return Err(format!("invalid glob {}: {}", glob, e));
        }
        if !self.record_delimiter.is_ascii() {
            return Err("record_delimiter must be a single ASCII character".to_string());
        }
        if let Some(pattern) = &self.multi_line_start_pattern {
            if let Err(e) = regex::bytes::Regex::new(pattern) {
                return Err(format!("invalid multi_line_start_pattern: {}", e));
            }
        }

        let limits = self.limits();
        let records = self.buffer_size_records();
        if records == 0 || records > limits.max_buffer_size_records {
            return Err(format!(
                "max_buffer_size_records must be within 1..={}",
                limits.max_buffer_size_records
            ));
        }
        if self.max_buffer_size_bytes == 0
            || self.max_buffer_size_bytes > limits.max_buffer_size_bytes
        {
            return Err(format!(
                "max_buffer_size_bytes must be within 1..={}",
                limits.max_buffer_size_bytes
            ));
        }
        check_range("max_buffer_age_ms", self.max_buffer_age(), MIN_BUFFER_AGE, MAX_BUFFER_AGE)?;
        check_range(
            "wait_on_full_publish_queue_ms",
            self.wait_on_full_publish_queue(),
            MIN_QUEUE_WAIT,
            MAX_QUEUE_WAIT,
        )?;
        check_range(
            "wait_on_empty_publish_queue_ms",
            self.wait_on_empty_publish_queue(),
            MIN_QUEUE_WAIT,
            MAX_QUEUE_WAIT,
        )?;
        if self.publish_queue_capacity == 0 {
            return Err("publish_queue_capacity must be positive".to_string());
        }
        if self.sending_threads() == 0 {
            return Err("sending_threads must be positive".to_string());
        }
        if self.retry_initial_backoff_ms > self.retry_max_backoff_ms {
            return Err("retry_initial_backoff_ms exceeds retry_max_backoff_ms".to_string());
        }
        if self.header_bytes == 0 {
            return Err("header_bytes must be positive".to_string());
        }

        Ok(())
    }
}

fn check_range(name: &str, value: Duration, min: Duration, max: Duration) -> Result<(), String> {
    if value < min || value > max {
        return Err(format!(
            "{} must be within {}..={} ms",
            name,
            min.as_millis(),
            max.as_millis()
        ));
    }
    Ok(())
}

fn split_pattern(pattern: &str) -> (PathBuf, String) {
    let mut pattern = pattern.to_string();
    if pattern.ends_with(MAIN_SEPARATOR) || pattern.ends_with('/') {
        pattern.push('*');
    }
    let path = Path::new(&pattern);
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let glob = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, glob)
}
