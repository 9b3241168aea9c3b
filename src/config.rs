//! Load configuration.
//!
//! The binary builds a [`PipelineConfig`] from command-line flags; library
//! callers construct one directly, usually starting from `Default`.

use crate::error::ConfigError;
use crate::writer::CopyTarget;
use serde::Serialize;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const DEFAULT_HEADER_LINE_COUNT: usize = 1;

/// What a worker does after the target rejects a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure and keep loading the remaining batches.
    #[default]
    Continue,
    /// Record the failure and cancel the run once in-flight batches finish.
    AbortOnFirstError,
}

impl FromStr for FailurePolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(FailurePolicy::Continue),
            "abort" | "abort-on-first-error" | "fail-fast" => Ok(FailurePolicy::AbortOnFirstError),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }
}

/// Handling of a quoted field still open at end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnterminatedQuotePolicy {
    /// Emit the partial row as-is and let the target reject it.
    #[default]
    Flush,
    /// Stop the scan with [`crate::CopyError::MalformedRecord`].
    Fail,
}

/// Record boundary rules for the scanner.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub row_delimiter: u8,
    pub quote: u8,
    /// Escape byte inside quoted fields; equal to `quote` for CSV-style
    /// doubled quotes.
    pub escape: u8,
    pub skip_header: bool,
    /// Number of leading rows dropped when `skip_header` is set.
    pub header_line_count: usize,
    pub unterminated_quote: UnterminatedQuotePolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            row_delimiter: b'\n',
            quote: b'"',
            escape: b'"',
            skip_header: false,
            header_line_count: DEFAULT_HEADER_LINE_COUNT,
            unterminated_quote: UnterminatedQuotePolicy::default(),
        }
    }
}

impl ScanOptions {
    /// Rows discarded before the first batch.
    pub fn rows_to_skip(&self) -> usize {
        if self.skip_header {
            self.header_line_count
        } else {
            0
        }
    }
}

/// Everything the pipeline needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub scan: ScanOptions,
    pub target: CopyTarget,
    pub batch_size: usize,
    pub workers: usize,
    /// Maximum number of batches waiting in the work queue.
    pub queue_capacity: usize,
    /// Interval between progress snapshots; zero disables periodic reports.
    pub report_period: Duration,
    pub failure_policy: FailurePolicy,
    /// Stop reading after this many rows have been batched.
    pub row_limit: Option<u64>,
    pub log_batches: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scan: ScanOptions::default(),
            target: CopyTarget::default(),
            batch_size: DEFAULT_BATCH_SIZE,
            workers: 1,
            queue_capacity: 1,
            report_period: Duration::ZERO,
            failure_policy: FailurePolicy::default(),
            row_limit: None,
            log_batches: false,
        }
    }
}

impl PipelineConfig {
    /// Config with `workers` workers and a queue sized to match.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            queue_capacity: workers.max(1),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        if self.target.table.trim().is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        if self.scan.quote == self.scan.row_delimiter || self.scan.escape == self.scan.row_delimiter
        {
            return Err(ConfigError::QuoteIsDelimiter);
        }
        Ok(())
    }
}

/// Parse a one-byte flag value. `\t` is accepted for tab.
pub fn single_byte(name: &'static str, value: &str) -> Result<u8, ConfigError> {
    match value {
        "\\t" => Ok(b'\t'),
        _ if value.len() == 1 => Ok(value.as_bytes()[0]),
        _ => Err(ConfigError::NotSingleByte {
            name,
            value: value.to_string(),
        }),
    }
}
