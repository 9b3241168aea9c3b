use crate::writer::WriteError;
use std::io;
use thiserror::Error;

/// Errors that end a load run.
///
/// Per-batch rejections are not represented here; they are collected as
/// [`crate::pipeline::BatchFailure`] entries and only become fatal when they
/// indicate the writer's connection is gone.
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("failed to read input: {0}")]
    StreamRead(#[from] io::Error),
    #[error("unterminated quoted field in row {row} (quote opened at byte {offset})")]
    MalformedRecord { row: u64, offset: u64 },
    #[error("worker {worker} could not open a writer: {source}")]
    ResourceAcquisition {
        worker: usize,
        #[source]
        source: WriteError,
    },
    #[error("worker {worker} lost its connection while writing batch {batch}: {source}")]
    ConnectionLost {
        worker: usize,
        batch: u64,
        #[source]
        source: WriteError,
    },
    #[error("failed to prepare target: {0}")]
    Setup(#[source] WriteError),
    #[error("worker {worker} panicked: {message}")]
    WorkerPanic { worker: usize, message: String },
    #[error("load cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

impl CopyError {
    /// Short category name used in summaries and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CopyError::StreamRead(_) => "StreamReadFailure",
            CopyError::MalformedRecord { .. } => "MalformedRecordFailure",
            CopyError::ResourceAcquisition { .. }
            | CopyError::ConnectionLost { .. }
            | CopyError::Setup(_) => "ResourceAcquisitionFailure",
            CopyError::WorkerPanic { .. } => "WorkerPanic",
            CopyError::Cancelled => "Cancelled",
            CopyError::Config(_) => "ConfigError",
        }
    }
}

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("worker count must be at least 1")]
    ZeroWorkers,
    #[error("queue capacity must be at least 1")]
    ZeroQueueCapacity,
    #[error("table name must not be empty")]
    EmptyTable,
    #[error("{name} must be a single byte, got {value:?}")]
    NotSingleByte { name: &'static str, value: String },
    #[error("quote and row delimiter must differ")]
    QuoteIsDelimiter,
    #[error("unknown failure policy {0:?} (expected `continue` or `abort`)")]
    UnknownPolicy(String),
    #[error("invalid connection string: {0}")]
    Connection(String),
}
