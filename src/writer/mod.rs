//! Bulk-copy writers.
//!
//! The pipeline never opens connections itself. It asks a [`WriterSource`]
//! for one [`BulkWriter`] per worker and hands each writer pre-formatted
//! delimited text, exactly as scanned.

pub mod connection;
pub mod postgres;
pub mod statement;

use std::future::Future;
use thiserror::Error;

pub use connection::parse_connection;
pub use postgres::{PgBulkWriter, PgWriterSource};
pub use statement::{CopyFormat, CopyTarget, parse_column_list, quote_identifier};

/// Why a bulk-copy call or writer setup failed.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("rejected by target: {0}")]
    Rejected(String),
    #[error("connection lost: {0}")]
    Disconnected(String),
}

impl WriteError {
    /// True when the writer can no longer be used: the connection is gone or
    /// the protocol stream is in an unknown state.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            WriteError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            WriteError::Rejected(_) => false,
            WriteError::Disconnected(_) => true,
        }
    }
}

/// One dedicated bulk-copy resource, owned by a single worker.
pub trait BulkWriter: Send + 'static {
    /// Copy `rows` (delimiter-terminated rows, already quoted) into
    /// `target`, returning the number of rows the target accepted.
    fn bulk_copy(
        &mut self,
        target: &CopyTarget,
        rows: &[u8],
    ) -> impl Future<Output = Result<u64, WriteError>> + Send;

    /// Release the resource once the worker is done with it.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized,
    {
        async {}
    }
}

/// Hands out writers, one per worker index.
pub trait WriterSource: Send + Sync + 'static {
    type Writer: BulkWriter;

    fn open_writer(
        &self,
        worker: usize,
    ) -> impl Future<Output = Result<Self::Writer, WriteError>> + Send;

    /// Runs once before any writer is opened.
    fn prepare(&self, _target: &CopyTarget) -> impl Future<Output = Result<(), WriteError>> + Send {
        async { Ok(()) }
    }
}
