//! PostgreSQL `COPY ... FROM STDIN` writer.

use super::{BulkWriter, CopyTarget, WriteError, WriterSource};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};

/// Opens one dedicated connection per worker.
#[derive(Debug, Clone)]
pub struct PgWriterSource {
    options: PgConnectOptions,
    truncate: bool,
}

impl PgWriterSource {
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options,
            truncate: false,
        }
    }

    /// Empty the target table before loading.
    pub fn with_truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }
}

impl WriterSource for PgWriterSource {
    type Writer = PgBulkWriter;

    async fn open_writer(&self, worker: usize) -> Result<PgBulkWriter, WriteError> {
        let conn = self.options.connect().await?;
        log::debug!("worker {}: connection established", worker);
        Ok(PgBulkWriter { conn, worker })
    }

    async fn prepare(&self, target: &CopyTarget) -> Result<(), WriteError> {
        if !self.truncate {
            return Ok(());
        }

        let statement = target.truncate_statement();
        log::info!("truncating {}", target.qualified_name());

        let mut conn = self.options.connect().await?;
        sqlx::query(&statement).execute(&mut conn).await?;
        conn.close().await?;

        Ok(())
    }
}

/// A single connection streaming batches with `COPY FROM STDIN`.
#[derive(Debug)]
pub struct PgBulkWriter {
    conn: PgConnection,
    worker: usize,
}

impl BulkWriter for PgBulkWriter {
    async fn bulk_copy(&mut self, target: &CopyTarget, rows: &[u8]) -> Result<u64, WriteError> {
        let statement = target.copy_statement();
        let mut copy = self.conn.copy_in_raw(&statement).await?;

        // An unfinished COPY must be aborted so the connection returns to
        // the ready state for the next batch.
        let sent = copy.send(rows).await.map(|_| ());
        if let Err(err) = sent {
            if let Err(abort_err) = copy.abort(err.to_string()).await {
                log::debug!("worker {}: COPY abort failed: {}", self.worker, abort_err);
            }
            return Err(err.into());
        }

        let written = copy.finish().await?;
        Ok(written)
    }

    async fn close(self) {
        if let Err(err) = self.conn.close().await {
            log::debug!("worker {}: error closing connection: {}", self.worker, err);
        }
    }
}
