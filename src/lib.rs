//! Parallel bulk loading of delimited text into PostgreSQL.
//!
//! Input is scanned into logical rows (quoted fields may span lines),
//! grouped into fixed-size batches and copied by a pool of workers, each
//! holding its own `COPY FROM STDIN` connection. See [`CopyPipeline`].

pub mod config;
pub mod error;
pub mod input;
pub mod pipeline;
pub mod scan;
pub mod summary;
pub mod writer;

pub use config::{FailurePolicy, PipelineConfig, ScanOptions, UnterminatedQuotePolicy};
pub use error::{ConfigError, CopyError};
pub use pipeline::{CopyPipeline, LoadResult, PipelineState, ProgressSink, ProgressSnapshot};
pub use scan::{Row, RowScanner};
pub use summary::LoadSummary;
pub use writer::{BulkWriter, CopyTarget, PgWriterSource, WriteError, WriterSource};

use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

/// Install the global logger. `RUST_LOG` overrides the default filter.
pub fn init_logger(verbose: bool) {
    LOGGER.call_once(|| {
        let default_filter = if verbose {
            "debug,sqlx=warn"
        } else {
            "info,sqlx=warn"
        };
        env_logger::Builder::from_env(Env::default().default_filter_or(default_filter))
            .format_timestamp_millis()
            .init();
    });
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use crate::config::ScanOptions;
    use crate::pipeline::{ProgressSink, ProgressSnapshot};
    use crate::scan::RowScanner;
    use crate::writer::{BulkWriter, CopyTarget, WriteError, WriterSource};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    pub use database::{TestDatabase, TestDatabaseError};

    /// One successful bulk-copy call seen by a [`RecordingWriter`].
    #[derive(Debug, Clone)]
    pub struct RecordedCopy {
        pub worker: usize,
        pub payload: Vec<u8>,
        /// The payload split back into rows.
        pub rows: Vec<Vec<u8>>,
    }

    #[derive(Debug, Default)]
    struct Recording {
        copies: Mutex<Vec<RecordedCopy>>,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    /// In-memory writer source that records every accepted payload.
    ///
    /// Failures are triggered by marker strings inside a payload so tests can
    /// pick which batch fails without caring which worker receives it.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingWriterSource {
        recording: Arc<Recording>,
        fail_marker: Option<String>,
        disconnect_marker: Option<String>,
        fail_open_for: Option<usize>,
        delay: Duration,
        scan: ScanOptions,
    }

    impl RecordingWriterSource {
        pub fn new() -> Self {
            Self::default()
        }

        /// Reject any payload containing `marker`.
        pub fn fail_when_payload_contains(mut self, marker: &str) -> Self {
            self.fail_marker = Some(marker.to_string());
            self
        }

        /// Report a lost connection for any payload containing `marker`.
        pub fn disconnect_when_payload_contains(mut self, marker: &str) -> Self {
            self.disconnect_marker = Some(marker.to_string());
            self
        }

        /// Refuse to open the writer for `worker`.
        pub fn fail_open_for_worker(mut self, worker: usize) -> Self {
            self.fail_open_for = Some(worker);
            self
        }

        /// Sleep this long inside every bulk-copy call.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        /// Rules used to split payloads back into rows.
        pub fn with_scan_options(mut self, scan: ScanOptions) -> Self {
            self.scan = scan;
            self
        }

        pub fn copies(&self) -> Vec<RecordedCopy> {
            self.recording.copies.lock().clone()
        }

        pub fn payloads(&self) -> Vec<Vec<u8>> {
            self.copies().into_iter().map(|copy| copy.payload).collect()
        }

        pub fn rows(&self) -> Vec<Vec<u8>> {
            self.copies().into_iter().flat_map(|copy| copy.rows).collect()
        }

        pub fn opened_writers(&self) -> usize {
            self.recording.opened.load(Ordering::SeqCst)
        }

        pub fn closed_writers(&self) -> usize {
            self.recording.closed.load(Ordering::SeqCst)
        }
    }

    impl WriterSource for RecordingWriterSource {
        type Writer = RecordingWriter;

        async fn open_writer(&self, worker: usize) -> Result<RecordingWriter, WriteError> {
            if self.fail_open_for == Some(worker) {
                return Err(WriteError::Disconnected(format!(
                    "no connection for worker {worker}"
                )));
            }
            self.recording.opened.fetch_add(1, Ordering::SeqCst);
            Ok(RecordingWriter {
                worker,
                source: self.clone(),
            })
        }
    }

    #[derive(Debug)]
    pub struct RecordingWriter {
        worker: usize,
        source: RecordingWriterSource,
    }

    impl BulkWriter for RecordingWriter {
        async fn bulk_copy(
            &mut self,
            _target: &CopyTarget,
            rows: &[u8],
        ) -> Result<u64, WriteError> {
            if !self.source.delay.is_zero() {
                tokio::time::sleep(self.source.delay).await;
            }
            if contains(rows, self.source.disconnect_marker.as_deref()) {
                return Err(WriteError::Disconnected("server closed the connection".into()));
            }
            if contains(rows, self.source.fail_marker.as_deref()) {
                return Err(WriteError::Rejected("invalid input syntax".into()));
            }

            let mut scanner = RowScanner::new(rows, &self.source.scan);
            let mut split = Vec::new();
            while let Some(row) = scanner
                .next_row()
                .await
                .map_err(|err| WriteError::Rejected(err.to_string()))?
            {
                split.push(row.as_bytes().to_vec());
            }

            let written = split.len() as u64;
            self.source.recording.copies.lock().push(RecordedCopy {
                worker: self.worker,
                payload: rows.to_vec(),
                rows: split,
            });
            Ok(written)
        }

        async fn close(self) {
            self.source.recording.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn contains(haystack: &[u8], marker: Option<&str>) -> bool {
        match marker {
            Some(marker) if !marker.is_empty() => haystack
                .windows(marker.len())
                .any(|window| window == marker.as_bytes()),
            _ => false,
        }
    }

    /// Progress sink that keeps every snapshot.
    #[derive(Debug, Default)]
    pub struct RecordingSink(Mutex<Vec<ProgressSnapshot>>);

    impl RecordingSink {
        pub fn snapshots(&self) -> Vec<ProgressSnapshot> {
            self.0.lock().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn report(&self, snapshot: &ProgressSnapshot) {
            self.0.lock().push(*snapshot);
        }
    }

    pub mod database {
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgConnection};
        use sqlx::{ConnectOptions, Connection};
        use testcontainers::core::error::TestcontainersError;
        use testcontainers_modules::postgres::Postgres;
        use testcontainers_modules::testcontainers::{ContainerAsync, runners::AsyncRunner};
        use thiserror::Error;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Disposable Postgres container for integration tests.
        pub struct TestDatabase {
            url: String,
            options: PgConnectOptions,
            _container: ContainerAsync<Postgres>,
        }

        impl TestDatabase {
            pub async fn new() -> Result<Self, TestDatabaseError> {
                let container = Postgres::default().start().await?;

                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

                let options: PgConnectOptions = url.parse()?;
                let options = options.log_statements(LevelFilter::Off);

                // The container may accept TCP before the server is ready.
                let mut attempts = 0;
                loop {
                    match options.connect().await {
                        Ok(conn) => {
                            conn.close().await?;
                            break;
                        }
                        Err(_) if attempts < 20 => {
                            attempts += 1;
                            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }

                Ok(Self {
                    url,
                    options,
                    _container: container,
                })
            }

            pub fn url(&self) -> &str {
                &self.url
            }

            pub fn connect_options(&self) -> PgConnectOptions {
                self.options.clone()
            }

            pub async fn connect(&self) -> Result<PgConnection, TestDatabaseError> {
                Ok(self.options.connect().await?)
            }

            /// Run a single statement on a fresh connection.
            pub async fn execute(&self, sql: &str) -> Result<(), TestDatabaseError> {
                let mut conn = self.connect().await?;
                sqlx::query(sql).execute(&mut conn).await?;
                conn.close().await?;
                Ok(())
            }

            pub async fn count_rows(&self, table: &str) -> Result<i64, TestDatabaseError> {
                let mut conn = self.connect().await?;
                let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                    .fetch_one(&mut conn)
                    .await?;
                conn.close().await?;
                Ok(count)
            }
        }
    }
}
