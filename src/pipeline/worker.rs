//! Bulk-copy workers.
//!
//! Each worker owns one writer for its whole life and pulls batches from
//! the shared queue until it is closed and drained or the run is cancelled.
//! The row counter and the failure log are the only state workers share.

use super::batch::Batch;
use super::progress::RowCounter;
use super::queue::BatchReceiver;
use crate::config::FailurePolicy;
use crate::error::CopyError;
use crate::writer::{BulkWriter, CopyTarget, WriteError};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// A batch the target rejected.
#[derive(Debug)]
pub struct BatchFailure {
    pub batch: u64,
    pub rows: usize,
    pub worker: usize,
    pub error: WriteError,
}

/// Append-only list of batch failures.
#[derive(Debug, Default)]
pub struct FailureLog(Mutex<Vec<BatchFailure>>);

impl FailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, failure: BatchFailure) {
        self.0.lock().push(failure);
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// Remove all entries, ordered by batch sequence number.
    pub fn drain_sorted(&self) -> Vec<BatchFailure> {
        let mut failures = std::mem::take(&mut *self.0.lock());
        failures.sort_by_key(|failure| failure.batch);
        failures
    }
}

/// Per-worker totals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub batches_copied: u64,
    pub batches_failed: u64,
    pub rows_written: u64,
}

/// State shared by every worker in a run.
#[derive(Clone)]
pub struct WorkerContext {
    pub receiver: BatchReceiver,
    pub counter: Arc<RowCounter>,
    pub failures: Arc<FailureLog>,
    pub cancel: CancellationToken,
    pub policy: FailurePolicy,
    pub target: Arc<CopyTarget>,
    pub row_delimiter: u8,
    pub log_batches: bool,
}

/// Cancels the run unless the worker finishes normally, so a panicking
/// worker never leaves the producer blocked on a queue nobody drains.
struct CancelGuard(Option<CancellationToken>);

impl CancelGuard {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            if !cancel.is_cancelled() {
                log::error!("worker stopped abnormally, cancelling load");
            }
            cancel.cancel();
        }
    }
}

pub struct CopyWorker<W> {
    id: usize,
    writer: W,
    ctx: WorkerContext,
    summary: WorkerSummary,
}

impl<W: BulkWriter> CopyWorker<W> {
    pub fn new(id: usize, writer: W, ctx: WorkerContext) -> Self {
        Self {
            id,
            writer,
            ctx,
            summary: WorkerSummary {
                worker: id,
                ..WorkerSummary::default()
            },
        }
    }

    /// Copy batches until the queue is drained or the run is cancelled.
    ///
    /// A lost connection is returned as an error after the batch has been
    /// recorded in the failure log; every other write failure is recorded
    /// and handled according to the failure policy.
    pub async fn run(mut self) -> Result<WorkerSummary, CopyError> {
        log::debug!("worker {}: started", self.id);
        let guard = CancelGuard(Some(self.ctx.cancel.clone()));

        while let Some(batch) = self.ctx.receiver.recv().await {
            self.copy_batch(batch).await?;
        }

        log::debug!(
            "worker {}: finished - {} batches, {} rows, {} failed batches",
            self.id,
            self.summary.batches_copied,
            self.summary.rows_written,
            self.summary.batches_failed
        );
        let summary = self.summary;
        self.writer.close().await;
        guard.disarm();
        Ok(summary)
    }

    async fn copy_batch(&mut self, batch: Batch) -> Result<(), CopyError> {
        let payload = batch.encode(self.ctx.row_delimiter);
        let started = Instant::now();

        match self.writer.bulk_copy(&self.ctx.target, &payload).await {
            Ok(written) => {
                if written != batch.len() as u64 {
                    log::warn!(
                        "worker {}: batch {} sent {} rows but target reported {}",
                        self.id,
                        batch.seq(),
                        batch.len(),
                        written
                    );
                }
                self.ctx.counter.add(written);
                self.summary.batches_copied += 1;
                self.summary.rows_written += written;

                if self.ctx.log_batches {
                    let took = started.elapsed();
                    let rate = written as f64 / took.as_secs_f64().max(f64::EPSILON);
                    log::info!(
                        "[BATCH] took {:?}, batch size {}, row rate {:.2}/sec",
                        took,
                        batch.len(),
                        rate
                    );
                }
                Ok(())
            }
            Err(error) => {
                self.summary.batches_failed += 1;
                let lost = error.is_connection_lost();
                log::error!(
                    "worker {}: batch {} ({} rows) failed: {}",
                    self.id,
                    batch.seq(),
                    batch.len(),
                    error
                );

                if lost {
                    // The fatal error keeps the original cause; the failure
                    // log gets its text.
                    self.ctx.failures.push(BatchFailure {
                        batch: batch.seq(),
                        rows: batch.len(),
                        worker: self.id,
                        error: WriteError::Disconnected(error.to_string()),
                    });
                    self.ctx.cancel.cancel();
                    return Err(CopyError::ConnectionLost {
                        worker: self.id,
                        batch: batch.seq(),
                        source: error,
                    });
                }

                self.ctx.failures.push(BatchFailure {
                    batch: batch.seq(),
                    rows: batch.len(),
                    worker: self.id,
                    error,
                });

                if self.ctx.policy == FailurePolicy::AbortOnFirstError {
                    log::warn!(
                        "worker {}: aborting load after failure of batch {}",
                        self.id,
                        batch.seq()
                    );
                    self.ctx.cancel.cancel();
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::{BatchReceiver, work_queue};
    use crate::scan::Row;
    use crate::test_support::RecordingWriterSource;
    use crate::writer::WriterSource;

    fn batch(seq: u64, rows: &[&str]) -> Batch {
        Batch::new(
            seq,
            rows.iter().map(|r| Row::new(r.as_bytes().to_vec())).collect(),
        )
    }

    async fn run_worker(
        source: &RecordingWriterSource,
        policy: FailurePolicy,
        batches: Vec<Batch>,
    ) -> (Result<WorkerSummary, CopyError>, WorkerContext) {
        let cancel = CancellationToken::new();
        let (sender, receiver) = work_queue(batches.len().max(1), cancel.clone());
        for b in batches {
            sender.send(b).await.unwrap();
        }
        sender.close();

        let ctx = WorkerContext {
            receiver,
            counter: Arc::new(RowCounter::new()),
            failures: Arc::new(FailureLog::new()),
            cancel,
            policy,
            target: Arc::new(CopyTarget::default()),
            row_delimiter: b'\n',
            log_batches: true,
        };
        let writer = source.open_writer(0).await.unwrap();
        let result = CopyWorker::new(0, writer, ctx.clone()).run().await;
        (result, ctx)
    }

    #[tokio::test]
    async fn test_copies_batches_in_order_and_counts_rows() {
        let source = RecordingWriterSource::new();
        let (result, ctx) = run_worker(
            &source,
            FailurePolicy::Continue,
            vec![batch(1, &["1,a", "2,\"b\nc\""]), batch(2, &["3,d"])],
        )
        .await;

        let summary = result.unwrap();
        assert_eq!(summary.batches_copied, 2);
        assert_eq!(summary.rows_written, 3);
        assert_eq!(ctx.counter.get(), 3);
        assert_eq!(
            source.payloads(),
            vec![b"1,a\n2,\"b\nc\"\n".to_vec(), b"3,d\n".to_vec()]
        );
        assert_eq!(source.closed_writers(), 1);
    }

    #[tokio::test]
    async fn test_continue_policy_records_and_proceeds() {
        let source = RecordingWriterSource::new().fail_when_payload_contains("BAD");
        let (result, ctx) = run_worker(
            &source,
            FailurePolicy::Continue,
            vec![batch(1, &["1"]), batch(2, &["BAD"]), batch(3, &["3"])],
        )
        .await;

        let summary = result.unwrap();
        assert_eq!(summary.batches_copied, 2);
        assert_eq!(summary.batches_failed, 1);
        assert_eq!(ctx.counter.get(), 2);

        let failures = ctx.failures.drain_sorted();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].batch, 2);
        assert!(!ctx.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_abort_policy_cancels_run() {
        let source = RecordingWriterSource::new().fail_when_payload_contains("BAD");
        let (result, ctx) = run_worker(
            &source,
            FailurePolicy::AbortOnFirstError,
            vec![batch(1, &["BAD"]), batch(2, &["2"]), batch(3, &["3"])],
        )
        .await;

        let summary = result.unwrap();
        assert_eq!(summary.batches_copied, 0);
        assert_eq!(summary.batches_failed, 1);
        assert!(ctx.cancel.is_cancelled());
        assert_eq!(ctx.failures.len(), 1);
        assert!(source.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_connection_loss_is_fatal() {
        let source = RecordingWriterSource::new().disconnect_when_payload_contains("DROP");
        let (result, ctx) = run_worker(
            &source,
            FailurePolicy::Continue,
            vec![batch(1, &["1"]), batch(2, &["DROP"]), batch(3, &["3"])],
        )
        .await;

        match result {
            Err(CopyError::ConnectionLost { worker, batch, .. }) => {
                assert_eq!(worker, 0);
                assert_eq!(batch, 2);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(ctx.cancel.is_cancelled());
        assert_eq!(ctx.failures.len(), 1);
        assert_eq!(ctx.counter.get(), 1);
    }

    /// Fails every batch with the given error kind.
    struct BrokenWriter {
        io_kind: Option<std::io::ErrorKind>,
    }

    impl BulkWriter for BrokenWriter {
        async fn bulk_copy(
            &mut self,
            _target: &CopyTarget,
            _rows: &[u8],
        ) -> Result<u64, WriteError> {
            match self.io_kind {
                Some(kind) => Err(WriteError::Database(sqlx::Error::Io(kind.into()))),
                None => panic!("writer blew up"),
            }
        }
    }

    fn context(cancel: CancellationToken, receiver: BatchReceiver) -> WorkerContext {
        WorkerContext {
            receiver,
            counter: Arc::new(RowCounter::new()),
            failures: Arc::new(FailureLog::new()),
            cancel,
            policy: FailurePolicy::Continue,
            target: Arc::new(CopyTarget::default()),
            row_delimiter: b'\n',
            log_batches: false,
        }
    }

    #[tokio::test]
    async fn test_connection_loss_keeps_original_cause() {
        let cancel = CancellationToken::new();
        let (sender, receiver) = work_queue(1, cancel.clone());
        sender.send(batch(1, &["1"])).await.unwrap();
        sender.close();

        let ctx = context(cancel, receiver);
        let writer = BrokenWriter {
            io_kind: Some(std::io::ErrorKind::ConnectionReset),
        };
        let result = CopyWorker::new(3, writer, ctx.clone()).run().await;

        match result {
            Err(CopyError::ConnectionLost {
                worker: 3,
                batch: 1,
                source: WriteError::Database(sqlx::Error::Io(err)),
            }) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
            other => panic!("unexpected result: {other:?}"),
        }

        let failures = ctx.failures.drain_sorted();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.is_connection_lost());
    }

    #[tokio::test]
    async fn test_panicking_writer_cancels_run() {
        let cancel = CancellationToken::new();
        let (sender, receiver) = work_queue(1, cancel.clone());
        sender.send(batch(1, &["1"])).await.unwrap();

        let ctx = context(cancel.clone(), receiver);
        let handle = tokio::spawn(CopyWorker::new(0, BrokenWriter { io_kind: None }, ctx).run());

        assert!(handle.await.unwrap_err().is_panic());
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_failure_log_sorts_by_batch() {
        let log = FailureLog::new();
        for seq in [5, 2, 9] {
            log.push(BatchFailure {
                batch: seq,
                rows: 1,
                worker: 0,
                error: WriteError::Rejected("x".into()),
            });
        }
        let batches: Vec<u64> = log.drain_sorted().iter().map(|f| f.batch).collect();
        assert_eq!(batches, vec![2, 5, 9]);
        assert!(log.is_empty());
    }
}
