//! Pipeline coordination.
//!
//! Opens one writer per worker, starts the workers and the reporter, then
//! runs the scanner and batcher on the calling task, feeding the bounded
//! queue. The run always ends with a [`LoadResult`], including when it
//! fails; rows already committed are still counted.

use super::batch::{Batch, Batcher};
use super::progress::{
    LogProgressSink, ProgressReporter, ProgressSink, ProgressSnapshot, RowCounter,
};
use super::queue::{BatchSender, QueueError, SendError, work_queue};
use super::worker::{BatchFailure, CopyWorker, FailureLog, WorkerContext, WorkerSummary};
use crate::config::PipelineConfig;
use crate::error::CopyError;
use crate::scan::RowScanner;
use crate::writer::{BulkWriter, WriterSource};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running,
    Draining,
    Completed,
    Aborting,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Failed)
                | (Running, Draining)
                | (Running, Aborting)
                | (Draining, Completed)
                | (Draining, Aborting)
                | (Aborting, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Completed => "completed",
            PipelineState::Aborting => "aborting",
            PipelineState::Failed => "failed",
        }
    }
}

#[derive(Debug)]
struct StateMachine {
    state: PipelineState,
}

impl StateMachine {
    fn new() -> Self {
        Self {
            state: PipelineState::Idle,
        }
    }

    fn current(&self) -> PipelineState {
        self.state
    }

    fn advance(&mut self, next: PipelineState) {
        if self.state == next {
            return;
        }
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid pipeline transition {:?} -> {:?}",
            self.state,
            next
        );
        log::debug!("pipeline {} -> {}", self.state.as_str(), next.as_str());
        self.state = next;
    }
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct LoadResult {
    pub state: PipelineState,
    pub rows_written: u64,
    /// Rows taken from the scanner (after header skipping).
    pub rows_read: u64,
    pub batches: u64,
    /// Rows read but never handed to a writer because the run stopped:
    /// batches left in the queue, a batch refused by the queue and the
    /// unfinished partial batch.
    pub rows_discarded: u64,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    /// Rejected batches, ordered by batch sequence number.
    pub failures: Vec<BatchFailure>,
    /// The error that ended the run, if any.
    pub fatal: Option<CopyError>,
    pub workers: Vec<WorkerSummary>,
    pub final_snapshot: Option<ProgressSnapshot>,
}

impl LoadResult {
    fn empty(started_at: DateTime<Utc>) -> Self {
        Self {
            state: PipelineState::Idle,
            rows_written: 0,
            rows_read: 0,
            batches: 0,
            rows_discarded: 0,
            duration: Duration::ZERO,
            started_at,
            failures: Vec::new(),
            fatal: None,
            workers: Vec::new(),
            final_snapshot: None,
        }
    }

    /// Completed with every batch accepted.
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed && self.failures.is_empty()
    }

    /// Rows per second over the whole run.
    pub fn mean_rate(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs > 0.0 {
            self.rows_written as f64 / secs
        } else {
            0.0
        }
    }
}

enum ProducerStop {
    Fatal(CopyError),
    Queue(QueueError),
}

/// Scanner and batcher, run on the coordinator's task.
struct Producer<'a, R> {
    scanner: RowScanner<R>,
    batcher: Batcher,
    sender: &'a BatchSender,
    cancel: &'a CancellationToken,
    limit: Option<u64>,
    rows: u64,
    /// Rows in batches the queue refused.
    refused_rows: u64,
}

impl<R: AsyncBufRead + Unpin> Producer<'_, R> {
    async fn run(&mut self) -> Result<(), ProducerStop> {
        loop {
            if let Some(limit) = self.limit {
                if self.rows >= limit {
                    log::info!("row limit of {} reached, stopping read", limit);
                    break;
                }
            }
            if self.cancel.is_cancelled() {
                return Err(ProducerStop::Queue(QueueError::Cancelled));
            }

            let row = match self.scanner.next_row().await {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => return Err(ProducerStop::Fatal(err)),
            };
            self.rows += 1;

            if let Some(batch) = self.batcher.push(row) {
                self.enqueue(batch).await?;
            }
        }

        if let Some(batch) = self.batcher.finish() {
            self.enqueue(batch).await?;
        }
        Ok(())
    }

    async fn enqueue(&mut self, batch: Batch) -> Result<(), ProducerStop> {
        self.sender
            .send(batch)
            .await
            .map_err(|SendError { batch, reason }| {
                self.refused_rows += batch.len() as u64;
                ProducerStop::Queue(reason)
            })
    }

    /// Rows read that never reached the queue.
    fn unsent_rows(&self) -> u64 {
        self.refused_rows + self.batcher.pending_rows() as u64
    }
}

/// Parallel bulk loader over a [`WriterSource`].
pub struct CopyPipeline<S> {
    config: PipelineConfig,
    source: S,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
}

impl<S: WriterSource> CopyPipeline<S> {
    pub fn new(config: PipelineConfig, source: S) -> Self {
        Self {
            config,
            source,
            sink: Arc::new(LogProgressSink),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Use an externally owned token; cancelling it aborts the run the same
    /// way a fail-fast batch failure does.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Load every row of `reader` into the configured target.
    pub async fn run<R: AsyncBufRead + Unpin>(self, reader: R) -> LoadResult {
        let started = Instant::now();
        let mut result = LoadResult::empty(Utc::now());
        let mut state = StateMachine::new();

        if let Err(err) = self.startup_checks().await {
            log::error!("load not started: {}", err);
            state.advance(PipelineState::Failed);
            result.state = state.current();
            result.fatal = Some(err);
            result.duration = started.elapsed();
            return result;
        }

        let writers = match self.open_writers().await {
            Ok(writers) => writers,
            Err(err) => {
                log::error!("load not started: {}", err);
                state.advance(PipelineState::Failed);
                result.state = state.current();
                result.fatal = Some(err);
                result.duration = started.elapsed();
                return result;
            }
        };

        let config = &self.config;
        let target = Arc::new(config.target.clone());
        let counter = Arc::new(RowCounter::new());
        let failures = Arc::new(FailureLog::new());
        let cancel = self.cancel.clone();
        let (sender, receiver) = work_queue(config.queue_capacity, cancel.clone());

        state.advance(PipelineState::Running);
        log::info!(
            "loading into {} with {} worker(s), batch size {}, queue capacity {}",
            target.qualified_name(),
            config.workers,
            config.batch_size,
            config.queue_capacity
        );

        let ctx = WorkerContext {
            receiver: receiver.clone(),
            counter: counter.clone(),
            failures: failures.clone(),
            cancel: cancel.clone(),
            policy: config.failure_policy,
            target: target.clone(),
            row_delimiter: config.scan.row_delimiter,
            log_batches: config.log_batches,
        };
        let handles: Vec<JoinHandle<Result<WorkerSummary, CopyError>>> = writers
            .into_iter()
            .enumerate()
            .map(|(id, writer)| tokio::spawn(CopyWorker::new(id, writer, ctx.clone()).run()))
            .collect();
        drop(ctx);

        let reporter_done = CancellationToken::new();
        let reporter = ProgressReporter::new(
            counter.clone(),
            self.sink.clone(),
            config.report_period,
            started,
        )
        .spawn(reporter_done.clone());

        let mut producer = Producer {
            scanner: RowScanner::new(reader, &config.scan),
            batcher: Batcher::new(config.batch_size),
            sender: &sender,
            cancel: &cancel,
            limit: config.row_limit,
            rows: 0,
            refused_rows: 0,
        };
        let produced = producer.run().await;
        result.rows_read = producer.rows;
        result.batches = producer.batcher.batches_emitted();
        let unsent_rows = producer.unsent_rows();
        drop(producer);

        let mut fatal = None;
        match produced {
            Ok(()) => {
                log::debug!(
                    "input exhausted after {} rows in {} batches",
                    result.rows_read,
                    result.batches
                );
                sender.close();
                state.advance(PipelineState::Draining);
            }
            Err(ProducerStop::Fatal(err)) => {
                log::error!("stopping load: {}", err);
                fatal = Some(err);
                cancel.cancel();
                drop(sender);
                state.advance(PipelineState::Aborting);
            }
            Err(ProducerStop::Queue(err)) => {
                log::warn!("stopping read: {}", err);
                cancel.cancel();
                drop(sender);
                state.advance(PipelineState::Aborting);
            }
        }

        for (id, handle) in handles.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(summary)) => result.workers.push(summary),
                Ok(Err(err)) => record_fatal(&mut fatal, err),
                Err(join_err) => record_fatal(
                    &mut fatal,
                    CopyError::WorkerPanic {
                        worker: id,
                        message: join_err.to_string(),
                    },
                ),
            }
        }

        if cancel.is_cancelled() {
            state.advance(PipelineState::Aborting);
            if fatal.is_none() && failures.is_empty() {
                fatal = Some(CopyError::Cancelled);
            }
        }

        let (discarded_batches, queued_rows) = receiver.discard_remaining().await;
        if discarded_batches > 0 {
            log::warn!(
                "{} queued batches ({} rows) were not copied",
                discarded_batches,
                queued_rows
            );
        }
        if unsent_rows > 0 {
            log::warn!("{} rows read were never queued", unsent_rows);
        }
        let rows_discarded = queued_rows + unsent_rows;

        reporter_done.cancel();
        result.final_snapshot = reporter.await.ok();

        let terminal = if state.current() == PipelineState::Aborting {
            PipelineState::Failed
        } else {
            PipelineState::Completed
        };
        state.advance(terminal);

        result.state = state.current();
        result.rows_written = counter.get();
        result.rows_discarded = rows_discarded;
        result.failures = failures.drain_sorted();
        result.fatal = fatal;
        result.duration = started.elapsed();

        log::info!(
            "load {}: {} rows written in {:?}, {} failed batches",
            result.state.as_str(),
            result.rows_written,
            result.duration,
            result.failures.len()
        );
        result
    }

    async fn startup_checks(&self) -> Result<(), CopyError> {
        self.config.validate()?;
        self.source
            .prepare(&self.config.target)
            .await
            .map_err(CopyError::Setup)
    }

    async fn open_writers(&self) -> Result<Vec<S::Writer>, CopyError> {
        let mut writers = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            match self.source.open_writer(worker).await {
                Ok(writer) => writers.push(writer),
                Err(source) => {
                    for writer in writers {
                        writer.close().await;
                    }
                    return Err(CopyError::ResourceAcquisition { worker, source });
                }
            }
        }
        Ok(writers)
    }
}

fn record_fatal(slot: &mut Option<CopyError>, err: CopyError) {
    if slot.is_some() {
        log::error!("additional fatal error: {}", err);
    } else {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FailurePolicy, UnterminatedQuotePolicy};
    use crate::test_support::{RecordingSink, RecordingWriterSource};
    use crate::writer::{CopyTarget, WriteError};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, BufReader, ReadBuf};

    fn config(workers: usize, batch_size: usize) -> PipelineConfig {
        PipelineConfig {
            batch_size,
            ..PipelineConfig::with_workers(workers)
        }
    }

    fn numbered_rows(count: usize) -> String {
        (1..=count).map(|i| format!("{i},\"row\n{i}\"\n")).collect()
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Completed));
        assert!(Running.can_transition_to(Aborting));
        assert!(Aborting.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Completed));
        assert!(!Aborting.can_transition_to(Completed));
        assert!(Completed.is_terminal() && Failed.is_terminal());
        assert!(!Draining.is_terminal());
    }

    #[tokio::test]
    async fn test_completeness_across_workers_and_batch_sizes() {
        let input = numbered_rows(23);
        for workers in [1, 2, 5] {
            for batch_size in [1, 4, 23, 1000] {
                let source = RecordingWriterSource::new();
                let result = CopyPipeline::new(config(workers, batch_size), source.clone())
                    .run(input.as_bytes())
                    .await;

                assert_eq!(result.state, PipelineState::Completed);
                assert_eq!(result.rows_written, 23, "workers {workers} batch {batch_size}");
                assert!(result.failures.is_empty());

                let mut ids: Vec<u64> = source
                    .rows()
                    .iter()
                    .map(|row| {
                        let text = String::from_utf8_lossy(row);
                        text.split(',').next().unwrap().parse().unwrap()
                    })
                    .collect();
                ids.sort_unstable();
                assert_eq!(ids, (1..=23).collect::<Vec<u64>>());
            }
        }
    }

    #[tokio::test]
    async fn test_rows_within_batch_keep_scan_order() {
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(config(3, 5), source.clone())
            .run(numbered_rows(20).as_bytes())
            .await;
        assert!(result.is_success());

        for copy in source.copies() {
            let ids: Vec<u64> = copy
                .rows
                .iter()
                .map(|row| {
                    let text = String::from_utf8_lossy(row);
                    text.split(',').next().unwrap().parse().unwrap()
                })
                .collect();
            assert!(ids.windows(2).all(|w| w[1] == w[0] + 1), "batch out of order: {ids:?}");
        }
    }

    #[tokio::test]
    async fn test_empty_input_completes_without_rows() {
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(config(4, 10), source.clone())
            .run(&b""[..])
            .await;

        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.batches, 0);
        assert!(result.failures.is_empty());
        assert!(result.fatal.is_none());
        assert_eq!(source.closed_writers(), 4);
    }

    #[tokio::test]
    async fn test_single_failed_batch_is_isolated() {
        let source = RecordingWriterSource::new().fail_when_payload_contains("BAD");
        let input = "1\n2\nBAD\n4\n5\n6\n";
        let result = CopyPipeline::new(config(2, 2), source.clone())
            .run(input.as_bytes())
            .await;

        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(result.rows_written, 4);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].batch, 2);
        assert_eq!(result.failures[0].rows, 2);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_abort_policy_fails_run() {
        let source = RecordingWriterSource::new().fail_when_payload_contains("BAD");
        let input: String = std::iter::once("BAD\n".to_string())
            .chain((2..=200).map(|i| format!("{i}\n")))
            .collect();
        let cfg = PipelineConfig {
            failure_policy: FailurePolicy::AbortOnFirstError,
            ..config(1, 1)
        };
        let result = CopyPipeline::new(cfg, source.clone())
            .run(input.as_bytes())
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].batch, 1);
        assert!(result.fatal.is_none());
        assert!(result.rows_written < 199);
    }

    #[tokio::test]
    async fn test_writer_acquisition_failure_aborts_before_processing() {
        let source = RecordingWriterSource::new().fail_open_for_worker(1);
        let result = CopyPipeline::new(config(3, 10), source.clone())
            .run(numbered_rows(5).as_bytes())
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.rows_read, 0);
        assert!(matches!(
            result.fatal,
            Some(CopyError::ResourceAcquisition { worker: 1, .. })
        ));
        assert!(source.copies().is_empty());
        assert_eq!(source.closed_writers(), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(config(1, 0), source.clone())
            .run(numbered_rows(1).as_bytes())
            .await;
        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(result.fatal, Some(CopyError::Config(_))));
        assert_eq!(source.opened_writers(), 0);
    }

    #[tokio::test]
    async fn test_connection_loss_aborts_run() {
        let source = RecordingWriterSource::new().disconnect_when_payload_contains("DROP");
        let input: String = (1..=50)
            .map(|i| if i == 3 { "DROP\n".to_string() } else { format!("{i}\n") })
            .collect();
        let result = CopyPipeline::new(config(1, 1), source.clone())
            .run(input.as_bytes())
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(
            result.fatal,
            Some(CopyError::ConnectionLost { batch: 3, .. })
        ));
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.rows_written, 2);
    }

    #[tokio::test]
    async fn test_strict_quotes_fail_the_run() {
        let mut cfg = config(1, 100);
        cfg.scan.unterminated_quote = UnterminatedQuotePolicy::Fail;
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(cfg, source)
            .run(&b"1,a\n2,\"open"[..])
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(
            result.fatal,
            Some(CopyError::MalformedRecord { row: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_lenient_quotes_pass_partial_row_downstream() {
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(config(1, 100), source.clone())
            .run(&b"1,a\n2,\"open"[..])
            .await;

        assert_eq!(result.state, PipelineState::Completed);
        assert_eq!(source.payloads(), vec![b"1,a\n2,\"open\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_skip_header_never_reaches_writer() {
        for batch_size in [1, 2, 100] {
            let mut cfg = config(2, batch_size);
            cfg.scan.skip_header = true;
            let source = RecordingWriterSource::new();
            let result = CopyPipeline::new(cfg, source.clone())
                .run(&b"id,name\n1,a\n2,b\n3,c\n"[..])
                .await;

            assert_eq!(result.rows_written, 3);
            assert!(source.rows().iter().all(|row| row.as_slice() != b"id,name"));
        }
    }

    #[tokio::test]
    async fn test_row_limit_stops_reading() {
        let mut cfg = config(2, 3);
        cfg.row_limit = Some(7);
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(cfg, source.clone())
            .run(numbered_rows(20).as_bytes())
            .await;

        assert!(result.is_success());
        assert_eq!(result.rows_read, 7);
        assert_eq!(result.rows_written, 7);
        assert_eq!(result.batches, 3);
    }

    #[tokio::test]
    async fn test_external_cancellation() {
        let cancel = CancellationToken::new();
        let source = RecordingWriterSource::new().with_delay(Duration::from_millis(5));
        let pipeline =
            CopyPipeline::new(config(2, 1), source.clone()).with_cancellation(cancel.clone());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = pipeline.run(numbered_rows(10_000).as_bytes()).await;
        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(result.fatal, Some(CopyError::Cancelled)));
        assert!(result.rows_written < 10_000);
        assert_eq!(result.rows_written, source.rows().len() as u64);
    }

    #[tokio::test]
    async fn test_reporter_emits_final_snapshot() {
        let sink = Arc::new(RecordingSink::default());
        let mut cfg = config(2, 2);
        cfg.report_period = Duration::from_millis(1);
        let result = CopyPipeline::new(cfg, RecordingWriterSource::new())
            .with_sink(sink.clone())
            .run(numbered_rows(9).as_bytes())
            .await;

        let snapshots = sink.snapshots();
        let last = snapshots.last().copied().unwrap();
        assert!(last.is_final);
        assert_eq!(last.rows_written, 9);
        assert_eq!(result.final_snapshot, Some(last));
    }

    #[tokio::test]
    async fn test_aborted_run_accounts_for_every_row() {
        for (workers, batch_size) in [(1, 7), (2, 7), (3, 1), (2, 50)] {
            let input: String = std::iter::once("1,BAD\n".to_string())
                .chain((2..=500).map(|i| format!("{i},ok\n")))
                .collect();
            let cfg = PipelineConfig {
                failure_policy: FailurePolicy::AbortOnFirstError,
                ..config(workers, batch_size)
            };
            let source = RecordingWriterSource::new()
                .fail_when_payload_contains("BAD")
                .with_delay(Duration::from_millis(5));

            let result = CopyPipeline::new(cfg, source).run(input.as_bytes()).await;

            assert_eq!(result.state, PipelineState::Failed);
            let failed_rows: u64 = result.failures.iter().map(|f| f.rows as u64).sum();
            assert_eq!(
                result.rows_read,
                result.rows_written + failed_rows + result.rows_discarded,
                "workers {workers} batch {batch_size}: {result:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_read_failure_counts_partial_batch_as_discarded() {
        let reader = BufReader::new(tokio::io::AsyncReadExt::chain(
            &b"1\n2\n3\n"[..],
            BrokenReader,
        ));
        let result = CopyPipeline::new(config(1, 10), RecordingWriterSource::new())
            .run(reader)
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert_eq!(result.rows_read, 3);
        assert_eq!(result.rows_written, 0);
        assert_eq!(result.rows_discarded, 3);
    }

    /// Writer whose every copy panics.
    struct PanickingSource;

    struct PanickingWriter;

    impl WriterSource for PanickingSource {
        type Writer = PanickingWriter;

        async fn open_writer(&self, _worker: usize) -> Result<PanickingWriter, WriteError> {
            Ok(PanickingWriter)
        }
    }

    impl BulkWriter for PanickingWriter {
        async fn bulk_copy(
            &mut self,
            _target: &CopyTarget,
            _rows: &[u8],
        ) -> Result<u64, WriteError> {
            panic!("copy exploded");
        }
    }

    #[tokio::test]
    async fn test_worker_panic_fails_run_instead_of_hanging() {
        let input: String = (1..=100).map(|i| format!("{i}\n")).collect();
        let run = CopyPipeline::new(config(1, 1), PanickingSource).run(input.as_bytes());

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("pipeline finished");

        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(
            result.fatal,
            Some(CopyError::WorkerPanic { worker: 0, .. })
        ));
        assert_eq!(result.rows_written, 0);
        // Only the batch held by the panicking worker is unaccounted for.
        assert_eq!(result.rows_read, result.rows_discarded + 1);
    }

    struct BrokenReader;

    impl AsyncRead for BrokenReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("disk on fire")))
        }
    }

    #[tokio::test]
    async fn test_read_failure_fails_run() {
        let source = RecordingWriterSource::new();
        let result = CopyPipeline::new(config(2, 10), source.clone())
            .run(BufReader::new(BrokenReader))
            .await;

        assert_eq!(result.state, PipelineState::Failed);
        assert!(matches!(result.fatal, Some(CopyError::StreamRead(_))));
        assert_eq!(result.rows_written, 0);
    }
}
