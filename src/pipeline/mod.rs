//! The load pipeline: scanner, batcher, bounded queue, workers and reporter.
//!
//! ```text
//! input -> RowScanner -> Batcher -> work queue -> CopyWorker (xN) -> BulkWriter
//!                                                      |
//!                                                  RowCounter -> ProgressReporter
//! ```
//!
//! The producer (scanner and batcher) runs on the coordinator's task; each
//! worker is a separate tokio task owning one writer.

pub mod batch;
pub mod coordinator;
pub mod progress;
pub mod queue;
pub mod worker;

pub use batch::{Batch, Batcher};
pub use coordinator::{CopyPipeline, LoadResult, PipelineState};
pub use progress::{LogProgressSink, ProgressReporter, ProgressSink, ProgressSnapshot, RowCounter};
pub use queue::{BatchReceiver, BatchSender, QueueError, SendError, work_queue};
pub use worker::{BatchFailure, CopyWorker, FailureLog, WorkerContext, WorkerSummary};
