//! End-of-run summary for the command-line tool.

use crate::pipeline::{LoadResult, PipelineState, WorkerSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureSummary {
    pub batch: u64,
    pub rows: usize,
    pub worker: usize,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FatalSummary {
    pub kind: &'static str,
    pub message: String,
}

/// Serializable view of a [`LoadResult`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadSummary {
    pub state: PipelineState,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub workers: usize,
    pub rows_read: u64,
    pub rows_written: u64,
    pub rows_discarded: u64,
    pub batches: u64,
    pub mean_rate: f64,
    pub failed_batches: Vec<FailureSummary>,
    pub fatal: Option<FatalSummary>,
    pub per_worker: Vec<WorkerSummary>,
}

impl LoadSummary {
    pub fn from_result(result: &LoadResult, workers: usize) -> Self {
        Self {
            state: result.state,
            started_at: result.started_at,
            duration_secs: result.duration.as_secs_f64(),
            workers,
            rows_read: result.rows_read,
            rows_written: result.rows_written,
            rows_discarded: result.rows_discarded,
            batches: result.batches,
            mean_rate: result.mean_rate(),
            failed_batches: result
                .failures
                .iter()
                .map(|failure| FailureSummary {
                    batch: failure.batch,
                    rows: failure.rows,
                    worker: failure.worker,
                    error: failure.error.to_string(),
                })
                .collect(),
            fatal: result.fatal.as_ref().map(|err| FatalSummary {
                kind: err.kind(),
                message: err.to_string(),
            }),
            per_worker: result.workers.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Completed && self.failed_batches.is_empty()
    }

    pub fn render_text(&self) -> String {
        let mut out = format!(
            "COPY {}, took {:.3}s with {} worker(s) (mean rate {:.2}/sec)",
            self.rows_written, self.duration_secs, self.workers, self.mean_rate
        );
        for failure in &self.failed_batches {
            let _ = write!(
                out,
                "\nbatch {} ({} rows, worker {}) failed: {}",
                failure.batch, failure.rows, failure.worker, failure.error
            );
        }
        if self.rows_discarded > 0 {
            let _ = write!(out, "\n{} rows read were not copied", self.rows_discarded);
        }
        if let Some(fatal) = &self.fatal {
            let _ = write!(
                out,
                "\nload {} ({}): {}",
                self.state.as_str(),
                fatal.kind,
                fatal.message
            );
        }
        out
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
