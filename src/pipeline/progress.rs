//! Throughput reporting.
//!
//! Workers bump a shared [`RowCounter`]; the reporter task only reads it, so
//! a slow sink can never hold up a worker.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Rows committed to the target so far. Never decreases.
#[derive(Debug, Default)]
pub struct RowCounter(AtomicU64);

impl RowCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, rows: u64) {
        self.0.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter sample taken by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub rows_written: u64,
    pub elapsed: Duration,
    /// Rows written since the previous snapshot.
    pub period_rows: u64,
    pub period: Duration,
    pub is_final: bool,
}

impl ProgressSnapshot {
    /// Rows per second since the load started.
    pub fn overall_rate(&self) -> f64 {
        rate(self.rows_written, self.elapsed)
    }

    /// Rows per second since the previous snapshot.
    pub fn period_rate(&self) -> f64 {
        rate(self.period_rows, self.period)
    }
}

fn rate(rows: u64, over: Duration) -> f64 {
    let secs = over.as_secs_f64();
    if secs > 0.0 { rows as f64 / secs } else { 0.0 }
}

/// Destination for progress snapshots. Implementations must return quickly.
pub trait ProgressSink: Send + Sync {
    fn report(&self, snapshot: &ProgressSnapshot);
}

/// Writes snapshots to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn report(&self, snapshot: &ProgressSnapshot) {
        if snapshot.is_final {
            log::debug!(
                "final: {} rows in {:?} ({:.2} rows/sec)",
                snapshot.rows_written,
                snapshot.elapsed,
                snapshot.overall_rate()
            );
        } else {
            log::info!(
                "at {:?}, row rate {:.2}/sec (period), row rate {:.2}/sec (overall), {} total rows",
                snapshot.elapsed,
                snapshot.period_rate(),
                snapshot.overall_rate(),
                snapshot.rows_written
            );
        }
    }
}

/// Periodic sampler of a [`RowCounter`].
pub struct ProgressReporter {
    counter: Arc<RowCounter>,
    sink: Arc<dyn ProgressSink>,
    period: Duration,
    started: Instant,
    last_rows: u64,
    last_at: Instant,
}

impl ProgressReporter {
    pub fn new(
        counter: Arc<RowCounter>,
        sink: Arc<dyn ProgressSink>,
        period: Duration,
        started: Instant,
    ) -> Self {
        Self {
            counter,
            sink,
            period,
            started,
            last_rows: 0,
            last_at: started,
        }
    }

    /// Run until `done` is cancelled, then emit and return the final
    /// snapshot.
    pub fn spawn(self, done: CancellationToken) -> JoinHandle<ProgressSnapshot> {
        tokio::spawn(self.run(done))
    }

    async fn run(mut self, done: CancellationToken) -> ProgressSnapshot {
        if self.period.is_zero() {
            done.cancelled().await;
        } else {
            let mut ticker = tokio::time::interval_at(self.started + self.period, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = done.cancelled() => break,
                    _ = ticker.tick() => {
                        let snapshot = self.sample(false);
                        self.sink.report(&snapshot);
                    }
                }
            }
        }

        let snapshot = self.sample(true);
        self.sink.report(&snapshot);
        snapshot
    }

    fn sample(&mut self, is_final: bool) -> ProgressSnapshot {
        let now = Instant::now();
        let rows_written = self.counter.get();
        let snapshot = ProgressSnapshot {
            rows_written,
            elapsed: now - self.started,
            period_rows: rows_written.saturating_sub(self.last_rows),
            period: now - self.last_at,
            is_final,
        };
        self.last_rows = rows_written;
        self.last_at = now;
        snapshot
    }
}
