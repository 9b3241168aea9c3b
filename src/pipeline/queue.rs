//! Bounded batch queue between the producer and the workers.
//!
//! A full queue suspends the producer; that is the only flow control in the
//! pipeline. Both ends observe the run's cancellation token.

use super::batch::Batch;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("load cancelled")]
    Cancelled,
    #[error("all workers have exited")]
    Closed,
}

/// A batch the queue refused. The batch is handed back so its rows can be
/// accounted for.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("batch {} not queued: {reason}", batch.seq())]
pub struct SendError {
    pub batch: Batch,
    pub reason: QueueError,
}

/// Create a queue holding at most `capacity` batches.
pub fn work_queue(capacity: usize, cancel: CancellationToken) -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sender = BatchSender {
        tx,
        cancel: cancel.clone(),
    };
    let receiver = BatchReceiver {
        rx: Arc::new(Mutex::new(rx)),
        cancel,
    };
    (sender, receiver)
}

/// Producer end. Dropping it (or calling [`BatchSender::close`]) tells the
/// workers no more batches are coming.
#[derive(Debug)]
pub struct BatchSender {
    tx: mpsc::Sender<Batch>,
    cancel: CancellationToken,
}

impl BatchSender {
    /// Enqueue `batch`, waiting for free space. Returns early if the run is
    /// cancelled; the batch then comes back inside the error.
    pub async fn send(&self, batch: Batch) -> Result<(), SendError> {
        let reserved = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(QueueError::Cancelled),
            permit = self.tx.reserve() => permit.map_err(|_| QueueError::Closed),
        };
        match reserved {
            Ok(permit) => {
                permit.send(batch);
                Ok(())
            }
            Err(reason) => Err(SendError { batch, reason }),
        }
    }

    /// Batches currently waiting in the queue.
    pub fn buffered(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn close(self) {
        log::debug!("work queue closed with {} batches pending", self.buffered());
    }
}

/// Consumer end, shared by all workers. Each batch is delivered to exactly
/// one caller of [`BatchReceiver::recv`].
#[derive(Debug, Clone)]
pub struct BatchReceiver {
    rx: Arc<Mutex<mpsc::Receiver<Batch>>>,
    cancel: CancellationToken,
}

impl BatchReceiver {
    /// Next batch, or `None` once the queue is closed and drained or the run
    /// is cancelled.
    pub async fn recv(&self) -> Option<Batch> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let mut rx = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return None,
            guard = self.rx.lock() => guard,
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            batch = rx.recv() => batch,
        }
    }

    /// Drop whatever is still queued, returning `(batches, rows)` discarded.
    /// Used after cancellation to account for work that never ran.
    pub async fn discard_remaining(&self) -> (u64, u64) {
        let mut rx = self.rx.lock().await;
        rx.close();
        let mut batches = 0;
        let mut rows = 0;
        while let Ok(batch) = rx.try_recv() {
            batches += 1;
            rows += batch.len() as u64;
        }
        (batches, rows)
    }
}
