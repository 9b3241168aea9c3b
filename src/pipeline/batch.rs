//! Grouping of scanned rows into fixed-size batches.

use crate::scan::Row;

/// Ordered group of rows copied to the target in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    seq: u64,
    rows: Vec<Row>,
}

impl Batch {
    pub fn new(seq: u64, rows: Vec<Row>) -> Self {
        Self { seq, rows }
    }

    /// Diagnostic sequence number; batches are numbered from 1 in scan order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Payload for the bulk-copy call: every row verbatim, each followed by
    /// `delimiter`, in batch order.
    pub fn encode(&self, delimiter: u8) -> Vec<u8> {
        let size = self.rows.iter().map(|row| row.len() + 1).sum();
        let mut payload = Vec::with_capacity(size);
        for row in &self.rows {
            payload.extend_from_slice(row.as_bytes());
            payload.push(delimiter);
        }
        payload
    }
}

/// Accumulates rows until a batch is full.
///
/// Only the current partial batch is buffered.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    next_seq: u64,
    current: Vec<Row>,
}

impl Batcher {
    /// `batch_size` must be at least 1.
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            next_seq: 1,
            current: Vec::with_capacity(batch_size),
        }
    }

    /// Add a row, returning the batch it completed, if any.
    pub fn push(&mut self, row: Row) -> Option<Batch> {
        self.current.push(row);
        if self.current.len() >= self.batch_size {
            Some(self.take_batch(self.batch_size))
        } else {
            None
        }
    }

    /// Flush the trailing partial batch.
    pub fn finish(&mut self) -> Option<Batch> {
        if self.current.is_empty() {
            None
        } else {
            Some(self.take_batch(0))
        }
    }

    /// Rows held in the current partial batch.
    pub fn pending_rows(&self) -> usize {
        self.current.len()
    }

    /// Batches handed out so far.
    pub fn batches_emitted(&self) -> u64 {
        self.next_seq - 1
    }

    fn take_batch(&mut self, next_capacity: usize) -> Batch {
        let rows = std::mem::replace(&mut self.current, Vec::with_capacity(next_capacity));
        let batch = Batch::new(self.next_seq, rows);
        self.next_seq += 1;
        batch
    }
}
