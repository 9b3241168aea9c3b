//! Record boundary scanning.
//!
//! Splits a delimited-text byte stream into logical rows. A row ends at a
//! row delimiter that is not inside a quoted field, so a single record may
//! span several physical lines. Row bytes are kept exactly as read; the
//! scanner never unescapes or re-quotes anything.

use crate::config::{ScanOptions, UnterminatedQuotePolicy};
use crate::error::CopyError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// One logical record, without its terminating delimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row(Box<[u8]>);

impl Row {
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuoteState {
    Unquoted,
    Quoted,
    /// A quote was seen inside a quoted field: either the field is closing
    /// or the next byte is a second quote and the pair is a literal.
    QuoteInQuoted,
    /// The escape byte was seen inside a quoted field; the next byte is
    /// literal. Only reachable when escape differs from quote.
    Escaped,
}

/// Quote/escape automaton over single bytes.
#[derive(Debug)]
struct BoundaryAutomaton {
    state: QuoteState,
    quote: u8,
    escape: u8,
    delimiter: u8,
    quote_opened_at: u64,
}

impl BoundaryAutomaton {
    fn new(options: &ScanOptions) -> Self {
        Self {
            state: QuoteState::Unquoted,
            quote: options.quote,
            escape: options.escape,
            delimiter: options.row_delimiter,
            quote_opened_at: 0,
        }
    }

    /// Advance over `byte` found at stream offset `pos`. Returns `true` when
    /// the byte terminates the current row.
    fn step(&mut self, byte: u8, pos: u64) -> bool {
        let (next, ends_row) = match self.state {
            QuoteState::Unquoted => {
                if byte == self.delimiter {
                    (QuoteState::Unquoted, true)
                } else if byte == self.quote {
                    self.quote_opened_at = pos;
                    (QuoteState::Quoted, false)
                } else {
                    (QuoteState::Unquoted, false)
                }
            }
            QuoteState::Quoted => {
                if byte == self.quote {
                    (QuoteState::QuoteInQuoted, false)
                } else if byte == self.escape {
                    (QuoteState::Escaped, false)
                } else {
                    (QuoteState::Quoted, false)
                }
            }
            QuoteState::QuoteInQuoted => {
                if byte == self.quote {
                    (QuoteState::Quoted, false)
                } else if byte == self.delimiter {
                    (QuoteState::Unquoted, true)
                } else {
                    (QuoteState::Unquoted, false)
                }
            }
            QuoteState::Escaped => (QuoteState::Quoted, false),
        };
        self.state = next;
        ends_row
    }

    fn inside_quotes(&self) -> bool {
        matches!(self.state, QuoteState::Quoted | QuoteState::Escaped)
    }
}

/// Bytes of the row currently being assembled plus the automaton state.
#[derive(Debug)]
struct PendingRow {
    automaton: BoundaryAutomaton,
    bytes: Vec<u8>,
    offset: u64,
}

impl PendingRow {
    /// Consume bytes from `buf` up to and including the next row delimiter.
    /// Returns the number of bytes consumed and the completed row, if any.
    fn feed(&mut self, buf: &[u8]) -> (usize, Option<Vec<u8>>) {
        for (i, &byte) in buf.iter().enumerate() {
            if self.automaton.step(byte, self.offset + i as u64) {
                self.bytes.extend_from_slice(&buf[..i]);
                self.offset += i as u64 + 1;
                return (i + 1, Some(std::mem::take(&mut self.bytes)));
            }
        }
        self.bytes.extend_from_slice(buf);
        self.offset += buf.len() as u64;
        (buf.len(), None)
    }
}

/// Lazy, finite, non-restartable source of [`Row`]s.
pub struct RowScanner<R> {
    reader: R,
    pending: PendingRow,
    unterminated_quote: UnterminatedQuotePolicy,
    rows_to_skip: usize,
    rows_seen: u64,
    finished: bool,
}

impl<R: AsyncBufRead + Unpin> RowScanner<R> {
    pub fn new(reader: R, options: &ScanOptions) -> Self {
        Self {
            reader,
            pending: PendingRow {
                automaton: BoundaryAutomaton::new(options),
                bytes: Vec::new(),
                offset: 0,
            },
            unterminated_quote: options.unterminated_quote,
            rows_to_skip: options.rows_to_skip(),
            rows_seen: 0,
            finished: false,
        }
    }

    /// Logical rows read so far, header rows included.
    pub fn rows_seen(&self) -> u64 {
        self.rows_seen
    }

    /// Bytes consumed from the reader so far.
    pub fn bytes_read(&self) -> u64 {
        self.pending.offset
    }

    /// Next row after header skipping, or `None` at end of input.
    ///
    /// Read errors are fatal; once an error or end of input is returned the
    /// scanner yields `None` forever.
    pub async fn next_row(&mut self) -> Result<Option<Row>, CopyError> {
        loop {
            let Some(row) = self.next_logical_row().await? else {
                return Ok(None);
            };
            if self.rows_to_skip > 0 {
                self.rows_to_skip -= 1;
                log::debug!("skipping header row {}", self.rows_seen);
                continue;
            }
            return Ok(Some(row));
        }
    }

    async fn next_logical_row(&mut self) -> Result<Option<Row>, CopyError> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let buf = match self.reader.fill_buf().await {
                Ok(buf) => buf,
                Err(err) => {
                    self.finished = true;
                    return Err(CopyError::StreamRead(err));
                }
            };

            if buf.is_empty() {
                self.finished = true;
                return self.finish_at_eof();
            }

            let (consumed, row) = self.pending.feed(buf);
            self.reader.consume(consumed);

            if let Some(bytes) = row {
                self.rows_seen += 1;
                return Ok(Some(Row::new(bytes)));
            }
        }
    }

    fn finish_at_eof(&mut self) -> Result<Option<Row>, CopyError> {
        if self.pending.automaton.inside_quotes() {
            let row = self.rows_seen + 1;
            let offset = self.pending.automaton.quote_opened_at;
            match self.unterminated_quote {
                UnterminatedQuotePolicy::Fail => {
                    return Err(CopyError::MalformedRecord { row, offset });
                }
                UnterminatedQuotePolicy::Flush => {
                    log::warn!(
                        "row {} ends inside a quoted field opened at byte {}; passing it through",
                        row,
                        offset
                    );
                }
            }
        }

        if self.pending.bytes.is_empty() {
            return Ok(None);
        }

        self.rows_seen += 1;
        Ok(Some(Row::new(std::mem::take(&mut self.pending.bytes))))
    }
}
