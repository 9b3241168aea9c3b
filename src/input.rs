//! Input stream selection.

use std::io;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, BufReader};

/// Read buffer size; large enough that a typical batch needs few refills.
pub const READ_BUFFER_SIZE: usize = 1 << 20;

pub type InputStream = Box<dyn AsyncBufRead + Send + Unpin>;

/// Open `path`, or standard input when no path is given.
pub async fn open_input(path: Option<&Path>) -> io::Result<InputStream> {
    match path {
        Some(path) => {
            let file = File::open(path).await.map_err(|err| {
                io::Error::new(err.kind(), format!("{}: {}", path.display(), err))
            })?;
            log::debug!("reading from {}", path.display());
            Ok(Box::new(BufReader::with_capacity(READ_BUFFER_SIZE, file)))
        }
        None => {
            log::debug!("reading from stdin");
            Ok(Box::new(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                tokio::io::stdin(),
            )))
        }
    }
}
