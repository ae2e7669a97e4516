//! Payload file abstraction
//!
//! The range server only ever sees one file through [`PayloadSource`]. The
//! swarm engine implements it for real transfers; tests implement it over
//! in-memory buffers.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

/// Byte stream produced by [`PayloadSource::open_read_stream`]
pub type PayloadReader = Pin<Box<dyn AsyncRead + Send>>;

/// The single file served by the range server
///
/// `downloaded_contiguous_length` never decreases and never exceeds `length`.
/// It is a planning hint, not a promise: readers still park on bytes the
/// engine has not verified yet.
#[async_trait]
pub trait PayloadSource: Send + Sync + 'static {
    /// File name within the transfer (used for the content type)
    fn name(&self) -> &str;

    /// Total length in bytes
    fn length(&self) -> u64;

    /// How far into the file the engine reports progress
    ///
    /// A strict prefix for in-memory sources. Swarm engines that track
    /// verified bytes per file return that count, which may include pieces
    /// past a gap; the range planner only uses it to pick between a bounded
    /// span and an open-ended waiting one.
    fn downloaded_contiguous_length(&self) -> u64;

    /// Whether every byte of the file has arrived
    fn is_complete(&self) -> bool {
        self.downloaded_contiguous_length() >= self.length()
    }

    /// Open a reader over `start..=end` (or `start..` when `end` is `None`).
    ///
    /// The reader may park until the transfer engine delivers the bytes; it
    /// must yield them in order.
    async fn open_read_stream(&self, start: u64, end: Option<u64>) -> io::Result<PayloadReader>;
}

/// A file entry as announced by swarm metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadCandidate {
    pub name: String,
    pub length: u64,
}

/// Pick the file to stream: the largest one, first wins on ties.
///
/// Returns `None` while metadata lists no files.
pub fn select_payload(files: &[PayloadCandidate]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (idx, file) in files.iter().enumerate() {
        match best {
            Some(b) if files[b].length >= file.length => {}
            _ => best = Some(idx),
        }
    }
    best
}
