//! Bounded capture of a command's output streams.

use std::collections::VecDeque;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes kept from the end of stdout once the head is full, so the session
/// trailer survives truncation of a long-running command's output.
pub const STDOUT_TAIL_BYTES: usize = 64 * 1024;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// What was kept of one stream: up to `head` from the start, the last bytes
/// in `tail` once the head filled up, and the number of bytes produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedStream {
    pub head: Vec<u8>,
    pub tail: Vec<u8>,
    pub total: usize,
}

impl CapturedStream {
    /// A stream that was kept in full.
    pub fn complete(bytes: impl Into<Vec<u8>>) -> Self {
        let head = bytes.into();
        Self {
            total: head.len(),
            head,
            tail: Vec::new(),
        }
    }

    /// No bytes were dropped between head and tail.
    pub fn is_complete(&self) -> bool {
        self.head.len() + self.tail.len() == self.total
    }

    pub fn into_bytes(self) -> Vec<u8> {
        let mut bytes = self.head;
        bytes.extend_from_slice(&self.tail);
        bytes
    }
}

/// Accumulates a stream while holding at most `head_limit + tail_limit`
/// bytes. Everything past that is counted and discarded.
#[derive(Debug)]
pub struct OutputBuffer {
    head_limit: usize,
    tail_limit: usize,
    head: Vec<u8>,
    tail: VecDeque<u8>,
    total: usize,
}

impl OutputBuffer {
    pub fn new(head_limit: usize, tail_limit: usize) -> Self {
        Self {
            head_limit,
            tail_limit,
            head: Vec::with_capacity(head_limit.min(READ_CHUNK_BYTES)),
            tail: VecDeque::new(),
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len();

        let remaining = self.head_limit.saturating_sub(self.head.len());
        let take = remaining.min(bytes.len());
        self.head.extend_from_slice(&bytes[..take]);
        let rest = &bytes[take..];
        if rest.is_empty() || self.tail_limit == 0 {
            return;
        }

        if rest.len() >= self.tail_limit {
            self.tail.clear();
            self.tail.extend(&rest[rest.len() - self.tail_limit..]);
            return;
        }
        let overflow = (self.tail.len() + rest.len()).saturating_sub(self.tail_limit);
        self.tail.drain(..overflow);
        self.tail.extend(rest);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn finish(self) -> CapturedStream {
        CapturedStream {
            head: self.head,
            tail: self.tail.into(),
            total: self.total,
        }
    }
}

/// Drains `reader` to EOF into `buffer`.
pub async fn read_bounded<R>(mut reader: R, buffer: &mut OutputBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..read]);
    }
}
