//! NDJSON (newline-delimited JSON) stream buffering
//!
//! Ollama streams generations as one JSON object per line. Network chunks don't respect those
//! lines: a single object can be split across several reads, or several objects can arrive in one.
//! This wrapper accumulates bytes and only yields whole lines.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Longest line accepted from the upstream. Ollama's final frame carries the token context, which
/// stays well below this even for large context windows.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum NdjsonError<E> {
    #[error("{0}")]
    Body(E),

    #[error("line exceeds {limit} bytes")]
    LineTooLong { limit: usize },
}

/// A stream wrapper that yields complete lines, without their terminating `\n`.
///
/// Blank lines are skipped. A trailing line without a newline is flushed when the inner stream
/// ends. A line longer than the limit ends the stream with [`NdjsonError::LineTooLong`].
pub struct NdjsonBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
    /// Bytes at the front of `buffer` already known to hold no newline.
    scanned: usize,
    max_line_bytes: usize,
    finished: bool,
}

impl<S> NdjsonBufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self::with_max_line_bytes(inner, MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(inner: S, max_line_bytes: usize) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
            scanned: 0,
            max_line_bytes,
            finished: false,
        }
    }

    fn overflow<E>(&mut self) -> Poll<Option<Result<Bytes, NdjsonError<E>>>> {
        self.buffer = BytesMut::new();
        self.scanned = 0;
        self.finished = true;
        Poll::Ready(Some(Err(NdjsonError::LineTooLong {
            limit: self.max_line_bytes,
        })))
    }
}

impl<S, E> Stream for NdjsonBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, NdjsonError<E>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if this.finished {
                return Poll::Ready(None);
            }

            if let Some(offset) = this.buffer[this.scanned..].iter().position(|b| *b == b'\n') {
                let pos = this.scanned + offset;
                this.scanned = 0;
                if pos > this.max_line_bytes {
                    return this.overflow();
                }
                let mut line = this.buffer.split_to(pos + 1);
                line.truncate(pos);
                if let Some(line) = non_blank(line) {
                    return Poll::Ready(Some(Ok(line)));
                }
                continue;
            }

            this.scanned = this.buffer.len();
            if this.buffer.len() > this.max_line_bytes {
                return this.overflow();
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    this.buffer.extend_from_slice(&chunk);
                }
                Poll::Ready(Some(Err(e))) => {
                    return Poll::Ready(Some(Err(NdjsonError::Body(e))));
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    this.scanned = 0;
                    let remaining = this.buffer.split();
                    return Poll::Ready(non_blank(remaining).map(Ok));
                }
                Poll::Pending => {
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Strips a trailing `\r` and drops lines that are only whitespace.
fn non_blank(mut line: BytesMut) -> Option<Bytes> {
    if line.last() == Some(&b'\r') {
        line.truncate(line.len() - 1);
    }
    if line.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        Some(line.freeze())
    }
}
