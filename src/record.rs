//! Record-framed pipe reader.
//!
//! A [`RecordStream`] wraps the read end of a worker pipe in a fixed-size
//! buffer and hands out one delimiter-terminated record per call. The
//! descriptor is non-blocking, so an idle worker shows up as
//! [`ReadOutcome::WouldBlock`] instead of stalling the caller.
//!
//! Records longer than the buffer are streamed: the buffered prefix is
//! written to the sink and the rest is read with a blocking wait, so memory
//! stays bounded no matter how long a record is.
//!
//! ```text
//!   buf: [ consumed | unconsumed ......... | free ]
//!          0        pos                    len    capacity
//! ```

use crate::config::Framing;
use crate::pipe::{PIPE_CAPACITY, PipeFd};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, BorrowedFd};
use tracing::trace;

/// Result of one [`RecordStream::read_record`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One record was written to the sink; the value is the number of
    /// bytes consumed from the pipe (delimiter included when present).
    Record(usize),
    /// The peer closed its end and every buffered byte was consumed.
    Eof,
    /// No data is available right now.
    WouldBlock,
}

/// Outcome of a single buffer refill.
enum Fill {
    Data,
    Eof,
    WouldBlock,
}

/// Buffered, delimiter-aware reader over a non-blocking pipe.
pub struct RecordStream {
    pipe: PipeFd,
    framing: Framing,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
}

impl RecordStream {
    /// Wrap `pipe` with a `PIPE_BUF`-sized buffer and switch it to non-blocking mode.
    pub fn new(pipe: PipeFd, framing: Framing) -> io::Result<Self> {
        Self::with_capacity(pipe, framing, PIPE_CAPACITY)
    }

    /// Like [`RecordStream::new`] with an explicit buffer capacity.
    pub fn with_capacity(pipe: PipeFd, framing: Framing, capacity: usize) -> io::Result<Self> {
        assert!(capacity > 0, "record buffer capacity must be non-zero");
        pipe.set_nonblocking()
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(Self {
            pipe,
            framing,
            buf: vec![0u8; capacity].into_boxed_slice(),
            pos: 0,
            len: 0,
        })
    }

    /// Whether every buffered byte has been consumed.
    pub fn is_drained(&self) -> bool {
        self.pos >= self.len
    }

    /// Copy exactly one record from the pipe into `sink`.
    ///
    /// Transient conditions never surface: EINTR is retried and a would-block
    /// on an empty buffer is reported as [`ReadOutcome::WouldBlock`]. Once part
    /// of a record has been written, the call blocks until the record is
    /// complete or the peer closes. An unterminated trailing record is
    /// forwarded as-is and the following call returns [`ReadOutcome::Eof`].
    pub fn read_record<W: Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<ReadOutcome> {
        if self.is_drained() {
            match self.fill()? {
                Fill::Data => {}
                Fill::Eof => return Ok(ReadOutcome::Eof),
                Fill::WouldBlock => return Ok(ReadOutcome::WouldBlock),
            }
        }

        let mut consumed = 0;
        loop {
            let chunk = &self.buf[self.pos..self.len];
            if let Some(k) = chunk.iter().position(|&b| b == self.framing.delimiter) {
                let end = if self.framing.keep_delimiter { k + 1 } else { k };
                sink.write_all(&chunk[..end])?;
                self.pos += k + 1;
                return Ok(ReadOutcome::Record(consumed + k + 1));
            }

            // Partial record: flush what we have and block for the rest
            sink.write_all(chunk)?;
            consumed += chunk.len();
            self.pos = self.len;
            trace!(
                fd = ?self.pipe.as_fd(),
                consumed,
                "Partial record flushed, waiting for remainder"
            );

            if !self.fill_blocking()? {
                return Ok(ReadOutcome::Record(consumed));
            }
        }
    }

    /// Close the underlying descriptor.
    pub fn close(self) {
        drop(self);
    }

    /// Refill the (empty) buffer with one read.
    fn fill(&mut self) -> io::Result<Fill> {
        debug_assert!(self.is_drained());
        match self.pipe.read(&mut self.buf) {
            Ok(0) => Ok(Fill::Eof),
            Ok(n) => {
                self.pos = 0;
                self.len = n;
                Ok(Fill::Data)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Fill::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Refill, waiting for readability as long as needed.
    ///
    /// Returns `false` when the peer closed the pipe.
    fn fill_blocking(&mut self) -> io::Result<bool> {
        loop {
            match self.fill()? {
                Fill::Data => return Ok(true),
                Fill::Eof => return Ok(false),
                Fill::WouldBlock => self.pipe.wait_readable()?,
            }
        }
    }
}

impl AsFd for RecordStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.as_fd()
    }
}

impl std::fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStream")
            .field("fd", &self.pipe.as_fd())
            .field("framing", &self.framing)
            .field("buffered", &(self.len - self.pos))
            .field("capacity", &self.buf.len())
            .finish()
    }
}
