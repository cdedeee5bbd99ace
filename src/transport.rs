//! Line transport
//!
//! Frames a duplex byte stream (plain TCP or TLS) into newline-terminated
//! lines. Enforces a maximum line size, an idle read deadline, a fixed write
//! deadline, and rejects embedded carriage returns or newlines in both
//! directions.

use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf,
    WriteHalf,
};
use tokio::time::timeout;

use crate::error::TransportError;

/// Default maximum line size in bytes (terminator excluded)
pub const DEFAULT_MAX_LINE_LEN: usize = 4096;

/// Default idle read deadline
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for a single write + flush
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport limits shared by the reader and writer halves
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Maximum line length in bytes, terminator excluded
    pub max_line_len: usize,
    /// How long `read_line` waits for a complete line
    pub idle_timeout: Duration,
    /// How long `write_line` may take to write and flush
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_line_len: DEFAULT_MAX_LINE_LEN,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
        }
    }
}

/// Split a stream into its line reader and line writer
pub fn split<S>(
    stream: S,
    config: &TransportConfig,
) -> (LineReader<ReadHalf<S>>, LineWriter<WriteHalf<S>>)
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(stream);
    (
        LineReader::new(read_half, config),
        LineWriter::new(write_half, config),
    )
}

/// Reading half of a line transport
pub struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    max_line_len: usize,
    idle_timeout: Duration,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, config: &TransportConfig) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            max_line_len: config.max_line_len,
            idle_timeout: config.idle_timeout,
        }
    }

    /// Read one line with its terminator stripped
    ///
    /// The idle deadline restarts on every call.
    pub async fn read_line(&mut self) -> Result<String, TransportError> {
        match timeout(self.idle_timeout, self.read_framed()).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn read_framed(&mut self) -> Result<String, TransportError> {
        self.buf.clear();
        // Content plus "\r\n"; anything past that can never be a valid line.
        let limit = self.max_line_len + 2;

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Err(TransportError::Closed);
            }

            let (complete, used) = match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    self.buf.extend_from_slice(&available[..=pos]);
                    (true, pos + 1)
                }
                None => {
                    self.buf.extend_from_slice(available);
                    (false, available.len())
                }
            };
            self.inner.consume(used);

            if self.buf.len() > limit {
                return Err(TransportError::TooLarge {
                    len: self.buf.len(),
                    max: self.max_line_len,
                });
            }
            if complete {
                break;
            }
        }

        let line = strip_terminator(&self.buf);
        if line.len() > self.max_line_len {
            return Err(TransportError::TooLarge {
                len: line.len(),
                max: self.max_line_len,
            });
        }
        if has_control_breaks(line) {
            return Err(TransportError::InvalidFraming);
        }

        String::from_utf8(line.to_vec()).map_err(|_| TransportError::InvalidFraming)
    }
}

/// Writing half of a line transport
pub struct LineWriter<W> {
    inner: BufWriter<W>,
    max_line_len: usize,
    write_timeout: Duration,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W, config: &TransportConfig) -> Self {
        Self {
            inner: BufWriter::new(inner),
            max_line_len: config.max_line_len,
            write_timeout: config.write_timeout,
            closed: false,
        }
    }

    /// Write `line` plus a newline and flush it
    ///
    /// A successful return means the bytes reached the OS send buffer.
    pub async fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        if line.len() > self.max_line_len {
            return Err(TransportError::TooLarge {
                len: line.len(),
                max: self.max_line_len,
            });
        }
        if has_control_breaks(line.as_bytes()) {
            return Err(TransportError::InvalidFraming);
        }
        if self.closed {
            return Err(TransportError::Closed);
        }

        let inner = &mut self.inner;
        let write = async move {
            inner.write_all(line.as_bytes()).await?;
            inner.write_all(b"\n").await?;
            inner.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(result) => result.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Shut the write side down. Calling it again does nothing.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = timeout(self.write_timeout, self.inner.shutdown()).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

fn strip_terminator(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|&b| b != b'\n' && b != b'\r')
        .map_or(0, |pos| pos + 1);
    &line[..end]
}

fn has_control_breaks(line: &[u8]) -> bool {
    line.iter().any(|&b| b == b'\n' || b == b'\r')
}
