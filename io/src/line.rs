//! Delimiter-framed reading and writing.
//!
//! [LineReader] owns its refill buffer; bytes read ahead of the current
//! line are handed out first by the passthrough [AsyncRead] impl, so a
//! caller can mix framed and raw reads on the same stream.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const REFILL_CHUNK: usize = 100 * 1024;

/// A line as returned by [LineReader::next_line]: the payload without its
/// delimiter, and whether the delimiter was actually observed (false means
/// the stream ended mid-line).
pub type Line = (Vec<u8>, bool);

pub struct LineReader<R> {
    inner: R,
    buf: BytesMut,
    delim: u8,
    delim2: Option<u8>,
    bytes: u64,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R, delim: u8) -> Self {
        Self {
            inner,
            buf: BytesMut::new(),
            delim,
            delim2: None,
            bytes: 0,
            eof: false,
        }
    }

    /// Frames on the two-byte sequence `delim`,`delim2` instead of a single
    /// delimiter byte.
    pub fn with_second_delimiter(inner: R, delim: u8, delim2: u8) -> Self {
        Self {
            delim2: Some(delim2),
            ..Self::new(inner, delim)
        }
    }

    /// Bytes consumed from the stream so far, delimiters included.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Hands the inner reader back. Bytes already pulled into the refill
    /// buffer are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn find_delim(&self) -> Option<(usize, usize)> {
        match self.delim2 {
            None => self
                .buf
                .iter()
                .position(|&b| b == self.delim)
                .map(|i| (i, 1)),
            Some(d2) => {
                let b = &self.buf[..];
                (0..b.len().saturating_sub(1))
                    .find(|&i| b[i] == self.delim && b[i + 1] == d2)
                    .map(|i| (i, 2))
            }
        }
    }

    /// Reads up to and including the next delimiter. Returns the line
    /// without the delimiter plus a flag telling whether the delimiter was
    /// seen, or `None` once the stream is exhausted.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            if let Some((len, delim_len)) = self.find_delim() {
                let line = self.buf.split_to(len).to_vec();
                self.buf.advance(delim_len);
                self.bytes += (len + delim_len) as u64;
                return Ok(Some((line, true)));
            }
            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                let line = self.buf.split_to(self.buf.len()).to_vec();
                self.bytes += line.len() as u64;
                return Ok(Some((line, false)));
            }
            self.buf.reserve(REFILL_CHUNK);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LineReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if !this.buf.is_empty() {
            let n = this.buf.len().min(buf.remaining());
            buf.put_slice(&this.buf[..n]);
            this.buf.advance(n);
            this.bytes += n as u64;
            return Poll::Ready(Ok(()));
        }
        if this.eof {
            return Poll::Ready(Ok(()));
        }
        let filled = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.bytes += (buf.filled().len() - filled) as u64;
        Poll::Ready(Ok(()))
    }
}

pub struct LineWriter<W> {
    inner: W,
    delim: u8,
    delim2: Option<u8>,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    pub fn new(inner: W, delim: u8) -> Self {
        Self {
            inner,
            delim,
            delim2: None,
        }
    }

    pub fn with_second_delimiter(inner: W, delim: u8, delim2: u8) -> Self {
        Self {
            delim2: Some(delim2),
            ..Self::new(inner, delim)
        }
    }

    /// Writes the payload followed by the delimiter byte(s).
    pub async fn put_line(&mut self, line: &[u8]) -> io::Result<()> {
        self.inner.write_all(line).await?;
        self.inner.write_all(&[self.delim]).await?;
        if let Some(d2) = self.delim2 {
            self.inner.write_all(&[d2]).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
