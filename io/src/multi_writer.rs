//! Fan-out writer delivering every byte to an ordered list of children.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::AsyncWrite;
use tracing::warn;

struct Child {
    label: String,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// Writes each submitted buffer to every child, in the order the children
/// were added. The aggregate write only succeeds once all children accepted
/// the whole buffer; the first failing child's label is retained for
/// diagnostics.
#[derive(Default)]
pub struct MultiWriter {
    children: Vec<Child>,
    // progress through the buffer currently being fanned out
    active: usize,
    offsets: Vec<usize>,
    failed: Option<String>,
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<W>(&mut self, label: impl Into<String>, writer: W)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        self.children.push(Child {
            label: label.into(),
            writer: Box::new(writer),
        });
        self.offsets.push(0);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Label of the first child that failed, if any.
    pub fn failed_child(&self) -> Option<&str> {
        self.failed.as_deref()
    }
}

impl AsyncWrite for MultiWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        while this.active < this.children.len() {
            let idx = this.active;
            let off = this.offsets[idx];
            if off >= buf.len() {
                this.active += 1;
                continue;
            }
            let child = &mut this.children[idx];
            match ready!(Pin::new(&mut child.writer).poll_write(cx, &buf[off..])) {
                Ok(0) => {
                    let e = io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("'{}' accepted no bytes", child.label),
                    );
                    if this.failed.is_none() {
                        this.failed = Some(child.label.clone());
                    }
                    return Poll::Ready(Err(e));
                }
                Ok(n) => this.offsets[idx] += n,
                Err(e) => {
                    warn!(child = %child.label, error = %e, "fan-out write failed");
                    if this.failed.is_none() {
                        this.failed = Some(child.label.clone());
                    }
                    return Poll::Ready(Err(e));
                }
            }
        }
        this.active = 0;
        for off in &mut this.offsets {
            *off = 0;
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        for child in &mut this.children {
            ready!(Pin::new(&mut child.writer).poll_flush(cx))?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        for child in &mut this.children {
            ready!(Pin::new(&mut child.writer).poll_shutdown(cx))?;
        }
        Poll::Ready(Ok(()))
    }
}
