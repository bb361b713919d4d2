//! Decoupling writer backed by a bounded queue and one worker task.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;
use tracing::debug;

/// Queue depth; with ~100 KiB copy chunks this bounds the amount of
/// in-flight data per pipeline at a couple of megabytes.
const QUEUE_DEPTH: usize = 16;

/// An [AsyncWrite] that copies submitted buffers into a bounded queue and
/// returns immediately while there is capacity, letting a single worker
/// task drain them into the inner writer in submission order.
///
/// `shutdown` closes the queue, waits for the worker to drain and shut the
/// inner writer down, and reports the worker's first error. A worker that
/// bailed out early also fails every subsequent write.
pub struct AsyncQueueWriter {
    tx: PollSender<Bytes>,
    worker: Option<JoinHandle<io::Result<u64>>>,
    queued: u64,
}

impl AsyncQueueWriter {
    pub fn new<W>(inner: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_capacity(inner, QUEUE_DEPTH)
    }

    pub fn with_capacity<W>(mut inner: W, depth: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<Bytes>(depth);
        let worker = tokio::spawn(async move {
            let mut written = 0u64;
            while let Some(chunk) = rx.recv().await {
                inner.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            inner.shutdown().await?;
            Ok(written)
        });
        Self {
            tx: PollSender::new(tx),
            worker: Some(worker),
            queued: 0,
        }
    }

    /// Bytes accepted into the queue so far.
    pub fn queued_bytes(&self) -> u64 {
        self.queued
    }

    /// Called when the queue turned out closed: the worker bailed out, so
    /// try to surface its actual error.
    fn worker_error(&mut self, cx: &mut Context<'_>) -> io::Error {
        if let Some(worker) = self.worker.as_mut() {
            if let Poll::Ready(res) = Pin::new(worker).poll(cx) {
                self.worker = None;
                return match res {
                    Ok(Err(e)) => e,
                    Ok(Ok(_)) => io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "write worker finished early",
                    ),
                    Err(e) => io::Error::new(io::ErrorKind::Other, e),
                };
            }
        }
        io::Error::new(io::ErrorKind::BrokenPipe, "write worker gone")
    }
}

impl AsyncWrite for AsyncQueueWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        if ready!(this.tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this.worker_error(cx)));
        }
        if this.tx.send_item(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(this.worker_error(cx)));
        }
        this.queued += buf.len() as u64;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Queued data only becomes durable on shutdown, which drains the
        // queue and flushes the inner writer.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        this.tx.close();
        let Some(worker) = this.worker.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let res = ready!(Pin::new(worker).poll(cx));
        this.worker = None;
        Poll::Ready(match res {
            Ok(Ok(written)) => {
                debug!(written, "write worker drained");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn preserves_order_and_content() {
        let (near, mut far) = tokio::io::duplex(64 * 1024);
        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            far.read_to_end(&mut all).await.unwrap();
            all
        });

        let mut w = AsyncQueueWriter::new(near);
        let mut expected = Vec::new();
        for i in 0u32..100 {
            let chunk = vec![(i % 251) as u8; 1000];
            w.write_all(&chunk).await.unwrap();
            expected.extend_from_slice(&chunk);
        }
        w.shutdown().await.unwrap();
        assert_eq!(w.queued_bytes(), expected.len() as u64);

        assert_eq!(reader.await.unwrap(), expected);
    }

    /// A writer whose queue is deeper than the data never blocks the
    /// producer; shutdown still waits for the drain.
    #[tokio::test]
    async fn small_payload_completes() {
        let (near, mut far) = tokio::io::duplex(1024);
        let reader = tokio::spawn(async move {
            let mut all = Vec::new();
            far.read_to_end(&mut all).await.unwrap();
            all
        });

        let mut w = AsyncQueueWriter::with_capacity(near, 2);
        w.write_all(b"hello").await.unwrap();
        w.write_all(b" world").await.unwrap();
        w.shutdown().await.unwrap();
        assert_eq!(reader.await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn worker_error_surfaces() {
        // 1-byte transport whose read side is dropped: the worker's
        // write_all fails once the buffer is gone.
        let (near, far) = tokio::io::duplex(1);
        drop(far);

        let mut w = AsyncQueueWriter::with_capacity(near, 1);
        let mut failed = false;
        for _ in 0..100 {
            if w.write_all(&[0u8; 4096]).await.is_err() {
                failed = true;
                break;
            }
        }
        if !failed {
            w.shutdown().await.expect_err("broken transport must fail");
        }
    }
}
