//! Chunked copy and compare loops with cooperative cancellation.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Too big and we end up wasting time.
pub const COPY_CHUNK_SIZE: usize = 100 * 1024;

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

/// Streams `reader` to `writer` until EOF, checking `cancel` between
/// chunks. Returns the number of bytes copied. The writer is not shut
/// down; that stays with the caller, who may still own siblings of it.
pub async fn copy_all<R, W>(
    reader: &mut R,
    writer: &mut W,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Streams both readers to exhaustion and reports whether they carried the
/// same bytes.
pub async fn compare<L, R>(
    left: &mut L,
    right: &mut R,
    cancel: &CancellationToken,
) -> io::Result<bool>
where
    L: AsyncRead + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut lbuf = vec![0u8; COPY_CHUNK_SIZE];
    let mut rbuf = vec![0u8; COPY_CHUNK_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(cancelled());
        }
        let ln = left.read(&mut lbuf).await?;
        if ln == 0 {
            return Ok(right.read(&mut rbuf).await? == 0);
        }
        let mut got = 0;
        while got < ln {
            let rn = right.read(&mut rbuf[got..ln]).await?;
            if rn == 0 {
                return Ok(false);
            }
            got += rn;
        }
        if lbuf[..ln] != rbuf[..ln] {
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn copies_everything() {
        let data: Vec<u8> = (0u32..300_000).map(|i| (i % 241) as u8).collect();
        let mut src = Cursor::new(data.clone());
        let mut dst = Cursor::new(Vec::new());
        let n = copy_all(&mut src, &mut dst, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(dst.into_inner(), data);
    }

    #[tokio::test]
    async fn cancellation_interrupts() {
        let token = CancellationToken::new();
        token.cancel();
        let mut src = Cursor::new(vec![0u8; 16]);
        let mut dst = Cursor::new(Vec::new());
        let err = copy_all(&mut src, &mut dst, &token).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn compare_equal_and_different() {
        let token = CancellationToken::new();
        let data: Vec<u8> = (0u32..250_000).map(|i| (i % 7) as u8).collect();

        let mut a = Cursor::new(data.clone());
        let mut b = Cursor::new(data.clone());
        assert!(compare(&mut a, &mut b, &token).await.unwrap());

        let mut mutated = data.clone();
        mutated[123_456] ^= 1;
        let mut a = Cursor::new(data.clone());
        let mut b = Cursor::new(mutated);
        assert!(!compare(&mut a, &mut b, &token).await.unwrap());

        // a strict prefix differs too
        let mut a = Cursor::new(data.clone());
        let mut b = Cursor::new(data[..data.len() - 1].to_vec());
        assert!(!compare(&mut a, &mut b, &token).await.unwrap());
    }
}
