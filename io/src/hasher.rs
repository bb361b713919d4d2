//! Streaming digests over pipeline stages.
//!
//! [HashingReader] and [HashingWriter] are transparent adapters: every byte
//! that passes through is fed into the digest, and `finalize` yields the
//! lowercase hex digest together with the number of bytes processed. The
//! digest is independent of how the stream was chunked.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{ready, Context, Poll};

use data_encoding::HEXLOWER;
use digest::Digest;
use md5::Md5;
use pin_project_lite::pin_project;
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Digest algorithms supported by the store.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HashAlgo {
    Md5,
    Sha1,
    Sha256,
    Sha512,
}

impl HashAlgo {
    /// Digest length in bytes.
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgo::Md5 => 16,
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
            HashAlgo::Sha512 => 64,
        }
    }

    /// Length of the lowercase hex rendering.
    pub fn hex_len(&self) -> usize {
        2 * self.digest_len()
    }

    /// Returns fresh streaming state for this algorithm.
    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgo::Md5 => Hasher::Md5(Md5::new()),
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
            HashAlgo::Sha512 => Hasher::Sha512(Box::new(Sha512::new())),
        }
    }
}

impl fmt::Display for HashAlgo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            HashAlgo::Md5 => "md5",
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
            HashAlgo::Sha512 => "sha512",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid hash algo: {0}")]
pub struct InvalidHashAlgo(String);

impl FromStr for HashAlgo {
    type Err = InvalidHashAlgo;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(HashAlgo::Md5),
            "sha1" => Ok(HashAlgo::Sha1),
            "sha256" => Ok(HashAlgo::Sha256),
            "sha512" => Ok(HashAlgo::Sha512),
            _ => Err(InvalidHashAlgo(s.to_string())),
        }
    }
}

/// Streaming digest state, generic over [HashAlgo] at runtime.
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Sha512(Box<Sha512>),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Md5(h) => h.update(data),
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Finalizes the digest and renders it as lowercase hex.
    pub fn finalize_hex(self) -> String {
        match self {
            Hasher::Md5(h) => HEXLOWER.encode(&h.finalize()),
            Hasher::Sha1(h) => HEXLOWER.encode(&h.finalize()),
            Hasher::Sha256(h) => HEXLOWER.encode(&h.finalize()),
            Hasher::Sha512(h) => HEXLOWER.encode(&h.finalize()),
        }
    }
}

pin_project! {
    /// Transparent [AsyncRead] adapter hashing everything it delivers.
    pub struct HashingReader<R> {
        #[pin]
        inner: R,
        hasher: Hasher,
        bytes: u64,
    }
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, algo: HashAlgo) -> Self {
        Self {
            inner,
            hasher: algo.hasher(),
            bytes: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalizes, returning the lowercase hex digest and the byte count.
    pub fn finalize(self) -> (String, u64) {
        (self.hasher.finalize_hex(), self.bytes)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let filled = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let new = &buf.filled()[filled..];
        this.hasher.update(new);
        *this.bytes += new.len() as u64;
        Poll::Ready(Ok(()))
    }
}

pin_project! {
    /// Transparent [AsyncWrite] adapter hashing everything it forwards.
    pub struct HashingWriter<W> {
        #[pin]
        inner: W,
        hasher: Hasher,
        bytes: u64,
    }
}

impl<W> HashingWriter<W> {
    pub fn new(inner: W, algo: HashAlgo) -> Self {
        Self {
            inner,
            hasher: algo.hasher(),
            bytes: 0,
        }
    }

    /// Number of bytes hashed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finalizes, returning the lowercase hex digest and the byte count.
    pub fn finalize(self) -> (String, u64) {
        (self.hasher.finalize_hex(), self.bytes)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for HashingWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        this.hasher.update(&buf[..n]);
        *this.bytes += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    const INPUT: &[u8] = b"abc";

    #[rstest]
    #[case::md5(HashAlgo::Md5, "900150983cd24fb0d6963f7d28e17f72")]
    #[case::sha1(HashAlgo::Sha1, "a9993e364706816aba3e25717850c26c9cd0d89d")]
    #[case::sha256(
        HashAlgo::Sha256,
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
    )]
    #[tokio::test]
    async fn known_digests_through_reader(#[case] algo: HashAlgo, #[case] expected: &str) {
        let mut r = HashingReader::new(Cursor::new(INPUT), algo);
        let mut sink = Vec::new();
        r.read_to_end(&mut sink).await.unwrap();
        let (hex, n) = r.finalize();
        assert_eq!(hex, expected);
        assert_eq!(n, INPUT.len() as u64);
        assert_eq!(sink, INPUT);
    }

    #[tokio::test]
    async fn empty_md5() {
        let r = HashingReader::new(Cursor::new(&b""[..]), HashAlgo::Md5);
        let (hex, n) = r.finalize();
        assert_eq!(hex, "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(n, 0);
    }

    /// The digest must not depend on chunk boundaries, nor on whether the
    /// bytes went through the reader or the writer side.
    #[rstest]
    #[case(1)]
    #[case(7)]
    #[case(1024)]
    #[tokio::test]
    async fn chunking_is_transparent(#[case] chunk: usize) {
        let data: Vec<u8> = (0u32..40_000).map(|i| (i % 251) as u8).collect();

        let mut one_shot = HashAlgo::Sha256.hasher();
        one_shot.update(&data);
        let expected = one_shot.finalize_hex();

        let mut w = HashingWriter::new(Cursor::new(Vec::new()), HashAlgo::Sha256);
        for part in data.chunks(chunk) {
            w.write_all(part).await.unwrap();
        }
        w.shutdown().await.unwrap();
        let (hex, n) = w.finalize();
        assert_eq!(hex, expected);
        assert_eq!(n, data.len() as u64);
    }

    #[test]
    fn algo_round_trips_through_strings() {
        for algo in [
            HashAlgo::Md5,
            HashAlgo::Sha1,
            HashAlgo::Sha256,
            HashAlgo::Sha512,
        ] {
            assert_eq!(algo.to_string().parse::<HashAlgo>().unwrap(), algo);
            assert_eq!(algo.hex_len(), 2 * algo.digest_len());
        }
        assert!("crc32".parse::<HashAlgo>().is_err());
    }
}
