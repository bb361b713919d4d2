//! Gzip stages for payload pipelines.
//!
//! Compression levels follow the store's contract: `1..=9` select a gzip
//! encoder, `0` (or negative) means the pipeline carries no compression
//! stage at all, so the constructors here are only called for positive
//! levels. Decoding failures on corrupt input surface as
//! [std::io::ErrorKind::InvalidData].

use async_compression::tokio::bufread::GzipDecoder;
use async_compression::tokio::write::GzipEncoder;
use async_compression::Level;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Compression level used when the caller lets the store decide.
/// gzip -5 is the best speed/ratio trade-off for backup payloads.
pub const DEFAULT_GZIP_LEVEL: i32 = 5;

/// Wraps `inner` in a gzip encoder writing frames at `level` (`1..=9`).
pub fn gzip_writer<W: AsyncWrite>(inner: W, level: i32) -> GzipEncoder<W> {
    GzipEncoder::with_quality(inner, Level::Precise(level))
}

/// Wraps `inner` in a gzip decoder.
pub fn gzip_reader<R: AsyncRead>(inner: R) -> GzipDecoder<BufReader<R>> {
    GzipDecoder::new(BufReader::new(inner))
}
