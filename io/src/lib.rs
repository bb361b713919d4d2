//! Streaming building blocks shared by the hbackup crates.
//!
//! Everything here operates on [tokio::io::AsyncRead] / [tokio::io::AsyncWrite]
//! and composes by wrapping: a stage owns its inner reader or writer and hands
//! it back via `into_inner` where that makes sense.

pub mod async_writer;
pub mod copy;
pub mod hasher;
pub mod line;
pub mod multi_writer;
pub mod zip;

pub use async_writer::AsyncQueueWriter;
pub use copy::{compare, copy_all, COPY_CHUNK_SIZE};
pub use hasher::{HashAlgo, Hasher, HashingReader, HashingWriter};
pub use line::{LineReader, LineWriter};
pub use multi_writer::MultiWriter;
pub use zip::{gzip_reader, gzip_writer, DEFAULT_GZIP_LEVEL};
