//! Frame-level encoding and decoding.
//!
//! Wire format of one frame: a one-byte tag, the value length as exactly
//! four ASCII lowercase hex digits, then the value bytes. Framing codes
//! travel inside tag-0 frames as the ASCII decimal of the code read as a
//! signed 32-bit integer.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const START_CODE: u32 = 0xbadc01d0;
pub const END_CODE: u32 = 0xdeadbeef;
pub const CHECK_CODE: u32 = 0xcafec0de;

/// The length field is four hex digits, so this is a hard cap.
pub const MAX_VALUE_LEN: usize = 0xffff;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Start,
    End,
    Check,
    Data { tag: u8, value: Bytes },
}

/// Owns the write half of a transport and produces frames.
///
/// A failed write sticks: `end()` reports failure if any earlier frame of
/// the session already did, so a caller batching writes cannot close a
/// half-broken message cleanly by accident.
pub struct Sender<W> {
    inner: W,
    failed: bool,
}

impl<W: AsyncWrite + Unpin> Sender<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            failed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    async fn frame(&mut self, tag: u8, value: &[u8]) -> io::Result<()> {
        if value.len() > MAX_VALUE_LEN {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame value of {} bytes exceeds 0xffff", value.len()),
            ));
        }
        let mut head = [0u8; 5];
        head[0] = tag;
        head[1..].copy_from_slice(format!("{:04x}", value.len()).as_bytes());
        let res = async {
            self.inner.write_all(&head).await?;
            self.inner.write_all(value).await?;
            self.inner.flush().await
        }
        .await;
        if res.is_err() {
            self.failed = true;
        }
        res
    }

    async fn code(&mut self, code: u32) -> io::Result<()> {
        self.frame(0, (code as i32).to_string().as_bytes()).await
    }

    /// Opens a session.
    pub async fn start(&mut self) -> io::Result<()> {
        self.failed = false;
        self.code(START_CODE).await
    }

    /// Emits a liveness frame inside a session.
    pub async fn check(&mut self) -> io::Result<()> {
        self.code(CHECK_CODE).await
    }

    /// Closes the session; fails if any frame of it failed.
    pub async fn end(&mut self) -> io::Result<()> {
        self.code(END_CODE).await?;
        if self.failed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session had failed frames",
            ));
        }
        Ok(())
    }

    /// Emits a data frame. Tag 0 is reserved for framing.
    pub async fn data(&mut self, tag: u8, value: &[u8]) -> io::Result<()> {
        if tag == 0 {
            self.failed = true;
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tag 0 is reserved for framing",
            ));
        }
        self.frame(tag, value).await
    }

    /// Emits a data frame holding an integer as ASCII decimal.
    pub async fn data_int(&mut self, tag: u8, value: i64) -> io::Result<()> {
        self.data(tag, value.to_string().as_bytes()).await
    }
}

/// Owns the read half of a transport and parses frames.
pub struct Receiver<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> Receiver<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Reads one frame, or `None` on a clean EOF at a frame boundary.
    pub async fn receive_opt(&mut self) -> io::Result<Option<Frame>> {
        let mut tag = [0u8; 1];
        if self.inner.read(&mut tag).await? == 0 {
            return Ok(None);
        }
        let tag = tag[0];

        let mut len_hex = [0u8; 4];
        self.inner.read_exact(&mut len_hex).await?;
        let len_str = std::str::from_utf8(&len_hex)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length field not ASCII"))?;
        let len = usize::from_str_radix(len_str, 16)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length field not hex"))?;

        let mut value = vec![0u8; len];
        self.inner.read_exact(&mut value).await?;

        if tag != 0 {
            return Ok(Some(Frame::Data {
                tag,
                value: value.into(),
            }));
        }

        let text = std::str::from_utf8(&value)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "framing code not ASCII"))?;
        let code = text
            .parse::<i64>()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "framing code not decimal"))?
            as u32;
        match code {
            START_CODE => Ok(Some(Frame::Start)),
            END_CODE => Ok(Some(Frame::End)),
            CHECK_CODE => Ok(Some(Frame::Check)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected framing code {:#x}", other),
            )),
        }
    }

    /// Reads one frame; EOF is an error here.
    pub async fn receive(&mut self) -> io::Result<Frame> {
        self.receive_opt().await?.ok_or_else(|| {
            io::Error::new(io::ErrorKind::UnexpectedEof, "transport closed mid-session")
        })
    }
}
