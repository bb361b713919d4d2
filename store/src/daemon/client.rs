//! Thin client mirroring the store operations over the wire.
//!
//! Each method opens the socket lazily, sends one request session and
//! consumes one response session, returning the decoded status to the
//! caller.

use std::io;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use hbackup_wire::{Frame, Receiver, Sender};
use num_traits::FromPrimitive;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::comp::CompressionCase;
use crate::proto::{Method, Tag};

/// Where the server listens: a filesystem socket path, an abstract socket
/// name (leading `@`), or a TCP `host:port`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteAddr {
    Unix(PathBuf),
    Abstract(String),
    Tcp(String),
}

impl FromStr for RemoteAddr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(name) = s.strip_prefix('@') {
            Ok(RemoteAddr::Abstract(name.to_string()))
        } else if s.contains('/') || !s.contains(':') {
            Ok(RemoteAddr::Unix(PathBuf::from(s)))
        } else {
            Ok(RemoteAddr::Tcp(s.to_string()))
        }
    }
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteAddr::Unix(path) => write!(f, "{}", path.display()),
            RemoteAddr::Abstract(name) => write!(f, "@{}", name),
            RemoteAddr::Tcp(addr) => f.write_str(addr),
        }
    }
}

/// Consumer of the crawl triples on the client side.
pub trait Collector {
    fn add(&mut self, hash: &str, data_size: i64, file_size: i64);
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NameReply {
    pub status: i64,
    pub path: String,
    pub extension: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteReply {
    /// Write status: 0 leave, 1 add, 2 replace, -1 error.
    pub status: i64,
    pub hash: String,
    pub level: i64,
    pub store_path: Option<String>,
}

type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

struct Conn {
    rx: Receiver<BoxedRead>,
    tx: Sender<BoxedWrite>,
}

impl Conn {
    /// Reads one frame, bounded by the configured response timeout. An
    /// expired timeout surfaces as [io::ErrorKind::TimedOut].
    async fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Frame> {
        match timeout {
            None => self.rx.receive().await,
            Some(timeout) => tokio::time::timeout(timeout, self.rx.receive())
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no reply in time"))?,
        }
    }

    /// Consumes a response session carrying nothing but a STATUS frame.
    async fn status_reply(&mut self, timeout: Option<Duration>) -> io::Result<i64> {
        let mut status = 0i64;
        loop {
            match self.receive(timeout).await? {
                Frame::Start | Frame::Check => {}
                Frame::End => return Ok(status),
                Frame::Data { tag, value } => match Tag::from_u8(tag) {
                    Some(Tag::Status) => status = parse_int(&value)?,
                    _ => return Err(unexpected_tag(tag)),
                },
            }
        }
    }
}

pub struct RemoteStore {
    addr: RemoteAddr,
    conn: Option<Conn>,
    timeout: Option<Duration>,
}

impl RemoteStore {
    pub fn new(addr: RemoteAddr) -> Self {
        Self {
            addr,
            conn: None,
            timeout: None,
        }
    }

    /// Bounds the wait for each response frame.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Connects if not connected yet.
    pub async fn open(&mut self) -> io::Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        debug!(addr = %self.addr, "connecting");
        let (r, w): (BoxedRead, BoxedWrite) = match &self.addr {
            RemoteAddr::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r), Box::new(w))
            }
            RemoteAddr::Abstract(name) => {
                #[cfg(target_os = "linux")]
                {
                    use std::os::linux::net::SocketAddrExt;
                    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
                    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
                    stream.set_nonblocking(true)?;
                    let (r, w) = UnixStream::from_std(stream)?.into_split();
                    (Box::new(r) as BoxedRead, Box::new(w) as BoxedWrite)
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = name;
                    return Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "abstract socket names are linux-only",
                    ));
                }
            }
            RemoteAddr::Tcp(addr) => {
                let (r, w) = TcpStream::connect(addr.as_str()).await?.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        self.conn = Some(Conn {
            rx: Receiver::new(r),
            tx: Sender::new(w),
        });
        Ok(())
    }

    pub fn close(&mut self) {
        self.conn = None;
    }

    async fn conn(&mut self) -> io::Result<&mut Conn> {
        self.open().await?;
        Ok(self.conn.as_mut().expect("just connected"))
    }

    /// NAME: resolve a content id to its payload path, optionally with the
    /// extension.
    pub async fn name(&mut self, hash: &str, want_extension: bool) -> io::Result<NameReply> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Name as i64)
            .await?;
        conn.tx.data(Tag::Hash.code(), hash.as_bytes()).await?;
        if want_extension {
            conn.tx.data(Tag::Extension.code(), b"").await?;
        }
        conn.tx.end().await?;

        let mut reply = NameReply::default();
        loop {
            match conn.receive(timeout).await? {
                Frame::Start | Frame::Check => {}
                Frame::End => return Ok(reply),
                Frame::Data { tag, value } => match Tag::from_u8(tag) {
                    Some(Tag::Status) => reply.status = parse_int(&value)?,
                    Some(Tag::Path) => reply.path = parse_str(&value)?,
                    Some(Tag::Extension) => reply.extension = Some(parse_str(&value)?),
                    _ => return Err(unexpected_tag(tag)),
                },
            }
        }
    }

    /// READ: extract an entry into `target` on the server side.
    pub async fn read(&mut self, target: &str, hash: &str) -> io::Result<i64> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Read as i64)
            .await?;
        conn.tx.data(Tag::Path.code(), target.as_bytes()).await?;
        conn.tx.data(Tag::Hash.code(), hash.as_bytes()).await?;
        conn.tx.end().await?;
        conn.status_reply(timeout).await
    }

    /// WRITE: store the file at `path` (a server-side path).
    pub async fn write(
        &mut self,
        path: &str,
        level: i64,
        case: CompressionCase,
        want_store_path: bool,
    ) -> io::Result<WriteReply> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Write as i64)
            .await?;
        conn.tx.data(Tag::Path.code(), path.as_bytes()).await?;
        conn.tx
            .data_int(Tag::CompressionLevel.code(), level)
            .await?;
        conn.tx
            .data_int(Tag::CompressionCase.code(), case.as_char() as i64)
            .await?;
        if want_store_path {
            conn.tx.data(Tag::StorePath.code(), b"").await?;
        }
        conn.tx.end().await?;

        let mut reply = WriteReply {
            status: -1,
            ..WriteReply::default()
        };
        loop {
            match conn.receive(timeout).await? {
                Frame::Start | Frame::Check => {}
                Frame::End => return Ok(reply),
                Frame::Data { tag, value } => match Tag::from_u8(tag) {
                    Some(Tag::Status) => reply.status = parse_int(&value)?,
                    Some(Tag::Hash) => reply.hash = parse_str(&value)?,
                    Some(Tag::CompressionLevel) => reply.level = parse_int(&value)?,
                    Some(Tag::StorePath) => reply.store_path = Some(parse_str(&value)?),
                    _ => return Err(unexpected_tag(tag)),
                },
            }
        }
    }

    /// REMOVE: delete an entry.
    pub async fn remove(&mut self, hash: &str) -> io::Result<i64> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Remove as i64)
            .await?;
        conn.tx.data(Tag::Hash.code(), hash.as_bytes()).await?;
        conn.tx.end().await?;
        conn.status_reply(timeout).await
    }

    /// CRAWL: sweep the server-side store. Valid entries stream into the
    /// collector; the abort callback is consulted on CHECK frames, and an
    /// abort simply drops the connection.
    pub async fn crawl(
        &mut self,
        thorough: bool,
        repair: bool,
        mut collector: Option<&mut dyn Collector>,
        abort: Option<&dyn Fn() -> bool>,
    ) -> io::Result<i64> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Crawl as i64)
            .await?;
        if thorough {
            conn.tx.data(Tag::Thorough.code(), b"").await?;
        }
        if repair {
            conn.tx.data(Tag::Repair.code(), b"").await?;
        }
        if collector.is_some() {
            conn.tx.data(Tag::Collector.code(), b"").await?;
        }
        conn.tx.end().await?;

        let mut status = 0i64;
        let mut hash = String::new();
        let mut data_size = -1i64;
        let mut aborted = false;
        loop {
            match conn.receive(timeout).await? {
                Frame::Start => {}
                Frame::Check => {
                    if abort.map(|cb| cb()).unwrap_or(false) {
                        aborted = true;
                        break;
                    }
                }
                Frame::End => break,
                Frame::Data { tag, value } => match Tag::from_u8(tag) {
                    Some(Tag::Status) => status = parse_int(&value)?,
                    Some(Tag::CollectorHash) => hash = parse_str(&value)?,
                    Some(Tag::CollectorData) => data_size = parse_int(&value)?,
                    Some(Tag::CollectorFile) => {
                        let file_size = parse_int(&value)?;
                        if let Some(collector) = collector.as_deref_mut() {
                            collector.add(&hash, data_size, file_size);
                        }
                    }
                    _ => return Err(unexpected_tag(tag)),
                },
            }
        }
        if aborted {
            // no END owed: closing the transport stops the server side
            self.close();
            return Err(io::Error::new(io::ErrorKind::Interrupted, "crawl aborted"));
        }
        Ok(status)
    }

    /// PROGRESS: ask the server to report progress for this connection.
    pub async fn set_progress(&mut self) -> io::Result<i64> {
        let timeout = self.timeout;
        let conn = self.conn().await?;
        conn.tx.start().await?;
        conn.tx
            .data_int(Tag::Method.code(), Method::Progress as i64)
            .await?;
        conn.tx.end().await?;
        conn.status_reply(timeout).await
    }
}

fn parse_int(value: &[u8]) -> io::Result<i64> {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-numeric value"))
}

fn parse_str(value: &[u8]) -> io::Result<String> {
    std::str::from_utf8(value)
        .map(str::to_owned)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-UTF-8 value"))
}

fn unexpected_tag(tag: u8) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("unexpected tag {}", tag))
}
