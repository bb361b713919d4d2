//! The server side of the data protocol: an accept loop handing each
//! connection to its own task, and the per-connection request dispatcher.

pub mod client;

use std::io;
use std::path::Path;
use std::sync::Arc;

use hbackup_wire::{Frame, ReceptionManager, Receiver, Sender, TransmissionManager};
use num_traits::{FromPrimitive, ToPrimitive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio_listener::Listener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::comp::CompressionCase;
use crate::digests::ContentId;
use crate::errors::Error;
use crate::hash_tree::HashTree;
use crate::missing::MissingList;
use crate::proto::{status, Method, Tag};
use crate::store::{CrawlEntry, RemoveStatus, Store, StoreObserver};

/// Emit a CHECK liveness frame after this many collector triples, so the
/// client gets a chance to abort a long crawl.
const CHECK_INTERVAL: usize = 16;

/// Missing-digest journal kept next to the store.
const MISSING_FILE: &str = "missing";

/// Digests currently referenced while this daemon runs, kept in sync with
/// the store through its observer hook.
#[derive(Default)]
pub struct SessionIndex {
    tree: std::sync::Mutex<HashTree<String>>,
}

impl SessionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tree.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.tree.lock().unwrap().find(digest).is_some()
    }
}

impl StoreObserver for SessionIndex {
    fn hash_added(&self, digest: &str) {
        let mut tree = self.tree.lock().unwrap();
        let _ = tree.add(digest.to_string());
    }

    fn hash_removed(&self, digest: &str) {
        let _ = self.tree.lock().unwrap().remove(digest);
    }
}

/// Fields one request session may carry, before dispatch validates them
/// per method.
#[derive(Default)]
struct Request {
    method: Option<Method>,
    hash: Option<String>,
    path: Option<String>,
    level: i64,
    case: Option<CompressionCase>,
    want_extension: bool,
    want_store_path: bool,
    thorough: bool,
    repair: bool,
    collector: bool,
}

/// Shared state of one running daemon.
pub struct Daemon {
    store: Arc<Store>,
    index: Arc<SessionIndex>,
    missing: Mutex<MissingList>,
}

impl Daemon {
    /// Wraps a store, wiring up the session index and the missing-digest
    /// journal kept in the store root.
    pub async fn new(mut store: Store) -> crate::errors::Result<Self> {
        let index = Arc::new(SessionIndex::new());
        store.set_observer(index.clone());
        let mut missing = MissingList::new();
        missing.open(store.root().join(MISSING_FILE)).await?;
        Ok(Self {
            store: Arc::new(store),
            index,
            missing: Mutex::new(missing),
        })
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn index(&self) -> &SessionIndex {
        &self.index
    }

    /// Accepts connections until `shutdown` fires, then saves the missing
    /// journal. Each connection runs in its own task.
    pub async fn serve(
        self: Arc<Self>,
        mut listener: Listener,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        info!("serving");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (conn, peer) = accepted?;
                    debug!(%peer, "accepted connection");
                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_connection(conn).await {
                            warn!(error = %e, "connection failed");
                        }
                    });
                }
            }
        }
        self.missing.lock().await.close().await?;
        Ok(())
    }

    /// One connection: any number of request sessions until the peer goes
    /// away.
    #[instrument(skip_all)]
    pub async fn handle_connection<C>(&self, conn: C) -> io::Result<()>
    where
        C: AsyncRead + AsyncWrite + Send,
    {
        let (r, w) = tokio::io::split(conn);
        let mut rx = Receiver::new(r);
        let mut tx = Sender::new(w);
        let mut progress = false;
        loop {
            match rx.receive_opt().await? {
                None => return Ok(()),
                Some(Frame::Start) => {}
                Some(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "expected session start",
                    ))
                }
            }
            let req = match Self::read_request(&mut rx).await {
                Ok(req) => req,
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                    // an unknown tag leaves the session in an unknown
                    // state; report and drop the connection
                    reply_status(&mut tx, status::ENOSYS).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            self.dispatch(req, &mut tx, &mut progress).await?;
        }
    }

    async fn read_request<R: AsyncRead + Unpin>(rx: &mut Receiver<R>) -> io::Result<Request> {
        let mut mgr = ReceptionManager::new();
        mgr.expect_int(Tag::Method.code());
        mgr.expect_str(Tag::Hash.code());
        mgr.expect_str(Tag::Path.code());
        mgr.expect_int(Tag::CompressionLevel.code());
        mgr.expect_int(Tag::CompressionCase.code());
        mgr.expect_void(Tag::Extension.code());
        mgr.expect_void(Tag::StorePath.code());
        mgr.expect_void(Tag::Thorough.code());
        mgr.expect_void(Tag::Repair.code());
        mgr.expect_void(Tag::Collector.code());
        mgr.receive_session(rx, None).await?;
        Ok(Request {
            method: mgr.int(Tag::Method.code()).and_then(Method::from_i64),
            hash: mgr.take_str(Tag::Hash.code()),
            path: mgr.take_str(Tag::Path.code()),
            level: mgr.int(Tag::CompressionLevel.code()).unwrap_or(0),
            case: mgr
                .int(Tag::CompressionCase.code())
                .and_then(|v| u32::try_from(v).ok())
                .and_then(char::from_u32)
                .and_then(CompressionCase::from_char),
            want_extension: mgr.seen(Tag::Extension.code()),
            want_store_path: mgr.seen(Tag::StorePath.code()),
            thorough: mgr.seen(Tag::Thorough.code()),
            repair: mgr.seen(Tag::Repair.code()),
            collector: mgr.seen(Tag::Collector.code()),
        })
    }

    async fn dispatch<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
        progress: &mut bool,
    ) -> io::Result<()> {
        let Some(method) = req.method else {
            return reply_status(tx, status::EINVAL).await;
        };
        debug!(?method, "dispatching");
        match method {
            Method::Name => self.do_name(req, tx).await,
            Method::Read => self.do_read(req, tx).await,
            Method::Write => self.do_write(req, tx).await,
            Method::Remove => self.do_remove(req, tx).await,
            Method::Crawl => self.do_crawl(req, tx, *progress).await,
            Method::Progress => {
                *progress = true;
                debug!("progress reporting enabled for this connection");
                reply_status(tx, status::OK).await
            }
        }
    }

    async fn do_name<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
    ) -> io::Result<()> {
        let id = match parse_id(req.hash.as_deref()) {
            Ok(id) => id,
            Err(code) => return reply_status(tx, code).await,
        };
        match self.store.name(&id).await {
            Ok((path, extension)) => {
                let mut reply = TransmissionManager::new();
                reply.add_int(Tag::Status.code(), status::OK);
                reply.add_str(Tag::Path.code(), path.display().to_string());
                if req.want_extension {
                    reply.add_str(Tag::Extension.code(), extension);
                }
                reply.send(tx, true).await
            }
            Err(e) => reply_status(tx, status::of_error(&e)).await,
        }
    }

    async fn do_read<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
    ) -> io::Result<()> {
        let id = match parse_id(req.hash.as_deref()) {
            Ok(id) => id,
            Err(code) => return reply_status(tx, code).await,
        };
        let Some(target) = req.path else {
            return reply_status(tx, status::EINVAL).await;
        };
        match self.store.read(Path::new(&target), &id).await {
            Ok(()) => reply_status(tx, status::OK).await,
            Err(e) => {
                self.note_damage(&id, &e).await;
                reply_status(tx, status::of_error(&e)).await
            }
        }
    }

    async fn do_write<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
    ) -> io::Result<()> {
        let (Some(path), Some(case)) = (req.path, req.case) else {
            return reply_status(tx, status::EINVAL).await;
        };
        match self.store.write(Path::new(&path), req.level as i32, case).await {
            Ok(outcome) => {
                {
                    // a successful write recovers a previously flagged digest
                    let mut missing = self.missing.lock().await;
                    if let Some(at) = missing.search(outcome.id.digest().as_str()) {
                        missing.set_recovered(at);
                    }
                }
                let mut reply = TransmissionManager::new();
                reply.add_int(
                    Tag::Status.code(),
                    outcome.status.to_i64().expect("status maps to wire"),
                );
                reply.add_str(Tag::Hash.code(), outcome.id.to_string());
                reply.add_int(Tag::CompressionLevel.code(), outcome.level as i64);
                if req.want_store_path {
                    reply.add_str(Tag::StorePath.code(), outcome.store_path.display().to_string());
                }
                reply.send(tx, true).await
            }
            Err(e) => {
                warn!(error = %e, "write failed");
                // WRITE reports through the write-status convention
                reply_status(tx, -1).await
            }
        }
    }

    async fn do_remove<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
    ) -> io::Result<()> {
        let id = match parse_id(req.hash.as_deref()) {
            Ok(id) => id,
            Err(code) => return reply_status(tx, code).await,
        };
        match self.store.remove(&id).await {
            Ok(RemoveStatus::Removed) => reply_status(tx, status::OK).await,
            Ok(RemoveStatus::NotThere) => reply_status(tx, status::NOT_THERE).await,
            Err(e) => reply_status(tx, status::of_error(&e)).await,
        }
    }

    async fn do_crawl<W: AsyncWrite + Unpin>(
        &self,
        req: Request,
        tx: &mut Sender<W>,
        progress: bool,
    ) -> io::Result<()> {
        tx.start().await?;
        let code = if req.collector {
            let (items_tx, mut items_rx) = mpsc::channel::<CrawlEntry>(CHECK_INTERVAL);
            let store = self.store.clone();
            let (thorough, repair) = (req.thorough, req.repair);
            let walker =
                tokio::spawn(async move { store.crawl(thorough, repair, Some(items_tx)).await });
            let mut sent = 0usize;
            while let Some(entry) = items_rx.recv().await {
                if progress {
                    info!(id = %entry.id, "crawled");
                }
                tx.data(Tag::CollectorHash.code(), entry.id.to_string().as_bytes())
                    .await?;
                tx.data_int(Tag::CollectorData.code(), entry.data_size).await?;
                tx.data_int(Tag::CollectorFile.code(), entry.file_size).await?;
                sent += 1;
                if sent % CHECK_INTERVAL == 0 {
                    tx.check().await?;
                }
            }
            match walker.await {
                Ok(Ok(_stats)) => status::OK,
                Ok(Err(e)) => status::of_error(&e),
                Err(e) => {
                    warn!(error = %e, "crawl task failed");
                    status::EIO
                }
            }
        } else {
            match self.store.crawl(req.thorough, req.repair, None).await {
                Ok(_) => status::OK,
                Err(e) => status::of_error(&e),
            }
        };
        tx.data_int(Tag::Status.code(), code).await?;
        tx.end().await
    }

    /// Restore-path failures feed the missing-digest journal.
    async fn note_damage(&self, id: &ContentId, e: &Error) {
        let mut missing = self.missing.lock().await;
        match e {
            Error::NotFound(_) => missing.set_missing(id.digest().as_str()),
            Error::Corrupted(_) => missing.set_inconsistent(id.digest().as_str(), -1),
            _ => {}
        }
    }
}

fn parse_id(hash: Option<&str>) -> Result<ContentId, i64> {
    hash.ok_or(status::EINVAL)?
        .parse::<ContentId>()
        .map_err(|_| status::EINVAL)
}

async fn reply_status<W: AsyncWrite + Unpin>(tx: &mut Sender<W>, code: i64) -> io::Result<()> {
    let mut reply = TransmissionManager::new();
    reply.add_int(Tag::Status.code(), code);
    reply.send(tx, true).await
}
