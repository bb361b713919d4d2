//! The content-addressed data store.
//!
//! Payloads are staged under `<root>/tmp/` while they stream through the
//! hashing/compression pipeline, then moved into their digest-derived
//! entry directory. Entry directories are created with plain `mkdir`
//! semantics so concurrent writers racing on one digest family fall back
//! into the collision rescan instead of clobbering each other.

// Compression to use when required: gzip -5 (best speed/ratio)

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hbackup_io::{
    compare, copy_all, gzip_reader, gzip_writer, AsyncQueueWriter, HashAlgo, HashingReader,
    HashingWriter, MultiWriter,
};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::comp::{CompressionCase, WriteStatus};
use crate::digests::{ContentId, Digest, DIR_LEVEL_CHARS};
use crate::entry::{self, Meta};
use crate::errors::{Error, Result};

const UPGRADED_MARKER: &str = ".upgraded";
const TMP_DIR: &str = "tmp";
const PART_SUFFIX: &str = ".hbackup-part";

/// Directory levels above the entry directories.
const DIR_LEVELS: usize = DIR_LEVEL_CHARS / 2;

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Hook for keeping an external index (the backup session's hash tree) in
/// sync with the store's contents.
pub trait StoreObserver: Send + Sync {
    fn hash_added(&self, _digest: &str) {}
    fn hash_removed(&self, _digest: &str) {}
}

/// One valid entry reported by [Store::crawl].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrawlEntry {
    pub id: ContentId,
    pub data_size: i64,
    pub file_size: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CrawlStats {
    pub valid: usize,
    pub broken: usize,
}

#[derive(Clone, Debug)]
pub struct WriteOutcome {
    pub status: WriteStatus,
    pub id: ContentId,
    /// Compression level actually applied; 0 when stored uncompressed.
    pub level: i32,
    pub store_path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoveStatus {
    Removed,
    /// The entry was not there; a warning, not an error.
    NotThere,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckReport {
    /// Uncompressed payload size, -1 when unknown.
    pub data_size: i64,
    /// On-disk payload size, -1 when unknown.
    pub file_size: i64,
}

pub struct Store {
    root: PathBuf,
    tmp: PathBuf,
    algo: HashAlgo,
    cancel: CancellationToken,
    observer: Option<Arc<dyn StoreObserver>>,
}

impl Store {
    /// Opens the store at `root`, creating it when asked to. Opening an
    /// existing store runs the one-shot layout upgrade if the marker is
    /// absent.
    pub async fn open(root: impl Into<PathBuf>, algo: HashAlgo, create: bool) -> Result<Self> {
        let root = root.into();
        let store = Self {
            tmp: root.join(TMP_DIR),
            root,
            algo,
            cancel: CancellationToken::new(),
            observer: None,
        };
        match fs::metadata(&store.root).await {
            Ok(meta) if meta.is_dir() => store.upgrade().await?,
            Ok(_) => {
                return Err(Error::InvalidRequest(format!(
                    "'{}' is not a directory",
                    store.root.display()
                )))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && create => {
                fs::create_dir_all(&store.root).await?;
                fs::write(store.root.join(UPGRADED_MARKER), b"").await?;
                info!(root = %store.root.display(), "created store");
            }
            Err(e) => return Err(Error::Io(e)),
        }
        fs::create_dir_all(&store.tmp).await?;
        Ok(store)
    }

    pub fn algo(&self) -> HashAlgo {
        self.algo
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Token polled by all long loops; cancel it to make them return
    /// [Error::Cancelled] promptly.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn set_observer(&mut self, observer: Arc<dyn StoreObserver>) {
        self.observer = Some(observer);
    }

    fn staging_path(&self, ext: &str) -> PathBuf {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.tmp
            .join(format!("stage-{}-{}{}", std::process::id(), seq, ext))
    }

    fn require_storable(id: &ContentId) -> Result<()> {
        if id.digest().len() <= DIR_LEVEL_CHARS {
            return Err(Error::InvalidRequest(format!(
                "digest '{}' too short to map onto the store layout",
                id.digest()
            )));
        }
        Ok(())
    }

    /// Resolves an entry to its payload file and extension (`""` or
    /// `".gz"`).
    #[instrument(skip(self), err)]
    pub async fn name(&self, id: &ContentId) -> Result<(PathBuf, String)> {
        Self::require_storable(id)?;
        let dir = entry::entry_path(&self.root, id);
        match entry::find_payload(&dir).await? {
            Some((_, compressed)) => Ok((
                dir.join(entry::DATA_FILE),
                if compressed {
                    entry::GZ_EXT.to_string()
                } else {
                    String::new()
                },
            )),
            None => Err(Error::NotFound(id.clone())),
        }
    }

    /// Extracts an entry to `target`, verifying the digest on the way.
    /// The data lands in `<target>.hbackup-part` first and is only renamed
    /// into place once it checked out.
    #[instrument(skip(self), fields(target = %target.display()), err)]
    pub async fn read(&self, target: &Path, id: &ContentId) -> Result<()> {
        Self::require_storable(id)?;
        let dir = entry::entry_path(&self.root, id);
        let Some((payload, compressed)) = entry::find_payload(&dir).await? else {
            return Err(Error::NotFound(id.clone()));
        };
        let part = path_with_suffix(target, PART_SUFFIX);
        match self.extract(&payload, compressed, &part, id).await {
            Ok(()) => {
                fs::rename(&part, target).await?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn extract(
        &self,
        payload: &Path,
        compressed: bool,
        part: &Path,
        id: &ContentId,
    ) -> Result<()> {
        let file = fs::File::open(payload).await?;
        let mut reader: Box<dyn AsyncRead + Send + Unpin> = if compressed {
            Box::new(gzip_reader(file))
        } else {
            Box::new(file)
        };
        let out = fs::File::create(part).await?;
        // the digest is computed on the writer side of the pipeline
        let mut writer = HashingWriter::new(out, self.algo);
        copy_all(&mut reader, &mut writer, &self.cancel)
            .await
            .map_err(Error::from_io)?;
        writer.shutdown().await?;
        let (hex, _) = writer.finalize();
        if !id.digest().as_str().starts_with(&hex) {
            error!(%id, got = %hex, "read digests don't match");
            return Err(Error::Corrupted(id.clone()));
        }
        Ok(())
    }

    /// Stores the file at `source`.
    ///
    /// The requested compression case decides the staging strategy:
    /// forced cases write one representation, `auto_now` writes both and
    /// keeps the more compact one (compressed only if it beats the raw
    /// size by more than the deflate-header penalty). The digest of the
    /// uncompressed bytes keys the entry; byte-distinct contents sharing
    /// a digest get successive collision indices.
    #[instrument(skip(self), fields(source = %source.display()), err)]
    pub async fn write(
        &self,
        source: &Path,
        level: i32,
        case: CompressionCase,
    ) -> Result<WriteOutcome> {
        if !case.is_write_request() {
            return Err(Error::InvalidRequest(format!(
                "wrong compression case '{}'",
                case.as_char()
            )));
        }
        let mut level = level;
        let (gz_stage, raw_stage) = match case {
            CompressionCase::AutoNow | CompressionCase::ForcedYes => {
                if !(1..=9).contains(&level) {
                    return Err(Error::InvalidRequest(format!(
                        "cannot compress with level = {}",
                        level
                    )));
                }
                let raw = (case == CompressionCase::AutoNow).then(|| self.staging_path(""));
                (Some(self.staging_path(entry::GZ_EXT)), raw)
            }
            _ => {
                level = 0;
                (None, Some(self.staging_path("")))
            }
        };

        // source → hasher → { gz writer, raw writer }, each behind its own
        // queue so the slow sink does not stall its sibling
        let source_file = fs::File::open(source).await?;
        let mut reader = HashingReader::new(source_file, self.algo);
        let mut fanout = MultiWriter::new();
        if let Some(path) = &gz_stage {
            let file = fs::File::create(path).await?;
            fanout.push("gz-stage", AsyncQueueWriter::new(gzip_writer(file, level)));
        }
        if let Some(path) = &raw_stage {
            let file = fs::File::create(path).await?;
            fanout.push("raw-stage", AsyncQueueWriter::new(file));
        }
        let copied = copy_all(&mut reader, &mut fanout, &self.cancel).await;
        let closed = fanout.shutdown().await;
        let (source_hex, _) = reader.finalize();
        let source_size = match (copied, closed) {
            (Ok(n), Ok(())) => n as i64,
            (Err(e), _) | (_, Err(e)) => {
                self.discard(&gz_stage).await;
                self.discard(&raw_stage).await;
                return Err(Error::from_io(e));
            }
        };
        let digest: Digest = source_hex.parse()?;

        // pick the representation to keep
        let selected = self
            .select_representation(gz_stage, raw_stage, case, level)
            .await;
        let (staged, staged_gz, size_cmp, case, level) = match selected {
            Ok(sel) => sel,
            Err(e) => return Err(e),
        };

        let placed = self
            .place_staged(&digest, &staged, staged_gz, size_cmp, case, level, source_size)
            .await;
        if placed.is_err() {
            let _ = fs::remove_file(&staged).await;
        }
        placed
    }

    async fn discard(&self, path: &Option<PathBuf>) {
        if let Some(path) = path {
            let _ = fs::remove_file(path).await;
        }
    }

    /// For `auto_now`, keeps the smaller of the two staged files, charging
    /// the compressed one ~1.6% for the header amortization; otherwise
    /// just reports the single staged file.
    async fn select_representation(
        &self,
        gz_stage: Option<PathBuf>,
        raw_stage: Option<PathBuf>,
        case: CompressionCase,
        level: i32,
    ) -> Result<(PathBuf, bool, i64, CompressionCase, i32)> {
        match (gz_stage, raw_stage) {
            (Some(gz), Some(raw)) => {
                let sizes = async {
                    Ok::<_, Error>((
                        fs::metadata(&gz).await?.len() as i64,
                        fs::metadata(&raw).await?.len() as i64,
                    ))
                }
                .await;
                let (gz_size, raw_size) = match sizes {
                    Ok(sizes) => sizes,
                    Err(e) => {
                        let _ = fs::remove_file(&gz).await;
                        let _ = fs::remove_file(&raw).await;
                        return Err(e);
                    }
                };
                let gz_penalized = gz_size + (gz_size >> 6);
                debug!(
                    raw = raw_size,
                    gz = gz_size,
                    penalized = gz_penalized,
                    "checking staged sizes"
                );
                if raw_size <= gz_penalized {
                    let _ = fs::remove_file(&gz).await;
                    Ok((raw, false, gz_penalized, CompressionCase::SizeNo, 0))
                } else {
                    let _ = fs::remove_file(&raw).await;
                    Ok((gz, true, gz_size, CompressionCase::SizeYes, level))
                }
            }
            (Some(gz), None) => match fs::metadata(&gz).await {
                Ok(meta) => Ok((gz, true, meta.len() as i64, case, level)),
                Err(e) => {
                    let _ = fs::remove_file(&gz).await;
                    Err(Error::Io(e))
                }
            },
            (None, Some(raw)) => match fs::metadata(&raw).await {
                Ok(meta) => Ok((raw, false, meta.len() as i64, case, level)),
                Err(e) => {
                    let _ = fs::remove_file(&raw).await;
                    Err(Error::Io(e))
                }
            },
            (None, None) => unreachable!("write always stages at least one file"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_staged(
        &self,
        digest: &Digest,
        staged: &Path,
        staged_gz: bool,
        size_cmp: i64,
        case: CompressionCase,
        level: i32,
        source_size: i64,
    ) -> Result<WriteOutcome> {
        let family = entry::family_path(&self.root, digest);
        if let Some(parent) = family.parent() {
            fs::create_dir_all(parent).await?;
        }

        // collision search: first index whose content matches ours, or the
        // first free one
        let mut index = 0u32;
        let mut existing_payload: Option<(PathBuf, bool)> = None;
        let status = loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let id = ContentId::new(digest.clone(), index);
            let dir = entry::entry_path(&self.root, &id);
            if !fs::try_exists(&dir).await? {
                break WriteStatus::Add;
            }
            let Some((payload, payload_gz)) = entry::find_payload(&dir).await? else {
                break WriteStatus::Add;
            };
            let mut ours = open_payload_reader(staged, staged_gz).await?;
            let mut theirs = open_payload_reader(&payload, payload_gz).await?;
            let same = compare(&mut ours, &mut theirs, &self.cancel)
                .await
                .map_err(Error::from_io)?;
            if !same {
                index += 1;
                continue;
            }
            let payload_size = fs::metadata(&payload).await?.len() as i64;
            existing_payload = Some((payload, payload_gz));
            // an empty compressed payload is pure overhead
            if payload_size == 0 && payload_gz {
                break WriteStatus::Replace;
            }
            if size_cmp < payload_size {
                break WriteStatus::Replace;
            }
            break WriteStatus::Leave;
        };

        let id = ContentId::new(digest.clone(), index);
        let dir = entry::entry_path(&self.root, &id);
        let payload_name = if staged_gz {
            format!("{}{}", entry::DATA_FILE, entry::GZ_EXT)
        } else {
            entry::DATA_FILE.to_string()
        };
        match status {
            WriteStatus::Add | WriteStatus::Replace => {
                debug!(
                    %id,
                    compressed = staged_gz,
                    replace = status == WriteStatus::Replace,
                    "storing data"
                );
                match fs::create_dir(&dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(Error::Io(e)),
                }
                if status == WriteStatus::Replace {
                    if let Some((payload, _)) = &existing_payload {
                        fs::remove_file(payload).await?;
                    }
                }
                let store_path = dir.join(&payload_name);
                fs::rename(staged, &store_path).await?;
                // metadata failure does not fail the write
                if let Err(e) = entry::write_meta(
                    &dir,
                    Meta {
                        size: source_size,
                        case,
                    },
                )
                .await
                {
                    warn!(%id, error = %e, "cannot write metadata");
                }
                if let Some(observer) = &self.observer {
                    observer.hash_added(digest.as_str());
                }
                Ok(WriteOutcome {
                    status,
                    id,
                    level,
                    store_path,
                })
            }
            WriteStatus::Leave => {
                // make sure a forced-uncompressed request is recorded
                if case == CompressionCase::ForcedNo {
                    if let Ok(meta) = entry::read_meta(&dir).await {
                        if meta.case != CompressionCase::ForcedNo {
                            let _ = entry::write_meta(&dir, Meta { case, ..meta }).await;
                        }
                    }
                }
                let _ = fs::remove_file(staged).await;
                let store_path = existing_payload
                    .map(|(p, _)| p)
                    .unwrap_or_else(|| dir.join(&payload_name));
                Ok(WriteOutcome {
                    status,
                    id,
                    level,
                    store_path,
                })
            }
        }
    }

    /// Verifies one entry.
    ///
    /// Not thorough: the payload must exist; with `repair`, quarantined
    /// entries are deleted and missing metadata is rebuilt (recursing into
    /// a thorough pass for compressed payloads).
    /// Thorough: the payload is streamed through the hasher; a mismatch or
    /// undecodable content quarantines (or with `repair` deletes) the
    /// entry. Metadata disagreeing with the observed size is rewritten.
    #[instrument(skip(self), err)]
    pub async fn check(&self, id: &ContentId, thorough: bool, repair: bool) -> Result<CheckReport> {
        Self::require_storable(id)?;
        let dir = entry::entry_path(&self.root, id);
        let payload = entry::find_payload(&dir).await?;
        let Some((payload, compressed)) = payload else {
            error!(%id, "data missing");
            if repair {
                let _ = self.remove_entry(&dir, id).await;
            }
            return Err(Error::NotFound(id.clone()));
        };
        if entry::is_corrupted(&dir).await? {
            warn!(%id, "data corruption previously reported");
            if repair {
                self.remove_entry(&dir, id).await?;
                info!(%id, "removed corrupted data");
            }
            return Err(Error::Corrupted(id.clone()));
        }
        if thorough {
            self.check_thorough(&dir, &payload, compressed, id, repair)
                .await
        } else {
            self.check_quick(&dir, &payload, compressed, id, repair)
                .await
        }
    }

    async fn check_thorough(
        &self,
        dir: &Path,
        payload: &Path,
        compressed: bool,
        id: &ContentId,
        repair: bool,
    ) -> Result<CheckReport> {
        let file_size = fs::metadata(payload).await?.len() as i64;
        let file = fs::File::open(payload).await?;
        let inner: Box<dyn AsyncRead + Send + Unpin> = if compressed {
            Box::new(gzip_reader(file))
        } else {
            Box::new(file)
        };
        let mut reader = HashingReader::new(inner, self.algo);
        let mut sink = tokio::io::sink();
        let copied = match copy_all(&mut reader, &mut sink, &self.cancel).await {
            Ok(n) => n as i64,
            Err(e) if is_payload_damage(&e) => {
                error!(%id, error = %e, "cannot read data");
                self.quarantine(dir, id, repair).await?;
                return Err(Error::Corrupted(id.clone()));
            }
            Err(e) => return Err(Error::from_io(e)),
        };
        let (hex, _) = reader.finalize();
        if !id.digest().as_str().starts_with(&hex) {
            error!(%id, got = %hex, "data corrupted");
            self.quarantine(dir, id, repair).await?;
            return Err(Error::Corrupted(id.clone()));
        }
        let recorded = entry::read_meta(dir).await.map(|m| m.size).unwrap_or(-1);
        if recorded != copied {
            if recorded >= 0 {
                error!(%id, "correcting wrong metadata");
            } else {
                warn!(%id, "adding missing metadata");
            }
            entry::write_meta(
                dir,
                Meta {
                    size: copied,
                    case: CompressionCase::Unknown,
                },
            )
            .await?;
        }
        Ok(CheckReport {
            data_size: copied,
            file_size,
        })
    }

    async fn check_quick(
        &self,
        dir: &Path,
        payload: &Path,
        compressed: bool,
        id: &ContentId,
        repair: bool,
    ) -> Result<CheckReport> {
        let mut data_size = entry::read_meta(dir).await.map(|m| m.size).unwrap_or(-1);
        let file_size = fs::metadata(payload)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or(-1);
        if data_size < 0 {
            if !repair {
                error!(%id, "metadata missing");
            } else if !compressed {
                warn!(%id, "setting missing metadata");
                data_size = file_size;
                entry::write_meta(
                    dir,
                    Meta {
                        size: data_size,
                        case: CompressionCase::Unknown,
                    },
                )
                .await?;
            } else {
                // compressed payload: only a thorough pass knows the
                // uncompressed size
                return self.check_thorough(dir, payload, compressed, id, true).await;
            }
        }
        Ok(CheckReport {
            data_size,
            file_size,
        })
    }

    async fn quarantine(&self, dir: &Path, id: &ContentId, repair: bool) -> Result<()> {
        if repair {
            self.remove_entry(dir, id).await?;
            info!(%id, "removed corrupted data");
        } else {
            entry::mark_corrupted(dir).await?;
            info!(%id, "reported corruption");
        }
        Ok(())
    }

    /// Deletes an entry. A non-existent entry is a warning, not an error.
    #[instrument(skip(self), err)]
    pub async fn remove(&self, id: &ContentId) -> Result<RemoveStatus> {
        Self::require_storable(id)?;
        let dir = entry::entry_path(&self.root, id);
        if !fs::try_exists(&dir).await? {
            warn!(%id, "no such entry");
            return Ok(RemoveStatus::NotThere);
        }
        self.remove_entry(&dir, id).await?;
        Ok(RemoveStatus::Removed)
    }

    async fn remove_entry(&self, dir: &Path, id: &ContentId) -> Result<()> {
        let res = match entry::find_payload(dir).await? {
            Some((payload, _)) => fs::remove_file(&payload).await.map_err(Error::Io),
            None => Ok(()),
        };
        // sidecars and the directory itself are best-effort
        let _ = fs::remove_file(entry::corrupted_path(dir)).await;
        let _ = fs::remove_file(dir.join(entry::META_FILE)).await;
        let _ = fs::remove_dir(dir).await;
        if let Some(observer) = &self.observer {
            observer.hash_removed(id.digest().as_str());
        }
        res
    }

    /// Sweeps the whole store, checking every entry. Valid entries are
    /// reported through `collector` as they are found; the stats count
    /// both outcomes.
    #[instrument(skip(self, collector), err)]
    pub async fn crawl(
        &self,
        thorough: bool,
        repair: bool,
        collector: Option<mpsc::Sender<CrawlEntry>>,
    ) -> Result<CrawlStats> {
        self.upgrade().await?;
        let stats = self
            .crawl_level(
                self.root.clone(),
                0,
                String::new(),
                thorough,
                repair,
                collector.as_ref(),
            )
            .await?;
        info!(
            valid = stats.valid,
            broken = stats.broken,
            "crawled the store"
        );
        Ok(stats)
    }

    fn crawl_level<'a>(
        &'a self,
        dir: PathBuf,
        level: usize,
        prefix: String,
        thorough: bool,
        repair: bool,
        collector: Option<&'a mpsc::Sender<CrawlEntry>>,
    ) -> Pin<Box<dyn Future<Output = Result<CrawlStats>> + Send + 'a>> {
        Box::pin(async move {
            let mut stats = CrawlStats::default();
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                // raced with a concurrent remove
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
                Err(e) => return Err(Error::Io(e)),
            };
            while let Some(node) = entries.next_entry().await? {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let name = node.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') || (level == 0 && name == TMP_DIR) {
                    continue;
                }
                if !node.file_type().await?.is_dir() {
                    continue;
                }
                if level < DIR_LEVELS {
                    if name.len() != 2 || !name.chars().all(|c| c.is_ascii_hexdigit()) {
                        continue;
                    }
                    let prefix = format!("{}{}", prefix, name);
                    let sub = self
                        .crawl_level(node.path(), level + 1, prefix, thorough, repair, collector)
                        .await?;
                    stats.valid += sub.valid;
                    stats.broken += sub.broken;
                    continue;
                }
                // leaf: `<rest>-<index>`
                let id = name.rsplit_once('-').and_then(|(rest, index)| {
                    let digest: Digest = format!("{}{}", prefix, rest).parse().ok()?;
                    Some(ContentId::new(digest, index.parse().ok()?))
                });
                let Some(id) = id else {
                    warn!(dir = %node.path().display(), "foreign directory in store");
                    stats.broken += 1;
                    continue;
                };
                match self.check(&id, thorough, repair).await {
                    Ok(report) => {
                        stats.valid += 1;
                        if let Some(tx) = collector {
                            let entry = CrawlEntry {
                                id,
                                data_size: report.data_size,
                                file_size: report.file_size,
                            };
                            // a dropped receiver means the consumer gave up
                            tx.send(entry).await.map_err(|_| Error::Cancelled)?;
                        }
                    }
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(_) => stats.broken += 1,
                }
            }
            Ok(stats)
        })
    }

    /// One-shot re-bucketing of the legacy layout (fewer, wider directory
    /// levels) into the current scheme, guarded by the `.upgraded` marker.
    async fn upgrade(&self) -> Result<()> {
        if fs::try_exists(self.root.join(UPGRADED_MARKER)).await? {
            return Ok(());
        }
        info!(root = %self.root.display(), "upgrading store layout, please wait");
        self.upgrade_level(self.root.clone(), 0).await?;
        fs::write(self.root.join(UPGRADED_MARKER), b"").await?;
        Ok(())
    }

    fn upgrade_level<'a>(
        &'a self,
        dir: PathBuf,
        level: usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if level >= DIR_LEVELS {
                return Ok(());
            }
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(node) = entries.next_entry().await? {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let name = node.file_name();
                let Some(name) = name.to_str().map(str::to_owned) else {
                    continue;
                };
                // legacy empty-bucket marker
                if name == ".nofiles" {
                    let _ = fs::remove_file(node.path()).await;
                    continue;
                }
                if name.starts_with('.') || (level == 0 && name == TMP_DIR) {
                    continue;
                }
                if !node.file_type().await?.is_dir() {
                    continue;
                }
                if name.len() > 2 {
                    let bucket = dir.join(&name[..2]);
                    match fs::create_dir(&bucket).await {
                        Ok(()) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                        Err(e) => return Err(Error::Io(e)),
                    }
                    let target = bucket.join(&name[2..]);
                    fs::rename(node.path(), &target).await?;
                    self.upgrade_level(bucket, level + 1).await?;
                } else {
                    self.upgrade_level(node.path(), level + 1).await?;
                }
            }
            Ok(())
        })
    }
}

async fn open_payload_reader(
    path: &Path,
    compressed: bool,
) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    let file = fs::File::open(path).await?;
    Ok(if compressed {
        Box::new(gzip_reader(file))
    } else {
        Box::new(file)
    })
}

/// Whether a pipeline error means the payload itself is damaged, as
/// opposed to an environmental failure worth propagating as-is.
fn is_payload_damage(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof
    )
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
