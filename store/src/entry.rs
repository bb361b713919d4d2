//! On-disk layout of one entry: the digest-derived directory, the payload
//! file, and the `meta` / `corrupted` sidecars.
//!
//! For a digest `h0h1 h2h3 h4h5 h6h7 rest…` and index `n` the entry lives
//! at `<root>/h0h1/h2h3/h4h5/h6h7/rest-n/`.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::comp::CompressionCase;
use crate::digests::{ContentId, Digest, DIR_LEVEL_CHARS};

pub(crate) const DATA_FILE: &str = "data";
pub(crate) const GZ_EXT: &str = ".gz";
pub(crate) const META_FILE: &str = "meta";
pub(crate) const CORRUPTED_FILE: &str = "corrupted";

/// Directory holding all indices of a digest, without the `-<n>` suffix on
/// the leaf component.
pub(crate) fn family_path(root: &Path, digest: &Digest) -> PathBuf {
    let s = digest.as_str();
    let mut path = root.to_path_buf();
    let mut at = 0;
    while at < DIR_LEVEL_CHARS && at + 2 <= s.len() {
        path.push(&s[at..at + 2]);
        at += 2;
    }
    path.push(&s[at..]);
    path
}

/// Directory of one entry: the family path with `-<index>` appended to its
/// leaf component.
pub(crate) fn entry_path(root: &Path, id: &ContentId) -> PathBuf {
    let mut path = family_path(root, id.digest());
    let leaf = match path.file_name() {
        Some(name) => format!("{}-{}", name.to_string_lossy(), id.index()),
        None => format!("-{}", id.index()),
    };
    path.set_file_name(leaf);
    path
}

/// Locates the payload inside an entry directory. Returns the file path
/// and whether it is the compressed representation.
pub(crate) async fn find_payload(dir: &Path) -> io::Result<Option<(PathBuf, bool)>> {
    let raw = dir.join(DATA_FILE);
    if fs::try_exists(&raw).await? {
        return Ok(Some((raw, false)));
    }
    let gz = dir.join(format!("{}{}", DATA_FILE, GZ_EXT));
    if fs::try_exists(&gz).await? {
        return Ok(Some((gz, true)));
    }
    Ok(None)
}

/// Contents of the `meta` sidecar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Uncompressed payload size; -1 when unknown.
    pub size: i64,
    pub case: CompressionCase,
}

/// Reads `meta`. A line without the case character still parses (the case
/// becomes [CompressionCase::Unknown]), and trailing tab-separated fields
/// are tolerated.
pub(crate) async fn read_meta(dir: &Path) -> io::Result<Meta> {
    let raw = fs::read_to_string(dir.join(META_FILE)).await?;
    let line = raw.lines().next().unwrap_or("");
    let mut fields = line.split('\t');
    let size = fields
        .next()
        .and_then(|f| f.parse::<i64>().ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("metadata broken in {}", dir.display()),
            )
        })?;
    let case = fields
        .next()
        .and_then(|f| f.chars().next())
        .and_then(CompressionCase::from_char)
        .unwrap_or(CompressionCase::Unknown);
    Ok(Meta { size, case })
}

pub(crate) async fn write_meta(dir: &Path, meta: Meta) -> io::Result<()> {
    fs::write(
        dir.join(META_FILE),
        format!("{}\t{}", meta.size, meta.case.as_char()),
    )
    .await
}

pub(crate) fn corrupted_path(dir: &Path) -> PathBuf {
    dir.join(CORRUPTED_FILE)
}

pub(crate) async fn is_corrupted(dir: &Path) -> io::Result<bool> {
    fs::try_exists(corrupted_path(dir)).await
}

pub(crate) async fn mark_corrupted(dir: &Path) -> io::Result<()> {
    fs::write(corrupted_path(dir), b"").await
}
