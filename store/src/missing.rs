//! Persisted list of digests known to be missing or inconsistent.
//!
//! One record per line, `<digest>\t<m|i>\t<size>`, kept in ascending
//! digest order with no duplicates. Legacy files carrying bare digests
//! still load (as missing, size -1). Saving writes `<path>.part` and
//! renames it into place; records marked recovered are dropped from the
//! rewritten file.

use std::io;
use std::path::{Path, PathBuf};

use hbackup_io::{LineReader, LineWriter};
use tokio::fs;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingStatus {
    Missing,
    Inconsistent,
    Recovered,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MissingRecord {
    pub digest: String,
    pub status: MissingStatus,
    pub size: i64,
}

impl MissingRecord {
    fn line(&self) -> String {
        let status = match self.status {
            MissingStatus::Missing => 'm',
            _ => 'i',
        };
        format!("{}\t{}\t{}", self.digest, status, self.size)
    }
}

#[derive(Default)]
pub struct MissingList {
    path: Option<PathBuf>,
    records: Vec<MissingRecord>,
    modified: bool,
    force_save: bool,
}

impl MissingList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the list to its backing file and loads it if present.
    pub async fn open(&mut self, path: impl Into<PathBuf>) -> io::Result<()> {
        self.path = Some(path.into());
        self.records.clear();
        self.modified = false;
        self.force_save = false;
        self.load().await
    }

    async fn load(&mut self) -> io::Result<()> {
        let path = self.path.clone().expect("list not open");
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        debug!(path = %path.display(), "reading list of problematic digests");
        let mut lines = LineReader::new(file, b'\n');
        while let Some((line, _)) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let mut fields = text.split('\t');
            let digest = fields.next().unwrap_or("").to_string();
            match (fields.next(), fields.next()) {
                // legacy single-field line
                (None, _) => self.insert(MissingRecord {
                    digest,
                    status: MissingStatus::Missing,
                    size: -1,
                }),
                (Some(status), size) => {
                    let size = size.and_then(|s| s.parse::<i64>().ok()).unwrap_or(-1);
                    match status.chars().next() {
                        Some('m') => self.insert(MissingRecord {
                            digest,
                            status: MissingStatus::Missing,
                            size: -1,
                        }),
                        Some('i') => self.insert(MissingRecord {
                            digest,
                            status: MissingStatus::Inconsistent,
                            size,
                        }),
                        _ => warn!(line = %text, "unrecognized record identifier"),
                    }
                }
            }
        }
        self.modified = false;
        Ok(())
    }

    /// Inserts keeping digest order; an already-listed digest is left as
    /// it is.
    fn insert(&mut self, record: MissingRecord) {
        match self
            .records
            .binary_search_by(|r| r.digest.as_str().cmp(&record.digest))
        {
            Ok(_) => {}
            Err(at) => self.records.insert(at, record),
        }
    }

    /// Binary search by digest.
    pub fn search(&self, digest: &str) -> Option<usize> {
        self.records
            .binary_search_by(|r| r.digest.as_str().cmp(digest))
            .ok()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&MissingRecord> {
        self.records.get(id)
    }

    pub fn is_missing(&self, id: usize) -> bool {
        matches!(
            self.records.get(id).map(|r| r.status),
            Some(MissingStatus::Missing)
        )
    }

    pub fn is_inconsistent(&self, id: usize) -> bool {
        matches!(
            self.records.get(id).map(|r| r.status),
            Some(MissingStatus::Inconsistent)
        )
    }

    pub fn data_size(&self, id: usize) -> i64 {
        self.records.get(id).map(|r| r.size).unwrap_or(-1)
    }

    pub fn set_missing(&mut self, digest: impl Into<String>) {
        self.insert(MissingRecord {
            digest: digest.into(),
            status: MissingStatus::Missing,
            size: -1,
        });
        self.modified = true;
    }

    pub fn set_inconsistent(&mut self, digest: impl Into<String>, size: i64) {
        self.insert(MissingRecord {
            digest: digest.into(),
            status: MissingStatus::Inconsistent,
            size,
        });
        self.modified = true;
    }

    pub fn set_recovered(&mut self, id: usize) {
        if let Some(record) = self.records.get_mut(id) {
            record.status = MissingStatus::Recovered;
            self.modified = true;
        }
    }

    /// Forces the next close to rewrite the file even without changes.
    pub fn force_save(&mut self) {
        self.force_save = true;
    }

    /// Saves if dirty and detaches from the backing file.
    pub async fn close(&mut self) -> io::Result<()> {
        let Some(path) = self.path.take() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "list not open"));
        };
        let mut kept = 0usize;
        if self.modified || self.force_save {
            if self.modified {
                info!("missing digests list updated");
            }
            let part = part_path(&path);
            let file = fs::File::create(&part).await?;
            let mut out = LineWriter::new(file, b'\n');
            for record in &self.records {
                if record.status == MissingStatus::Recovered {
                    continue;
                }
                out.put_line(record.line().as_bytes()).await?;
                kept += 1;
            }
            out.shutdown().await?;
            fs::rename(&part, &path).await?;
        } else {
            kept = self.records.len();
        }
        if kept > 0 {
            info!(count = kept, "list of problematic digests is not empty");
        }
        self.records.clear();
        Ok(())
    }
}

fn part_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
