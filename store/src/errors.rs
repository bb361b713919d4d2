//! Errors surfaced by store operations.

use thiserror::Error;

use crate::digests::ContentId;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("no data for {0}")]
    NotFound(ContentId),

    #[error("data corrupted for {0}")]
    Corrupted(ContentId),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Collapses the io-flavored cancellation produced inside pipelines
    /// into [Error::Cancelled].
    pub(crate) fn from_io(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::Interrupted {
            Error::Cancelled
        } else {
            Error::Io(e)
        }
    }
}

impl From<crate::digests::Error> for Error {
    fn from(e: crate::digests::Error) -> Self {
        Error::InvalidRequest(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
