//! Digest strings and content identifiers.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Longest accepted digest, in hex characters.
pub const MAX_DIGEST_LEN: usize = 128;

/// How many leading hex characters are consumed by the directory levels of
/// the on-disk layout.
pub const DIR_LEVEL_CHARS: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid digest length: {0}")]
    InvalidDigestLen(usize),
    #[error("digest contains a non-hex character: {0:?}")]
    NotHex(char),
    #[error("invalid collision index: {0:?}")]
    InvalidIndex(String),
}

/// A content digest: 1..=128 hex characters, canonically lowercase.
/// Parsing folds uppercase input.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s.len() > MAX_DIGEST_LEN {
            return Err(Error::InvalidDigestLen(s.len()));
        }
        if let Some(bad) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(Error::NotHex(bad));
        }
        Ok(Digest(s.to_ascii_lowercase()))
    }
}

impl AsRef<str> for Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored entry's identifier: digest plus collision index, rendered
/// `<digest>-<index>`. A bare digest parses with index 0, so callers may
/// address the common case without the suffix.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    digest: Digest,
    index: u32,
}

impl ContentId {
    pub fn new(digest: Digest, index: u32) -> Self {
        Self { digest, index }
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('-') {
            None => Ok(ContentId {
                digest: s.parse()?,
                index: 0,
            }),
            Some((digest, index)) => Ok(ContentId {
                digest: digest.parse()?,
                index: index
                    .parse()
                    .map_err(|_| Error::InvalidIndex(index.to_string()))?,
            }),
        }
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.index)
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.digest, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_parses_and_folds_case() {
        let d: Digest = "DeadBEEF00".parse().unwrap();
        assert_eq!(d.as_str(), "deadbeef00");
    }

    #[test]
    fn digest_rejects_junk() {
        assert_eq!("".parse::<Digest>(), Err(Error::InvalidDigestLen(0)));
        assert_eq!("deadbeefg0".parse::<Digest>(), Err(Error::NotHex('g')));
        let too_long = "a".repeat(MAX_DIGEST_LEN + 1);
        assert_eq!(
            too_long.parse::<Digest>(),
            Err(Error::InvalidDigestLen(MAX_DIGEST_LEN + 1))
        );
    }

    #[test]
    fn content_id_round_trips() {
        let id: ContentId = "d41d8cd98f00b204e9800998ecf8427e-2".parse().unwrap();
        assert_eq!(id.digest().as_str(), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(id.index(), 2);
        assert_eq!(id.to_string(), "d41d8cd98f00b204e9800998ecf8427e-2");
    }

    #[test]
    fn bare_digest_means_index_zero() {
        let id: ContentId = "cafe0123deadbeef".parse().unwrap();
        assert_eq!(id.index(), 0);
        assert_eq!(id.to_string(), "cafe0123deadbeef-0");
    }

    #[test]
    fn bad_index_is_rejected() {
        assert!("deadbeef-x".parse::<ContentId>().is_err());
        assert!("deadbeef--1".parse::<ContentId>().is_err());
    }
}
