//! Wire vocabulary of the data protocol: frame tags, method codes and the
//! errno-flavored status values carried in STATUS frames.

use enum_primitive_derive::Primitive;

/// Data frame tags. 1..=10 frame the request itself, 11..=19 carry
/// operation fields, 20..=29 belong to the crawl collector stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum Tag {
    Method = 1,
    Status = 2,
    Hash = 11,
    Path = 12,
    Extension = 13,
    CompressionLevel = 14,
    CompressionCase = 15,
    StorePath = 16,
    Thorough = 17,
    Repair = 18,
    Collector = 20,
    CollectorHash = 21,
    CollectorData = 22,
    CollectorFile = 23,
}

impl Tag {
    pub fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum Method {
    Name = 1,
    Read = 2,
    Write = 3,
    Remove = 4,
    Crawl = 5,
    Progress = 6,
}

/// Status codes follow the POSIX errno convention: 0 is success, positive
/// values name the failure class. WRITE responses instead carry the write
/// status, with -1 for a failed write.
pub mod status {
    use crate::errors::Error;

    pub const OK: i64 = 0;
    pub const ENOENT: i64 = 2;
    pub const EIO: i64 = 5;
    pub const EINVAL: i64 = 22;
    pub const ENOSYS: i64 = 38;
    pub const EUCLEAN: i64 = 117;
    pub const ECANCELED: i64 = 125;

    /// Positive sentinel: remove of an entry that was not there.
    pub const NOT_THERE: i64 = 1;

    pub fn of_error(err: &Error) -> i64 {
        match err {
            Error::NotFound(_) => ENOENT,
            Error::Corrupted(_) => EUCLEAN,
            Error::InvalidRequest(_) => EINVAL,
            Error::Cancelled => ECANCELED,
            Error::Io(e) if e.kind() == std::io::ErrorKind::Interrupted => ECANCELED,
            Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ENOENT,
            Error::Io(_) => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use num_traits::{FromPrimitive, ToPrimitive};

    use super::*;

    #[test]
    fn tags_match_the_wire_numbers() {
        assert_eq!(Tag::Method.code(), 1);
        assert_eq!(Tag::Status.code(), 2);
        assert_eq!(Tag::Hash.code(), 11);
        assert_eq!(Tag::CollectorFile.code(), 23);
        assert_eq!(Tag::from_u8(16), Some(Tag::StorePath));
        assert_eq!(Tag::from_u8(99), None);
    }

    #[test]
    fn methods_match_the_wire_numbers() {
        assert_eq!(Method::Name.to_i64(), Some(1));
        assert_eq!(Method::Progress.to_i64(), Some(6));
        assert_eq!(Method::from_i64(5), Some(Method::Crawl));
        assert_eq!(Method::from_i64(7), None);
    }
}
