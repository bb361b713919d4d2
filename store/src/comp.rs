//! Compression bookkeeping: why an entry is (or is not) compressed, and
//! the outcome codes of a write.

use enum_primitive_derive::Primitive;

/// Recorded reason for an entry's representation. The char values are what
/// the `meta` sidecar file carries, so they are part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionCase {
    /// global no
    DbNo,
    /// global yes
    DbYes,
    /// filter no
    ForcedNo,
    /// filter yes
    ForcedYes,
    /// auto no
    SizeNo,
    /// auto yes
    SizeYes,
    /// auto, needs to check
    AutoNow,
    /// auto, might check later
    AutoLater,
    /// not decided
    Unknown,
}

impl CompressionCase {
    pub fn as_char(self) -> char {
        match self {
            CompressionCase::DbNo => 'd',
            CompressionCase::DbYes => 'r',
            CompressionCase::ForcedNo => '-',
            CompressionCase::ForcedYes => 'f',
            CompressionCase::SizeNo => '.',
            CompressionCase::SizeYes => '+',
            CompressionCase::AutoNow => 'a',
            CompressionCase::AutoLater => ' ',
            CompressionCase::Unknown => '?',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            'd' => CompressionCase::DbNo,
            'r' => CompressionCase::DbYes,
            '-' => CompressionCase::ForcedNo,
            'f' => CompressionCase::ForcedYes,
            '.' => CompressionCase::SizeNo,
            '+' => CompressionCase::SizeYes,
            'a' => CompressionCase::AutoNow,
            ' ' => CompressionCase::AutoLater,
            '?' => CompressionCase::Unknown,
            _ => return None,
        })
    }

    /// Whether this value is acceptable as a *request* to `write`. The
    /// size-derived and unknown cases only ever appear as recorded state.
    pub fn is_write_request(self) -> bool {
        matches!(
            self,
            CompressionCase::AutoNow
                | CompressionCase::AutoLater
                | CompressionCase::ForcedNo
                | CompressionCase::ForcedYes
        )
    }
}

/// Outcome of a write. On the wire this travels as its integer value, with
/// -1 standing for a failed operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Primitive)]
pub enum WriteStatus {
    Leave = 0,
    Add = 1,
    Replace = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chars_round_trip() {
        for case in [
            CompressionCase::DbNo,
            CompressionCase::DbYes,
            CompressionCase::ForcedNo,
            CompressionCase::ForcedYes,
            CompressionCase::SizeNo,
            CompressionCase::SizeYes,
            CompressionCase::AutoNow,
            CompressionCase::AutoLater,
            CompressionCase::Unknown,
        ] {
            assert_eq!(CompressionCase::from_char(case.as_char()), Some(case));
        }
        assert_eq!(CompressionCase::from_char('z'), None);
    }

    #[test]
    fn request_validity() {
        assert!(CompressionCase::AutoNow.is_write_request());
        assert!(CompressionCase::ForcedNo.is_write_request());
        assert!(!CompressionCase::SizeYes.is_write_request());
        assert!(!CompressionCase::Unknown.is_write_request());
    }
}
