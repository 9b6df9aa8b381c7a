//! Index markers and read policies for level access.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Position on a level's timeline.
///
/// Relative variants are resolved against the cursors at the time of the call,
/// so `RelativeToWrite(-1)` always names the most recently written frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Index {
    /// Absolute frame index (vIdx).
    Absolute(u64),
    /// The caller's own read cursor (the global minimum read cursor for writes
    /// and anonymous reads).
    CurrentRead,
    /// The level's write cursor.
    CurrentWrite,
    /// Offset from the caller's read cursor.
    RelativeToRead(i64),
    /// Offset from the write cursor.
    RelativeToWrite(i64),
}

impl Index {
    /// Resolves to a signed vIdx. Negative results are legal for reads and
    /// padded at the front.
    pub fn resolve(self, cur_r: u64, cur_w: u64) -> i64 {
        match self {
            Index::Absolute(v) => to_signed(v),
            Index::CurrentRead => to_signed(cur_r),
            Index::CurrentWrite => to_signed(cur_w),
            Index::RelativeToRead(off) => to_signed(cur_r).saturating_add(off),
            Index::RelativeToWrite(off) => to_signed(cur_w).saturating_add(off),
        }
    }
}

impl From<u64> for Index {
    fn from(v: u64) -> Self {
        Index::Absolute(v)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Absolute(v) => write!(f, "{}", v),
            Index::CurrentRead => write!(f, "curR"),
            Index::CurrentWrite => write!(f, "curW"),
            Index::RelativeToRead(off) => write!(f, "curR{:+}", off),
            Index::RelativeToWrite(off) => write!(f, "curW{:+}", off),
        }
    }
}

fn to_signed(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// How a read that runs past the available data is filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Padding {
    /// Fill missing frames with zeros.
    Zero,
    /// Repeat the nearest available frame.
    #[default]
    ReplicateEdge,
    /// Truncate the result to the available frames.
    None,
}

/// Which side of the valid window a rejected range fell on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Data already evicted.
    Left,
    /// Data not yet written.
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}
