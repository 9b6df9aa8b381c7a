//! Level error taxonomy.

use super::index::Side;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LevelError {
    #[error("range [{start}, {end}) out of range ({side})")]
    OutOfRange { side: Side, start: i64, end: i64 },

    #[error("invalid index {index}")]
    InvalidIndex { index: i64 },

    #[error("write at {vidx} would overwrite live data (minR = {min_r})")]
    WouldOverwriteLiveData { vidx: i64, min_r: u64 },

    #[error("no space: {needed} frame(s) needed, {free} free")]
    NoSpace { needed: usize, free: usize },

    #[error("level is already finalized")]
    AlreadyFinalized,

    #[error("level is not finalized")]
    NotFinalized,

    #[error("capacity {requested} is below the required minimum of {required} frames")]
    CapacityTooSmall { requested: usize, required: usize },

    #[error("frame width mismatch: expected {expected}, got {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    #[error("level has no fields")]
    NoFields,

    #[error("duplicate field '{name}'")]
    DuplicateField { name: String },

    #[error("unknown reader id {id}")]
    UnknownReader { id: usize },

    #[error("failed to allocate {capacity} frames")]
    AllocationFailed { capacity: usize },

    #[error("level lock poisoned")]
    Poisoned,
}

impl LevelError {
    /// Flow-control conditions that resolve by retrying on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LevelError::OutOfRange {
                side: Side::Right,
                ..
            } | LevelError::NoSpace { .. }
        )
    }

    /// Conditions after which the level's timeline can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LevelError::AllocationFailed { .. } | LevelError::Poisoned
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for LevelError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        LevelError::Poisoned
    }
}
