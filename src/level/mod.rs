//! Levels: the stream buffers connecting pipeline components.
//!
//! A level stores frames of a fixed width on a timeline of absolute frame
//! indices. One writer appends at `curW`; each registered reader consumes at
//! its own `curR`. Ring levels keep the most recent `capacity` frames and
//! never overwrite a frame some reader has not consumed, unless the hang
//! policy allows eviction.

mod buffer;
mod error;
mod frame;
mod gate;
mod handle;
mod index;
mod meta;
mod store;

pub use buffer::{HangPolicy, Level, LevelConfig, LevelStats, ReaderId};
pub use error::LevelError;
pub use frame::{Block, Frame, Sample};
pub use handle::{LevelReader, LevelWriter};
pub use index::{Index, Padding, Side};
pub use meta::{DataType, FieldLayout, FieldMetaInfo, FrameTag, TimeMetaInfo};
