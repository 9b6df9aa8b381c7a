//! Ready-made components: sources, per-frame processors and sinks.
//!
//! Each component is a small struct implementing
//! [`Component`](crate::pipeline::Component) and names the levels it reads and
//! writes at construction.

pub mod csv_sink;
pub mod energy;
pub mod framer;
pub mod functionals;
pub mod live;
pub mod null_sink;
pub mod turn;
pub mod wave;

pub use csv_sink::CsvSink;
pub use energy::Energy;
pub use framer::Framer;
pub use functionals::Functionals;
pub use live::{LiveFeed, LiveSource};
pub use null_sink::NullSink;
pub use turn::{TurnDetector, TurnEvent};
pub use wave::WaveSource;

use crate::level::{Block, LevelWriter};
use crate::pipeline::{ComponentError, TickResult};

/// Writes `block`, mapping a full level to `DestNoSpace`.
pub(crate) fn write_or_stall(
    out: &LevelWriter,
    block: &Block,
) -> Result<TickResult, ComponentError> {
    match out.write(block) {
        Ok(()) => Ok(TickResult::Success),
        Err(e) if e.is_retryable() => Ok(TickResult::DestNoSpace),
        Err(e) => Err(e.into()),
    }
}

/// Handle that was only assigned in `register`.
pub(crate) fn registered<'a, T>(handle: &'a Option<T>, component: &str) -> Result<&'a T, ComponentError> {
    handle
        .as_ref()
        .ok_or_else(|| ComponentError::Fatal(format!("{component} ticked before registration")))
}

pub(crate) fn registered_mut<'a, T>(
    handle: &'a mut Option<T>,
    component: &str,
) -> Result<&'a mut T, ComponentError> {
    handle
        .as_mut()
        .ok_or_else(|| ComponentError::Fatal(format!("{component} ticked before registration")))
}
