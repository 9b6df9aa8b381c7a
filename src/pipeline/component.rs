//! The component trait and the scheduler-facing tick result codes.

use super::context::{Registrar, TickContext};
use super::error::ComponentError;
use super::message::Message;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Outcome of one tick. The numeric codes are stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum TickResult {
    /// Nothing to do.
    Inactive = 0,
    /// Made progress.
    Success = 1,
    /// Waiting for an upstream level.
    SourceNotAvailable = 2,
    /// Waiting for data from outside the pipeline.
    ExternalSourceNotAvailable = 3,
    /// Waiting for room in an output level.
    DestNoSpace = 4,
    /// Waiting for room in something outside the pipeline.
    ExternalDestNoSpace = 5,
}

impl TickResult {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => TickResult::Inactive,
            1 => TickResult::Success,
            2 => TickResult::SourceNotAvailable,
            3 => TickResult::ExternalSourceNotAvailable,
            4 => TickResult::DestNoSpace,
            5 => TickResult::ExternalDestNoSpace,
            _ => return None,
        })
    }

    pub fn is_progress(self) -> bool {
        self == TickResult::Success
    }

    /// Waiting on something outside the pipeline.
    pub fn is_external(self) -> bool {
        matches!(
            self,
            TickResult::ExternalSourceNotAvailable | TickResult::ExternalDestNoSpace
        )
    }

    pub fn is_dest_stall(self) -> bool {
        matches!(
            self,
            TickResult::DestNoSpace | TickResult::ExternalDestNoSpace
        )
    }
}

impl fmt::Display for TickResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TickResult::Inactive => "inactive",
            TickResult::Success => "success",
            TickResult::SourceNotAvailable => "source-not-available",
            TickResult::ExternalSourceNotAvailable => "external-source-not-available",
            TickResult::DestNoSpace => "dest-no-space",
            TickResult::ExternalDestNoSpace => "external-dest-no-space",
        };
        f.write_str(name)
    }
}

/// Lifecycle position of a component inside a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentState {
    Unregistered,
    Registered,
    Configured,
    Finalized,
    Ready,
}

/// A unit of work driven by the scheduler.
///
/// Lifecycle: `register` (claim levels) → `configure` (describe output
/// fields, inspect upstream layouts) → `finalize` → repeated `tick`s.
/// Only `name` and `tick` are required.
pub trait Component: Send {
    fn name(&self) -> &str;

    /// Claims reader and writer handles on levels.
    fn register(&mut self, _reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        Ok(())
    }

    /// Returns `Ok(false)` when an upstream layout is not known yet; the
    /// pipeline calls again on its next configure pass.
    fn configure(&mut self) -> Result<bool, ComponentError> {
        Ok(true)
    }

    /// Called once every level is allocated.
    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError>;

    /// Returns false to veto a pause.
    fn pause_event(&mut self) -> bool {
        true
    }

    fn resume_event(&mut self) {}

    /// Handles a message; returns whether it was understood. Must not block.
    fn handle_message(&mut self, _msg: &Message<'_>) -> bool {
        false
    }

    /// Called when a round made no progress. Returning true keeps the
    /// pipeline from treating the round as empty.
    fn notify_empty_tickloop(&mut self) -> bool {
        false
    }

    /// Called once after the tick loop ends.
    fn shutdown(&mut self) {}
}

/// A component as shared between the scheduler and the message bus.
pub type SharedComponent = Arc<Mutex<Box<dyn Component>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_codes_are_stable() {
        let all = [
            (TickResult::Inactive, 0),
            (TickResult::Success, 1),
            (TickResult::SourceNotAvailable, 2),
            (TickResult::ExternalSourceNotAvailable, 3),
            (TickResult::DestNoSpace, 4),
            (TickResult::ExternalDestNoSpace, 5),
        ];
        for (result, code) in all {
            assert_eq!(result.code(), code);
            assert_eq!(TickResult::from_code(code), Some(result));
        }
        assert_eq!(TickResult::from_code(6), None);
    }

    #[test]
    fn classification() {
        assert!(TickResult::Success.is_progress());
        assert!(!TickResult::DestNoSpace.is_progress());
        assert!(TickResult::ExternalSourceNotAvailable.is_external());
        assert!(TickResult::ExternalDestNoSpace.is_external());
        assert!(!TickResult::SourceNotAvailable.is_external());
        assert!(TickResult::DestNoSpace.is_dest_stall());
    }

    #[test]
    fn display_names() {
        assert_eq!(TickResult::DestNoSpace.to_string(), "dest-no-space");
        assert_eq!(
            TickResult::ExternalSourceNotAvailable.to_string(),
            "external-source-not-available"
        );
    }

    #[test]
    fn states_are_ordered() {
        assert!(ComponentState::Unregistered < ComponentState::Registered);
        assert!(ComponentState::Finalized < ComponentState::Ready);
    }
}
