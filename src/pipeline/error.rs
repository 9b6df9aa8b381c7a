//! Error types and reporting for pipeline components.

use crate::level::LevelError;
use std::fmt;
use tracing::{error, warn};

/// Errors a component can return from a lifecycle call.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentError {
    /// The component can continue; the scheduler reports and moves on.
    Recoverable(String),
    /// The component cannot continue; the scheduler aborts the pipeline.
    Fatal(String),
}

impl ComponentError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ComponentError::Fatal(_))
    }
}

impl fmt::Display for ComponentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentError::Recoverable(msg) => write!(f, "Recoverable error: {}", msg),
            ComponentError::Fatal(msg) => write!(f, "Fatal error: {}", msg),
        }
    }
}

impl std::error::Error for ComponentError {}

impl From<LevelError> for ComponentError {
    fn from(e: LevelError) -> Self {
        if e.is_retryable() {
            ComponentError::Recoverable(e.to_string())
        } else {
            ComponentError::Fatal(e.to_string())
        }
    }
}

/// Receives errors raised by components.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, component: &str, error: &ComponentError);
}

/// Reporter that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, component: &str, e: &ComponentError) {
        match e {
            ComponentError::Recoverable(msg) => warn!(component = %component, "{msg}"),
            ComponentError::Fatal(msg) => error!(component = %component, "{msg}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::Side;

    #[test]
    fn test_component_error_display() {
        let recoverable = ComponentError::Recoverable("temporary failure".to_string());
        assert_eq!(
            recoverable.to_string(),
            "Recoverable error: temporary failure"
        );

        let fatal = ComponentError::Fatal("critical failure".to_string());
        assert_eq!(fatal.to_string(), "Fatal error: critical failure");
    }

    #[test]
    fn test_level_error_classification() {
        let right = LevelError::OutOfRange {
            side: Side::Right,
            start: 0,
            end: 2,
        };
        assert!(!ComponentError::from(right).is_fatal());
        assert!(matches!(
            ComponentError::from(LevelError::NoSpace { needed: 1, free: 0 }),
            ComponentError::Recoverable(_)
        ));
        assert!(ComponentError::from(LevelError::AlreadyFinalized).is_fatal());
    }

    #[test]
    fn test_log_reporter() {
        let reporter = LogReporter;
        let error = ComponentError::Recoverable("test error".to_string());
        // Just ensure it doesn't panic
        reporter.report("TestComponent", &error);
    }
}
