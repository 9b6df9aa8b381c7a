//! levelflow - tick-scheduled streaming signal pipelines
//!
//! Components exchange frames through shared levels (ring or growable
//! stream buffers with one writer and many readers) and are driven by a
//! cooperative tick loop that detects end of input and drains the pipeline.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod clock;
pub mod components;
pub mod config;
pub mod defaults;
pub mod error;
pub mod level;
pub mod pipeline;

// Levels
pub use level::{
    Block, Frame, Index, Level, LevelConfig, LevelError, LevelReader, LevelWriter, Padding,
};

// Pipeline
pub use pipeline::{
    Component, ComponentError, Message, MessageBus, Pipeline, PipelineConfig, PipelineHandle,
    RunOutcome, RunSummary, TickContext, TickResult,
};

// Error handling
pub use error::{LevelflowError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
