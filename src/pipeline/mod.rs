//! Component runtime: lifecycle, tick scheduling, messaging and the worker
//! primitives components use to talk to threads outside the tick loop.
//!
//! Components are ticked round-robin on a single scheduler thread and
//! exchange data only through [`Level`](crate::level::Level)s.

pub mod component;
pub mod context;
pub mod control;
pub mod error;
pub mod message;
pub mod scheduler;
pub mod worker;

pub use component::{Component, ComponentState, SharedComponent, TickResult};
pub use context::{Registrar, TickContext};
pub use control::{PipelineHandle, SchedulerControl};
pub use error::{ComponentError, ErrorReporter, LogReporter};
pub use message::{Message, MessageBus, MessageError, Payload, PayloadData, PayloadView};
pub use scheduler::{LevelPolicy, Pipeline, PipelineConfig, RunOutcome, RunSummary};
pub use worker::{Signal, WaitOutcome};
