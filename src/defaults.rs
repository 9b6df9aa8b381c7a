//! Default configuration constants for levelflow.
//!
//! Shared by the configuration file, the CLI and the pipeline builder so the
//! three agree on every default.

/// Seconds of data a level holds when its capacity is left to the pipeline.
///
/// Two seconds covers the latency of every component in the demo pipeline
/// with room to spare.
pub const CAPACITY_SEC: f64 = 2.0;

/// Capacity in frames for aperiodic levels whose capacity is automatic.
pub const APERIODIC_CAPACITY: usize = 100;

/// Number of configure passes before a pipeline that keeps answering
/// "not ready" is declared stalled.
pub const CONFIGURE_PASSES: u32 = 8;

/// Milliseconds the scheduler waits for an external source before treating
/// an idle round as empty.
pub const EXTERNAL_WAIT_MS: u64 = 50;

/// Rounds a vetoed pause request is retried before it is dropped.
pub const PAUSE_RETRY_ROUNDS: u32 = 100;

/// Sample rate assumed for raw PCM on stdin.
pub const SAMPLE_RATE: u32 = 16000;

/// Length of one analysis frame in seconds.
pub const FRAME_SIZE_SEC: f64 = 0.025;

/// Hop between analysis frames in seconds.
pub const FRAME_STEP_SEC: f64 = 0.010;

/// Seconds of PCM a source writes per tick.
pub const SOURCE_BLOCK_SEC: f64 = 0.1;

/// RMS energy above which a frame counts as voiced.
pub const TURN_THRESHOLD: f64 = 0.001;

/// Consecutive voiced frames needed to start a turn.
pub const TURN_MIN_FRAMES: usize = 10;

/// Consecutive unvoiced frames needed to end a turn.
pub const TURN_GAP_FRAMES: usize = 20;

/// Frames a turn open at end of input is assumed to be missing.
pub const TURN_EOI_FRAMES_MISSING: u64 = 5;

/// Floor applied before taking the log of frame energy.
pub const LOG_ENERGY_FLOOR: f64 = 1e-12;

/// Rows the CSV writer thread may lag behind the pipeline.
pub const CSV_QUEUE_ROWS: usize = 1024;

/// Chunks of live audio buffered between the feeder and the pipeline.
pub const LIVE_QUEUE_CHUNKS: usize = 64;
