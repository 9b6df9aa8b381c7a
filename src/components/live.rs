//! Source fed from outside the pipeline, e.g. a capture callback or a stdin
//! reader thread.

use super::{registered, write_or_stall};
use crate::defaults;
use crate::level::{Block, DataType, FieldMetaInfo, LevelConfig, LevelWriter, Sample};
use crate::pipeline::{Component, ComponentError, Registrar, Signal, TickContext, TickResult};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct FeedState {
    paused: AtomicBool,
    dropped: AtomicU64,
    wake: OnceLock<Arc<Signal>>,
}

impl FeedState {
    fn wake(&self) {
        if let Some(signal) = self.wake.get() {
            signal.notify();
        }
    }
}

/// Producer side of a [`LiveSource`]. Dropping every feed ends the input.
#[derive(Debug, Clone)]
pub struct LiveFeed {
    tx: Sender<Vec<Sample>>,
    state: Arc<FeedState>,
}

impl LiveFeed {
    /// Queues a chunk without blocking. While the pipeline is paused chunks
    /// are dropped. A rejected chunk is handed back in the error.
    pub fn push(&self, chunk: Vec<Sample>) -> Result<(), TrySendError<Vec<Sample>>> {
        if self.state.paused.load(Ordering::SeqCst) {
            self.state.dropped.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            return Ok(());
        }
        self.tx.try_send(chunk)?;
        self.state.wake();
        Ok(())
    }

    /// Queues a chunk, blocking while the queue is full. Returns false once
    /// the source is gone.
    pub fn push_blocking(&self, chunk: Vec<Sample>) -> bool {
        if self.state.paused.load(Ordering::SeqCst) {
            self.state.dropped.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            return true;
        }
        let sent = self.tx.send(chunk).is_ok();
        if sent {
            self.state.wake();
        }
        sent
    }

    /// Samples discarded because they arrived during a pause.
    pub fn dropped_samples(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

/// Drains chunks pushed through its [`LiveFeed`] into a one-element `pcm`
/// level.
pub struct LiveSource {
    name: String,
    level: String,
    sample_rate: u32,
    block: usize,
    rx: Receiver<Vec<Sample>>,
    state: Arc<FeedState>,
    pending: Vec<Sample>,
    closed: bool,
    poll_interval: Duration,
    out: Option<LevelWriter>,
    written: u64,
    /// Last write was refused because the level is full.
    stalled: bool,
}

impl LiveSource {
    /// Creates the source and its feed with room for `queue_chunks` chunks.
    pub fn new(name: impl Into<String>, sample_rate: u32, queue_chunks: usize) -> (Self, LiveFeed) {
        let (tx, rx) = crossbeam_channel::bounded(queue_chunks.max(1));
        let state = Arc::new(FeedState::default());
        let sample_rate = sample_rate.max(1);
        let source = Self {
            name: name.into(),
            level: "pcm".to_string(),
            sample_rate,
            block: ((defaults::SOURCE_BLOCK_SEC * f64::from(sample_rate)).round() as usize).max(1),
            rx,
            state: state.clone(),
            pending: Vec::new(),
            closed: false,
            poll_interval: Duration::from_millis(defaults::EXTERNAL_WAIT_MS),
            out: None,
            written: 0,
            stalled: false,
        };
        (source, LiveFeed { tx, state })
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Largest block written per tick, in samples.
    pub fn with_block(mut self, samples: usize) -> Self {
        self.block = samples.max(1);
        self
    }

    /// How long an idle round waits for the feed before re-polling.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// True once every feed is dropped and all queued samples were written.
    pub fn is_finished(&self) -> bool {
        self.closed && self.pending.is_empty()
    }

    fn fill_pending(&mut self) {
        while self.pending.len() < self.block {
            match self.rx.try_recv() {
                Ok(chunk) => self.pending.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        info!(source = %self.name, samples = self.written, "live feed closed");
                    }
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl Component for LiveSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        let period = 1.0 / f64::from(self.sample_rate);
        self.out = Some(reg.writer_of(&self.level, LevelConfig::periodic(period))?);
        if self.state.wake.set(reg.data_signal()).is_err() {
            debug!(source = %self.name, "feed already bound to a pipeline");
        }
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let out = registered(&self.out, &self.name)?;
        out.add_field_meta(FieldMetaInfo::new("pcm", 1).with_data_type(DataType::Pcm))?;
        out.set_block_size(self.block)?;
        Ok(true)
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        self.fill_pending();
        if self.pending.is_empty() {
            self.stalled = false;
            return Ok(if self.closed {
                TickResult::Inactive
            } else {
                TickResult::ExternalSourceNotAvailable
            });
        }
        let out = registered(&self.out, &self.name)?;
        let take = self.pending.len().min(self.block);
        let result = write_or_stall(out, &Block::from_samples(&self.pending[..take]))?;
        if result.is_progress() {
            self.pending.drain(..take);
            self.written += take as u64;
        }
        self.stalled = result == TickResult::DestNoSpace;
        Ok(result)
    }

    fn notify_empty_tickloop(&mut self) -> bool {
        // Nothing downstream moved in a whole round; waiting cannot help.
        if self.stalled {
            return false;
        }
        if self.closed {
            return !self.pending.is_empty();
        }
        let Some(signal) = self.state.wake.get() else {
            return false;
        };
        let seen = signal.generation();
        if self.rx.is_empty() {
            signal.wait_timeout(seen, self.poll_interval);
        }
        // Keeps the pipeline out of EOI while the feed is alive.
        true
    }

    fn pause_event(&mut self) -> bool {
        self.state.paused.store(true, Ordering::SeqCst);
        true
    }

    fn resume_event(&mut self) {
        let mut discarded = self.pending.len() as u64;
        self.pending.clear();
        while let Ok(chunk) = self.rx.try_recv() {
            discarded += chunk.len() as u64;
        }
        self.state.dropped.fetch_add(discarded, Ordering::Relaxed);
        self.state.paused.store(false, Ordering::SeqCst);
        debug!(source = %self.name, discarded, "live source resumed");
    }
}
