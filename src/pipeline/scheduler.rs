//! The pipeline: owns levels and components and runs the tick loop.
//!
//! A run is a sequence of rounds. Each round ticks every component once, in
//! registration order. A round in which nothing made progress moves the
//! pipeline into end-of-input (EOI); an empty round during EOI ends the run.

use super::component::{Component, ComponentState, SharedComponent, TickResult};
use super::context::{LevelTable, Registrar, TickContext};
use super::control::{ControlRequest, PipelineHandle, SchedulerControl};
use super::error::{ComponentError, ErrorReporter, LogReporter};
use super::message::MessageBus;
use super::worker::{Signal, WaitOutcome};
use crate::clock::{Clock, SystemClock};
use crate::defaults;
use crate::error::{LevelflowError, Result};
use crate::level::{HangPolicy, Level, LevelConfig, LevelStats, Padding};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Level settings applied on top of what the writing component asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelPolicy {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_sec: Option<f64>,
    /// Capacity in frames; wins over `capacity_sec`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub growable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ring: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hang: Option<HangPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub padding: Option<Padding>,
}

impl LevelPolicy {
    /// Fields set in `over` win.
    pub fn merged(&self, over: &LevelPolicy) -> LevelPolicy {
        LevelPolicy {
            capacity_sec: over.capacity_sec.or(self.capacity_sec),
            capacity: over.capacity.or(self.capacity),
            growable: over.growable.or(self.growable),
            ring: over.ring.or(self.ring),
            hang: over.hang.or(self.hang),
            padding: over.padding.or(self.padding),
        }
    }

    pub fn apply(&self, config: &mut LevelConfig) {
        if let Some(capacity) = self.capacity {
            config.capacity = capacity;
        }
        if let Some(growable) = self.growable {
            config.growable = growable;
        }
        if let Some(ring) = self.ring {
            config.ring = ring;
        }
        if let Some(hang) = self.hang {
            config.hang = hang;
        }
        if let Some(padding) = self.padding {
            config.padding = padding;
        }
    }
}

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Stop after this many rounds (0 = unlimited).
    pub max_ticks: u64,
    /// Run further drain passes until a pass starts with an empty round.
    pub repeat_eoi_passes: bool,
    /// How long an idle round waits for external sources before it counts
    /// as empty.
    pub external_wait: Duration,
    pub pause_retry_rounds: u32,
    pub configure_passes: u32,
    /// Seconds of data per level when capacity is automatic.
    pub capacity_sec: f64,
    /// Applied to every level.
    pub levels: LevelPolicy,
    /// Applied to single levels, by name, after `levels`.
    pub overrides: BTreeMap<String, LevelPolicy>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_ticks: 0,
            repeat_eoi_passes: false,
            external_wait: Duration::from_millis(defaults::EXTERNAL_WAIT_MS),
            pause_retry_rounds: defaults::PAUSE_RETRY_ROUNDS,
            configure_passes: defaults::CONFIGURE_PASSES,
            capacity_sec: defaults::CAPACITY_SEC,
            levels: LevelPolicy::default(),
            overrides: BTreeMap::new(),
        }
    }
}

impl PipelineConfig {
    pub fn policy_for(&self, level: &str) -> LevelPolicy {
        match self.overrides.get(level) {
            Some(over) => self.levels.merged(over),
            None => self.levels.clone(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunOutcome {
    /// All input consumed and flushed.
    Drained,
    /// A component requested the stop.
    Stopped,
    /// Aborted through the control handle.
    Aborted,
    /// `max_ticks` rounds ran.
    TickLimit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Component ticks performed.
    pub ticks: u64,
    pub rounds: u64,
    pub eoi_passes: u32,
    pub outcome: RunOutcome,
    pub levels: Vec<LevelStats>,
}

#[derive(Debug, Default)]
struct RoundReport {
    ticks: u64,
    progress: bool,
    external: bool,
    dest_stalled: Vec<String>,
}

struct Entry {
    name: String,
    component: SharedComponent,
    state: ComponentState,
    saw_eoi: bool,
    last: TickResult,
}

/// Levels plus components, built then run once.
pub struct Pipeline {
    config: PipelineConfig,
    levels: LevelTable,
    entries: Vec<Entry>,
    bus: MessageBus,
    signal: Arc<Signal>,
    control: Arc<SchedulerControl>,
    stop: AtomicBool,
    error_reporter: Arc<dyn ErrorReporter>,
    clock: Arc<dyn Clock>,
    epoch: Instant,
    built: bool,
}

impl Pipeline {
    /// Creates an empty pipeline with the default error reporter.
    pub fn new(config: PipelineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let epoch = clock.now();
        Self {
            config,
            levels: LevelTable::default(),
            entries: Vec::new(),
            bus: MessageBus::new(),
            signal: Arc::new(Signal::new()),
            control: Arc::new(SchedulerControl::new()),
            stop: AtomicBool::new(false),
            error_reporter: Arc::new(LogReporter),
            clock,
            epoch,
            built: false,
        }
    }

    /// Sets a custom error reporter.
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.error_reporter = reporter;
        self
    }

    /// Sets a custom clock (for deterministic testing).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.epoch = clock.now();
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Adds a component. Names must be unique; they address messages.
    pub fn add(&mut self, component: impl Component + 'static) -> Result<()> {
        self.add_boxed(Box::new(component))
    }

    pub fn add_boxed(&mut self, component: Box<dyn Component>) -> Result<()> {
        let name = component.name().to_string();
        if self.built {
            return Err(LevelflowError::ComponentFailed {
                component: name,
                message: "pipeline is already built".to_string(),
            });
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(LevelflowError::DuplicateComponent { name });
        }
        let shared: SharedComponent = Arc::new(Mutex::new(component));
        self.bus.register(&name, shared.clone());
        self.entries.push(Entry {
            name,
            component: shared,
            state: ComponentState::Unregistered,
            saw_eoi: false,
            last: TickResult::Inactive,
        });
        Ok(())
    }

    pub fn component_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn component_state(&self, name: &str) -> Option<ComponentState> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.state)
    }

    /// Result of the component's most recent tick.
    pub fn last_result(&self, name: &str) -> Option<TickResult> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.last)
    }

    pub fn level(&self, name: &str) -> Option<Arc<Level>> {
        self.levels.get(name).map(|e| e.level.clone())
    }

    pub fn level_stats(&self) -> Vec<LevelStats> {
        self.levels
            .iter()
            .filter_map(|e| e.level.stats().ok())
            .collect()
    }

    pub fn bus(&self) -> MessageBus {
        self.bus.clone()
    }

    pub fn control(&self) -> Arc<SchedulerControl> {
        self.control.clone()
    }

    pub fn data_signal(&self) -> Arc<Signal> {
        self.signal.clone()
    }

    /// Registers, configures and finalizes every component and level.
    pub fn build(&mut self) -> Result<()> {
        if self.built {
            return Ok(());
        }
        self.epoch = self.clock.now();
        self.register_components()?;
        self.configure_components()?;
        self.finalize_levels()?;
        self.finalize_components()?;
        self.built = true;
        info!(
            components = self.entries.len(),
            levels = self.levels.iter().count(),
            "pipeline built"
        );
        Ok(())
    }

    fn register_components(&mut self) -> Result<()> {
        for entry in &mut self.entries {
            let mut reg = Registrar::new(
                &entry.name,
                &mut self.levels,
                &self.bus,
                &self.signal,
                &self.clock,
                self.epoch,
            );
            let result = lock_component(&entry.name, &entry.component)?.register(&mut reg);
            if let Err(e) = result {
                return Err(reg
                    .take_error()
                    .unwrap_or_else(|| failed(self.error_reporter.as_ref(), &entry.name, &e)));
            }
            entry.state = ComponentState::Registered;
            debug!(component = %entry.name, "registered");
        }
        Ok(())
    }

    fn configure_components(&mut self) -> Result<()> {
        let passes = self.config.configure_passes.max(1);
        for pass in 1..=passes {
            let mut progressed = false;
            let mut pending = Vec::new();
            for entry in &mut self.entries {
                if entry.state >= ComponentState::Configured {
                    continue;
                }
                let done = lock_component(&entry.name, &entry.component)?
                    .configure()
                    .map_err(|e| failed(self.error_reporter.as_ref(), &entry.name, &e))?;
                if !done {
                    pending.push(entry.name.clone());
                    continue;
                }
                entry.state = ComponentState::Configured;
                progressed = true;
                for written in self.levels.written_by(&entry.name) {
                    written
                        .level
                        .fix_layout()
                        .map_err(|source| LevelflowError::LevelSetup {
                            level: written.level.name().to_string(),
                            source,
                        })?;
                }
            }
            if pending.is_empty() {
                return Ok(());
            }
            if !progressed || pass == passes {
                return Err(LevelflowError::ConfigureStalled { pending });
            }
            debug!(pass, ?pending, "configure pass incomplete");
        }
        Ok(())
    }

    fn finalize_levels(&mut self) -> Result<()> {
        for entry in self.levels.iter() {
            let level = &entry.level;
            let setup_err = |source| LevelflowError::LevelSetup {
                level: level.name().to_string(),
                source,
            };
            if entry.writer.is_none() {
                return Err(LevelflowError::MissingWriter {
                    level: level.name().to_string(),
                    readers: entry.readers.clone(),
                });
            }
            let policy = self.config.policy_for(level.name());
            let mut config = level.config().map_err(setup_err)?;
            policy.apply(&mut config);
            let capacity = if config.capacity > 0 {
                config.capacity
            } else {
                auto_capacity(
                    level,
                    &config,
                    policy.capacity_sec.unwrap_or(self.config.capacity_sec),
                )
            };
            level.update_config(|c| *c = config).map_err(setup_err)?;
            level.finalize(capacity).map_err(setup_err)?;
        }
        Ok(())
    }

    fn finalize_components(&mut self) -> Result<()> {
        for entry in &mut self.entries {
            lock_component(&entry.name, &entry.component)?
                .finalize()
                .map_err(|e| failed(self.error_reporter.as_ref(), &entry.name, &e))?;
            entry.state = ComponentState::Finalized;
        }
        for entry in &mut self.entries {
            entry.state = ComponentState::Ready;
        }
        Ok(())
    }

    /// Builds if needed and runs the tick loop until the pipeline drains,
    /// stops or is aborted.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.build()?;
        let result = self.tick_loop();
        // Components own threads and files; release them on every exit path.
        self.shutdown_components();
        let (outcome, ticks, rounds, eoi_passes) = result?;
        let summary = RunSummary {
            ticks,
            rounds,
            eoi_passes,
            outcome,
            levels: self.level_stats(),
        };
        info!(
            rounds = summary.rounds,
            ticks = summary.ticks,
            outcome = ?summary.outcome,
            "pipeline finished"
        );
        Ok(summary)
    }

    fn tick_loop(&mut self) -> Result<(RunOutcome, u64, u64, u32)> {
        let mut ticks = 0u64;
        let mut rounds = 0u64;
        let mut eoi = false;
        let mut eoi_pass = 0u32;
        let mut rounds_since_reset = 0u64;
        let mut pause_attempts = 0u32;

        let outcome = loop {
            match self.control.poll() {
                ControlRequest::Abort => break RunOutcome::Aborted,
                ControlRequest::Pause => {
                    if self.try_pause()? {
                        pause_attempts = 0;
                        let resumed = self.control.wait_paused();
                        self.resume_all()?;
                        if !resumed {
                            break RunOutcome::Aborted;
                        }
                    } else {
                        pause_attempts += 1;
                        if pause_attempts > self.config.pause_retry_rounds {
                            warn!(attempts = pause_attempts, "pause vetoed too often, dropping request");
                            self.control.cancel_pause();
                            pause_attempts = 0;
                        }
                    }
                }
                ControlRequest::None => {}
            }
            if self.stop.load(Ordering::SeqCst) {
                break RunOutcome::Stopped;
            }
            if self.config.max_ticks > 0 && rounds >= self.config.max_ticks {
                break RunOutcome::TickLimit;
            }

            rounds += 1;
            rounds_since_reset += 1;
            let seen = self.signal.generation();
            let report = self.run_round(rounds, eoi, eoi_pass)?;
            ticks += report.ticks;
            if report.progress || self.stop.load(Ordering::SeqCst) {
                continue;
            }
            if self.notify_empty()? {
                continue;
            }
            if report.external && !self.config.external_wait.is_zero() {
                match self.signal.wait_timeout(seen, self.config.external_wait) {
                    WaitOutcome::Notified(_) => continue,
                    WaitOutcome::TimedOut | WaitOutcome::Terminated => {}
                }
            }

            if !eoi {
                if self.config.repeat_eoi_passes && eoi_pass > 0 && rounds_since_reset == 1 {
                    break RunOutcome::Drained;
                }
                eoi = true;
                eoi_pass += 1;
                for entry in self.levels.iter() {
                    entry.level.set_eoi();
                }
                info!(pass = eoi_pass, round = rounds, "end of input, draining");
                continue;
            }

            if !report.dest_stalled.is_empty() {
                warn!(
                    components = ?report.dest_stalled,
                    "drained while components still report full outputs"
                );
            }
            if self.config.repeat_eoi_passes {
                eoi = false;
                rounds_since_reset = 0;
                for entry in self.levels.iter() {
                    entry.level.unset_eoi();
                }
                for entry in &mut self.entries {
                    entry.saw_eoi = false;
                }
                debug!(pass = eoi_pass, "drain pass complete, rescanning");
                continue;
            }
            break RunOutcome::Drained;
        };
        Ok((outcome, ticks, rounds, eoi_pass))
    }

    /// Builds, then runs the tick loop on its own thread.
    pub fn spawn(mut self) -> Result<PipelineHandle> {
        self.build()?;
        let control = self.control.clone();
        let signal = self.signal.clone();
        let thread = thread::Builder::new()
            .name("levelflow-scheduler".to_string())
            .spawn(move || self.run())?;
        Ok(PipelineHandle::new(control, signal, thread))
    }

    fn run_round(&mut self, round: u64, eoi: bool, eoi_pass: u32) -> Result<RoundReport> {
        let mut report = RoundReport::default();
        for entry in &mut self.entries {
            if entry.state != ComponentState::Ready {
                continue;
            }
            // The first tick after EOI only tells the component it is draining.
            if eoi && !entry.saw_eoi {
                entry.saw_eoi = true;
                entry.last = TickResult::Success;
                report.progress = true;
                continue;
            }

            let mut ctx = TickContext::new(
                round,
                eoi,
                eoi_pass,
                &entry.name,
                &self.bus,
                &self.stop,
                &self.signal,
                self.clock.as_ref(),
                self.epoch,
            );
            let component = &entry.component;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                component
                    .lock()
                    .map(|mut c| c.tick(&mut ctx))
                    .map_err(|_| ())
            }));
            report.ticks += 1;

            let result = match outcome {
                Err(panic_info) => {
                    let message = panic_info
                        .downcast_ref::<&str>()
                        .copied()
                        .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                        .unwrap_or("unknown panic")
                        .to_string();
                    error!(component = %entry.name, %message, "component panicked");
                    return Err(LevelflowError::ComponentPanicked {
                        component: entry.name.clone(),
                        message,
                    });
                }
                Ok(Err(())) => {
                    return Err(LevelflowError::ComponentPanicked {
                        component: entry.name.clone(),
                        message: "component lock poisoned".to_string(),
                    });
                }
                Ok(Ok(Ok(result))) => result,
                Ok(Ok(Err(e))) => {
                    if e.is_fatal() {
                        return Err(failed(self.error_reporter.as_ref(), &entry.name, &e));
                    }
                    self.error_reporter.report(&entry.name, &e);
                    TickResult::Inactive
                }
            };

            trace!(component = %entry.name, round, %result, "tick");
            entry.last = result;
            if result.is_progress() {
                report.progress = true;
            }
            if result.is_external() {
                report.external = true;
            }
            if result.is_dest_stall() {
                report.dest_stalled.push(entry.name.clone());
            }
        }
        Ok(report)
    }

    /// Asks every component whether an idle round should still count as
    /// busy.
    fn notify_empty(&mut self) -> Result<bool> {
        let mut busy = false;
        for entry in &self.entries {
            if lock_component(&entry.name, &entry.component)?.notify_empty_tickloop() {
                busy = true;
            }
        }
        Ok(busy)
    }

    fn try_pause(&mut self) -> Result<bool> {
        let mut paused = HashSet::new();
        for entry in &self.entries {
            if lock_component(&entry.name, &entry.component)?.pause_event() {
                paused.insert(entry.name.as_str());
                continue;
            }
            debug!(component = %entry.name, "pause vetoed");
            for other in self.entries.iter().filter(|e| paused.contains(e.name.as_str())) {
                lock_component(&other.name, &other.component)?.resume_event();
            }
            return Ok(false);
        }
        info!("pipeline paused");
        Ok(true)
    }

    fn resume_all(&mut self) -> Result<()> {
        for entry in &self.entries {
            lock_component(&entry.name, &entry.component)?.resume_event();
        }
        info!("pipeline resumed");
        Ok(())
    }

    fn shutdown_components(&mut self) {
        for entry in &self.entries {
            match entry.component.lock() {
                Ok(mut component) => component.shutdown(),
                Err(_) => warn!(component = %entry.name, "skipping shutdown of poisoned component"),
            }
        }
    }
}

fn lock_component<'a>(
    name: &str,
    component: &'a SharedComponent,
) -> Result<MutexGuard<'a, Box<dyn Component>>> {
    component
        .lock()
        .map_err(|_| LevelflowError::ComponentPanicked {
            component: name.to_string(),
            message: "component lock poisoned".to_string(),
        })
}

fn failed(reporter: &dyn ErrorReporter, component: &str, e: &ComponentError) -> LevelflowError {
    reporter.report(component, e);
    let message = match e {
        ComponentError::Recoverable(m) | ComponentError::Fatal(m) => m.clone(),
    };
    LevelflowError::ComponentFailed {
        component: component.to_string(),
        message,
    }
}

/// Frames needed to hold `seconds` of data, never less than one reader block
/// plus two writer blocks.
fn auto_capacity(level: &Level, config: &LevelConfig, seconds: f64) -> usize {
    let minimum = level.max_reader_block().max(1) + 2 * level.writer_block();
    let by_time = if config.period > 0.0 {
        (seconds / config.period).ceil() as usize
    } else {
        defaults::APERIODIC_CAPACITY
    };
    by_time.max(minimum)
}
