//! What a component sees of the pipeline during registration and ticks.

use super::message::{Message, MessageBus, MessageError};
use super::worker::Signal;
use super::error::ComponentError;
use crate::clock::{Clock, seconds_since};
use crate::error::LevelflowError;
use crate::level::{Level, LevelConfig, LevelReader, LevelWriter};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

pub(crate) struct LevelEntry {
    pub(crate) level: Arc<Level>,
    pub(crate) writer: Option<String>,
    pub(crate) readers: Vec<String>,
}

/// Levels of one pipeline, in creation order.
#[derive(Default)]
pub(crate) struct LevelTable {
    entries: Vec<LevelEntry>,
    index: HashMap<String, usize>,
}

impl LevelTable {
    fn get_or_create(
        &mut self,
        name: &str,
        clock: &Arc<dyn Clock>,
        epoch: Instant,
    ) -> &mut LevelEntry {
        let idx = match self.index.get(name) {
            Some(&idx) => idx,
            None => {
                self.entries.push(LevelEntry {
                    level: Arc::new(Level::with_clock(
                        name,
                        LevelConfig::default(),
                        clock.clone(),
                        epoch,
                    )),
                    writer: None,
                    readers: Vec::new(),
                });
                let idx = self.entries.len() - 1;
                self.index.insert(name.to_string(), idx);
                idx
            }
        };
        &mut self.entries[idx]
    }

    pub(crate) fn get(&self, name: &str) -> Option<&LevelEntry> {
        self.index.get(name).map(|&idx| &self.entries[idx])
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &LevelEntry> {
        self.entries.iter()
    }

    pub(crate) fn written_by<'a>(
        &'a self,
        component: &'a str,
    ) -> impl Iterator<Item = &'a LevelEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.writer.as_deref() == Some(component))
    }
}

/// Handed to [`Component::register`](super::Component::register).
pub struct Registrar<'a> {
    component: &'a str,
    levels: &'a mut LevelTable,
    bus: &'a MessageBus,
    signal: &'a Arc<Signal>,
    clock: &'a Arc<dyn Clock>,
    epoch: Instant,
    error: Option<LevelflowError>,
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(
        component: &'a str,
        levels: &'a mut LevelTable,
        bus: &'a MessageBus,
        signal: &'a Arc<Signal>,
        clock: &'a Arc<dyn Clock>,
        epoch: Instant,
    ) -> Self {
        Self {
            component,
            levels,
            bus,
            signal,
            clock,
            epoch,
            error: None,
        }
    }

    pub fn component(&self) -> &str {
        self.component
    }

    /// Registers the component as a reader of `level`, creating the level if
    /// nobody mentioned it yet.
    pub fn reader_of(&mut self, level: &str) -> Result<LevelReader, ComponentError> {
        let entry = self.levels.get_or_create(level, self.clock, self.epoch);
        let id = match entry.level.register_reader() {
            Ok(id) => id,
            Err(source) => {
                return Err(self.fail(LevelflowError::LevelSetup {
                    level: level.to_string(),
                    source,
                }));
            }
        };
        entry.readers.push(self.component.to_string());
        Ok(LevelReader::new(entry.level.clone(), id))
    }

    /// Registers the component as the single writer of `level`.
    pub fn writer_of(
        &mut self,
        level: &str,
        config: LevelConfig,
    ) -> Result<LevelWriter, ComponentError> {
        let component = self.component;
        let entry = self.levels.get_or_create(level, self.clock, self.epoch);
        if let Some(writer) = &entry.writer {
            let err = LevelflowError::DuplicateWriter {
                level: level.to_string(),
                writer: writer.clone(),
                component: component.to_string(),
            };
            return Err(self.fail(err));
        }
        if let Err(source) = entry.level.update_config(|c| *c = config) {
            return Err(self.fail(LevelflowError::LevelSetup {
                level: level.to_string(),
                source,
            }));
        }
        entry.writer = Some(component.to_string());
        Ok(LevelWriter::new(entry.level.clone()))
    }

    /// Bus for components that message others from a worker thread.
    pub fn bus(&self) -> MessageBus {
        self.bus.clone()
    }

    /// Signal a component raises when external data arrived, waking a
    /// scheduler that is waiting on external sources.
    pub fn data_signal(&self) -> Arc<Signal> {
        self.signal.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    fn fail(&mut self, err: LevelflowError) -> ComponentError {
        let message = err.to_string();
        if self.error.is_none() {
            self.error = Some(err);
        }
        ComponentError::Fatal(message)
    }

    pub(crate) fn take_error(&mut self) -> Option<LevelflowError> {
        self.error.take()
    }
}

/// Handed to [`Component::tick`](super::Component::tick).
pub struct TickContext<'a> {
    tick: u64,
    eoi: bool,
    eoi_pass: u32,
    component: &'a str,
    bus: &'a MessageBus,
    stop: &'a AtomicBool,
    signal: &'a Signal,
    clock: &'a dyn Clock,
    epoch: Instant,
}

impl<'a> TickContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tick: u64,
        eoi: bool,
        eoi_pass: u32,
        component: &'a str,
        bus: &'a MessageBus,
        stop: &'a AtomicBool,
        signal: &'a Signal,
        clock: &'a dyn Clock,
        epoch: Instant,
    ) -> Self {
        Self {
            tick,
            eoi,
            eoi_pass,
            component,
            bus,
            stop,
            signal,
            clock,
            epoch,
        }
    }

    /// Round number, starting at 1.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// True while the pipeline drains: reads may be padded and sources
    /// should flush.
    pub fn is_eoi(&self) -> bool {
        self.eoi
    }

    /// Number of drain passes started so far.
    pub fn eoi_pass(&self) -> u32 {
        self.eoi_pass
    }

    pub fn component(&self) -> &str {
        self.component
    }

    /// Seconds since the pipeline started.
    pub fn wall_clock(&self) -> f64 {
        seconds_since(self.clock, self.epoch)
    }

    /// Delivers a message synchronously; stamps sender and wall clock.
    pub fn send_message(
        &self,
        recipient: &str,
        mut msg: Message<'_>,
    ) -> Result<bool, MessageError> {
        msg.sender = self.component.to_string();
        msg.wall_clock = self.wall_clock();
        self.bus.send(recipient, &msg)
    }

    /// Asks the scheduler to end the run after this round.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn signal_data_available(&self) {
        self.signal.notify();
    }
}
