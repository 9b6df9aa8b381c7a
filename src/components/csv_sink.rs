//! Semicolon-separated dump of a level, written by a background thread.

use super::registered_mut;
use super::turn::TurnEvent;
use crate::defaults;
use crate::level::{Block, LevelReader};
use crate::pipeline::{
    Component, ComponentError, Message, Registrar, Signal, TickContext, TickResult,
};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

/// Turn intervals learned from `turnStart`/`turnEnd` messages, in input
/// frame indices.
#[derive(Debug, Default)]
struct TurnSpans {
    open: Option<i64>,
    closed: Vec<(i64, i64)>,
}

impl TurnSpans {
    fn record(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::Start { vidx, .. } => self.open = Some(vidx),
            TurnEvent::End { vidx, .. } => {
                let start = self.open.take().unwrap_or(vidx);
                self.closed.push((start, vidx));
            }
        }
    }

    fn contains(&mut self, vidx: i64) -> bool {
        // Rows arrive in order, so spans that ended before this row are done.
        self.closed.retain(|&(_, end)| end >= vidx);
        self.open.is_some_and(|start| vidx >= start)
            || self
                .closed
                .iter()
                .any(|&(start, end)| (start..=end).contains(&vidx))
    }
}

/// Writes one row per input frame: `frameIndex;frameTime;<elements>`.
///
/// Rows go through a bounded channel to a writer thread, so a slow disk shows
/// up as `ExternalDestNoSpace` instead of stalling the tick loop.
pub struct CsvSink {
    name: String,
    input_level: String,
    turn_column: bool,
    writer: Option<Box<dyn Write + Send>>,
    input: Option<LevelReader>,
    header: Option<String>,
    tx: Option<Sender<String>>,
    rx: Option<Receiver<String>>,
    pending: Option<String>,
    failure: Arc<Mutex<Option<String>>>,
    signal: Option<Arc<Signal>>,
    thread: Option<JoinHandle<()>>,
    turns: TurnSpans,
    rows: u64,
}

impl CsvSink {
    pub fn to_path(
        name: impl Into<String>,
        input_level: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> crate::error::Result<Self> {
        let file = File::create(path.as_ref())?;
        Ok(Self::to_writer(name, input_level, Box::new(file)))
    }

    pub fn to_writer(
        name: impl Into<String>,
        input_level: impl Into<String>,
        writer: Box<dyn Write + Send>,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(defaults::CSV_QUEUE_ROWS);
        Self {
            name: name.into(),
            input_level: input_level.into(),
            turn_column: false,
            writer: Some(writer),
            input: None,
            header: None,
            tx: Some(tx),
            rx: Some(rx),
            pending: None,
            failure: Arc::new(Mutex::new(None)),
            signal: None,
            thread: None,
            turns: TurnSpans::default(),
            rows: 0,
        }
    }

    /// Appends a `turn` column that is 1 while a turn announced to this sink
    /// is open.
    pub fn with_turn_column(mut self) -> Self {
        self.turn_column = true;
        self
    }

    /// Rows handed to the writer thread so far, header excluded.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    fn worker_failure(&self) -> Option<String> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn format_row(&mut self, block: &Block) -> String {
        let (vidx, time) = block
            .tmeta()
            .first()
            .map_or((0, 0.0), |m| (m.vidx, m.time));
        let mut row = format!("{vidx};{time:.6}");
        for value in block.data() {
            row.push(';');
            row.push_str(&value.to_string());
        }
        if self.turn_column {
            let vidx = i64::try_from(vidx).unwrap_or(i64::MAX);
            row.push_str(if self.turns.contains(vidx) { ";1" } else { ";0" });
        }
        row
    }

    fn gone(&self) -> ComponentError {
        ComponentError::Fatal(
            self.worker_failure()
                .unwrap_or_else(|| format!("{}: writer thread is gone", self.name)),
        )
    }

    fn queue_full(&self) -> bool {
        self.tx.as_ref().is_some_and(Sender::is_full)
    }

    fn push(&mut self, row: String) -> Result<bool, ComponentError> {
        let Some(tx) = &self.tx else {
            return Err(self.gone());
        };
        match tx.try_send(row) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(row)) => {
                self.pending = Some(row);
                Ok(false)
            }
            Err(TrySendError::Disconnected(_)) => Err(self.gone()),
        }
    }
}

fn write_rows(
    out: Box<dyn Write + Send>,
    rx: Receiver<String>,
    signal: Option<&Signal>,
) -> io::Result<u64> {
    let mut out = BufWriter::new(out);
    let mut written = 0u64;
    // Ends once the sink drops its sender and the channel is drained.
    for row in rx {
        out.write_all(row.as_bytes())?;
        out.write_all(b"\n")?;
        written += 1;
        if let Some(signal) = signal {
            signal.notify();
        }
    }
    out.flush()?;
    Ok(written)
}

impl Component for CsvSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn register(&mut self, reg: &mut Registrar<'_>) -> Result<(), ComponentError> {
        self.input = Some(reg.reader_of(&self.input_level)?);
        self.signal = Some(reg.data_signal());
        Ok(())
    }

    fn configure(&mut self) -> Result<bool, ComponentError> {
        let input = registered_mut(&mut self.input, &self.name)?;
        let Some(layout) = input.upstream_layout() else {
            return Ok(false);
        };
        let mut header = String::from("frameIndex;frameTime");
        for element in layout.element_names() {
            header.push(';');
            header.push_str(&element);
        }
        if self.turn_column {
            header.push_str(";turn");
        }
        self.header = Some(header);
        Ok(true)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        let Some(out) = self.writer.take() else {
            return Err(ComponentError::Fatal(format!(
                "{}: finalized twice",
                self.name
            )));
        };
        if let Some(header) = self.header.take() {
            self.push(header)?;
        }
        let Some(rx) = self.rx.take() else {
            return Err(self.gone());
        };
        let failure = self.failure.clone();
        let signal = self.signal.clone();
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("csv-{name}"))
            .spawn(move || match write_rows(out, rx, signal.as_deref()) {
                Ok(rows) => debug!(sink = %name, rows, "csv writer finished"),
                Err(e) => {
                    error!(sink = %name, "csv write failed: {e}");
                    *failure.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(format!("{name}: write failed: {e}"));
                    if let Some(signal) = signal {
                        signal.notify();
                    }
                }
            })
            .map_err(|e| {
                ComponentError::Fatal(format!("{}: cannot start writer: {e}", self.name))
            })?;
        self.thread = Some(handle);
        Ok(())
    }

    fn tick(&mut self, _ctx: &mut TickContext<'_>) -> Result<TickResult, ComponentError> {
        if let Some(msg) = self.worker_failure() {
            return Err(ComponentError::Fatal(msg));
        }
        if let Some(row) = self.pending.take() {
            if !self.push(row)? {
                return Ok(TickResult::ExternalDestNoSpace);
            }
            self.rows += 1;
        }

        let mut progressed = false;
        loop {
            if self.queue_full() {
                return Ok(if progressed {
                    TickResult::Success
                } else {
                    TickResult::ExternalDestNoSpace
                });
            }
            let Some(block) = registered_mut(&mut self.input, &self.name)?.read_next()? else {
                break;
            };
            let row = self.format_row(&block);
            progressed = true;
            if !self.push(row)? {
                break;
            }
            self.rows += 1;
        }
        Ok(if progressed {
            TickResult::Success
        } else {
            TickResult::SourceNotAvailable
        })
    }

    fn handle_message(&mut self, msg: &Message<'_>) -> bool {
        match TurnEvent::from_message(msg) {
            Some(event) => {
                self.turns.record(event);
                true
            }
            None => false,
        }
    }

    fn notify_empty_tickloop(&mut self) -> bool {
        if self.worker_failure().is_some() {
            return true;
        }
        let unread = self
            .input
            .as_ref()
            .and_then(|input| input.n_avail().ok())
            .is_some_and(|n| n > 0);
        if self.pending.is_none() && !(unread && self.queue_full()) {
            return false;
        }
        // Rows are waiting on the writer thread; give it time to drain.
        if let Some(signal) = &self.signal {
            let seen = signal.generation();
            if self.queue_full() {
                signal.wait_timeout(seen, Duration::from_millis(defaults::EXTERNAL_WAIT_MS));
            }
        }
        true
    }

    fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!(sink = %self.name, "csv writer thread panicked");
        }
        if let Some(row) = self.pending.take() {
            error!(sink = %self.name, "dropping unwritten row: {row}");
        }
        info!(sink = %self.name, rows = self.rows, "csv sink closed");
    }
}
