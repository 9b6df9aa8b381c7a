//! Reader/writer arbitration for a level's data region.
//!
//! Any number of readers may copy out concurrently. A writer announces itself
//! first, which blocks new readers, then waits for in-flight readers to drain.
//! The arbitration state has its own mutex so the data copy never runs under it.

use super::error::LevelError;
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writer: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn read(&self) -> Result<ReadPass<'_>, LevelError> {
        let guard = self.state.lock()?;
        let mut state = self.changed.wait_while(guard, |s| s.writer)?;
        state.readers += 1;
        Ok(ReadPass { gate: self })
    }

    pub(crate) fn write(&self) -> Result<WritePass<'_>, LevelError> {
        let guard = self.state.lock()?;
        let mut state = self.changed.wait_while(guard, |s| s.writer)?;
        state.writer = true;
        let pass = WritePass { gate: self };
        let state = self.changed.wait_while(state, |s| s.readers > 0)?;
        drop(state);
        Ok(pass)
    }

    #[cfg(test)]
    fn snapshot(&self) -> (usize, bool) {
        let s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        (s.readers, s.writer)
    }
}

pub(crate) struct ReadPass<'a> {
    gate: &'a Gate,
}

impl Drop for ReadPass<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.gate.changed.notify_all();
        }
    }
}

pub(crate) struct WritePass<'a> {
    gate: &'a Gate,
}

impl Drop for WritePass<'_> {
    fn drop(&mut self) {
        let mut state = self
            .gate
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.writer = false;
        self.gate.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn readers_share_the_gate() {
        let gate = Gate::new();
        let a = gate.read().unwrap();
        let b = gate.read().unwrap();
        assert_eq!(gate.snapshot(), (2, false));
        drop(a);
        drop(b);
        assert_eq!(gate.snapshot(), (0, false));
    }

    #[test]
    fn writer_waits_for_inflight_readers() {
        let gate = Arc::new(Gate::new());
        let reader = gate.read().unwrap();

        let (tx, rx) = bounded(1);
        let writer_gate = gate.clone();
        let handle = thread::spawn(move || {
            let _pass = writer_gate.write().unwrap();
            tx.send(()).unwrap();
        });

        assert!(
            rx.recv_timeout(Duration::from_millis(100)).is_err(),
            "writer must not enter while a reader is inside"
        );
        drop(reader);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        handle.join().unwrap();
        assert_eq!(gate.snapshot(), (0, false));
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let gate = Arc::new(Gate::new());
        let first = gate.read().unwrap();

        let writer_gate = gate.clone();
        let (wtx, wrx) = bounded(1);
        let writer = thread::spawn(move || {
            let _pass = writer_gate.write().unwrap();
            wtx.send(()).unwrap();
            thread::sleep(Duration::from_millis(20));
        });

        // Wait until the writer has announced itself.
        while !gate.snapshot().1 {
            thread::sleep(Duration::from_millis(1));
        }

        let reader_gate = gate.clone();
        let (rtx, rrx) = bounded(1);
        let late_reader = thread::spawn(move || {
            let _pass = reader_gate.read().unwrap();
            rtx.send(()).unwrap();
        });

        assert!(rrx.recv_timeout(Duration::from_millis(100)).is_err());
        drop(first);
        wrx.recv_timeout(Duration::from_secs(5)).unwrap();
        rrx.recv_timeout(Duration::from_secs(5)).unwrap();
        writer.join().unwrap();
        late_reader.join().unwrap();
    }
}
