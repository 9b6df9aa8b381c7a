//! Out-of-band control of a running scheduler: pause, resume and abort.

use super::scheduler::RunSummary;
use super::worker::Signal;
use crate::error::{LevelflowError, Result};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Default)]
struct ControlState {
    pause_requested: bool,
    paused: bool,
    aborted: bool,
}

/// Requests posted to the scheduler between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlRequest {
    None,
    Pause,
    Abort,
}

#[derive(Debug, Default)]
pub struct SchedulerControl {
    state: Mutex<ControlState>,
    cond: Condvar,
}

impl SchedulerControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.lock().pause_requested = true;
        self.cond.notify_all();
    }

    pub fn resume(&self) {
        let mut state = self.lock();
        state.pause_requested = false;
        self.cond.notify_all();
    }

    pub fn abort(&self) {
        self.lock().aborted = true;
        self.cond.notify_all();
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// What the scheduler should do before its next round.
    pub(crate) fn poll(&self) -> ControlRequest {
        let state = self.lock();
        if state.aborted {
            ControlRequest::Abort
        } else if state.pause_requested && !state.paused {
            ControlRequest::Pause
        } else {
            ControlRequest::None
        }
    }

    /// Drops a pause request that could not be honored.
    pub(crate) fn cancel_pause(&self) {
        self.lock().pause_requested = false;
    }

    /// Marks the scheduler paused and blocks until resume or abort.
    /// Returns false on abort.
    pub(crate) fn wait_paused(&self) -> bool {
        let mut state = self.lock();
        state.paused = true;
        let mut state = self
            .cond
            .wait_while(state, |s| s.pause_requested && !s.aborted)
            .unwrap_or_else(PoisonError::into_inner);
        state.paused = false;
        !state.aborted
    }
}

/// Handle to a pipeline running on its own thread.
pub struct PipelineHandle {
    control: Arc<SchedulerControl>,
    signal: Arc<Signal>,
    thread: Option<JoinHandle<Result<RunSummary>>>,
}

impl PipelineHandle {
    pub(crate) fn new(
        control: Arc<SchedulerControl>,
        signal: Arc<Signal>,
        thread: JoinHandle<Result<RunSummary>>,
    ) -> Self {
        Self {
            control,
            signal,
            thread: Some(thread),
        }
    }

    /// Asks the scheduler to pause between rounds. Components may veto.
    pub fn pause(&self) {
        self.control.pause();
        self.signal.notify();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_paused(&self) -> bool {
        self.control.is_paused()
    }

    /// Ends the run after the current round.
    pub fn abort(&self) {
        self.control.abort();
        self.signal.notify();
    }

    /// Returns true if the scheduler thread has finished.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the run to end.
    pub fn join(mut self) -> Result<RunSummary> {
        match self.thread.take() {
            Some(handle) => join_scheduler(handle),
            None => Err(panicked("scheduler thread already joined")),
        }
    }

    /// Aborts and waits up to `timeout` for the scheduler to stop.
    ///
    /// After the deadline the thread is detached and `None` is returned.
    pub fn stop(mut self, timeout: Duration) -> Option<Result<RunSummary>> {
        self.abort();
        let handle = self.thread.take()?;
        let deadline = Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("scheduler did not stop within {:?}, detaching", timeout);
                return None;
            }
            thread::sleep(poll_interval);
        }
        Some(join_scheduler(handle))
    }
}

fn join_scheduler(handle: JoinHandle<Result<RunSummary>>) -> Result<RunSummary> {
    match handle.join() {
        Ok(result) => result,
        Err(panic_info) => {
            let msg = panic_info
                .downcast_ref::<&str>()
                .copied()
                .or_else(|| panic_info.downcast_ref::<String>().map(|s| s.as_str()))
                .unwrap_or("unknown panic");
            Err(panicked(msg))
        }
    }
}

fn panicked(message: &str) -> LevelflowError {
    LevelflowError::ComponentPanicked {
        component: "scheduler".to_string(),
        message: message.to_string(),
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.control.abort();
            self.signal.notify();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_reflects_requests() {
        let control = SchedulerControl::new();
        assert_eq!(control.poll(), ControlRequest::None);
        control.pause();
        assert_eq!(control.poll(), ControlRequest::Pause);
        control.cancel_pause();
        assert_eq!(control.poll(), ControlRequest::None);
        control.abort();
        assert_eq!(control.poll(), ControlRequest::Abort);
    }

    #[test]
    fn wait_paused_returns_on_resume() {
        let control = Arc::new(SchedulerControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_paused())
        };
        while !control.is_paused() {
            thread::sleep(Duration::from_millis(1));
        }
        control.resume();
        assert!(waiter.join().unwrap());
        assert!(!control.is_paused());
    }

    #[test]
    fn wait_paused_returns_false_on_abort() {
        let control = Arc::new(SchedulerControl::new());
        control.pause();
        let waiter = {
            let control = control.clone();
            thread::spawn(move || control.wait_paused())
        };
        while !control.is_paused() {
            thread::sleep(Duration::from_millis(1));
        }
        control.abort();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn join_reports_panics() {
        let control = Arc::new(SchedulerControl::new());
        let signal = Arc::new(Signal::new());
        let thread = thread::spawn(|| -> Result<RunSummary> { panic!("boom") });
        let handle = PipelineHandle::new(control, signal, thread);
        match handle.join() {
            Err(LevelflowError::ComponentPanicked { message, .. }) => assert_eq!(message, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn stop_detaches_stuck_thread() {
        let control = Arc::new(SchedulerControl::new());
        let signal = Arc::new(Signal::new());
        let thread = thread::spawn(|| -> Result<RunSummary> {
            thread::sleep(Duration::from_secs(2));
            Err(panicked("late"))
        });
        let handle = PipelineHandle::new(control.clone(), signal, thread);
        assert!(handle.stop(Duration::from_millis(50)).is_none());
        assert!(control.is_aborted());
    }
}
