//! Wake-ups between the scheduler and threads outside the tick loop.
//!
//! The `terminated` flag lives under the same mutex as the generation
//! counter, so a waiter never blocks past shutdown.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct SignalState {
    generation: u64,
    terminated: bool,
}

/// Result of waiting on a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Notified; carries the generation to pass to the next wait.
    Notified(u64),
    TimedOut,
    Terminated,
}

/// A "data available" notification with a generation counter.
///
/// Waiters pass the last generation they saw; a notification that happened
/// before the wait started is not lost.
#[derive(Debug, Default)]
pub struct Signal {
    state: Mutex<SignalState>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn notify(&self) {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    pub fn terminate(&self) {
        self.lock().terminated = true;
        self.cond.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminated
    }

    /// Waits until the generation moves past `seen`, termination, or timeout.
    pub fn wait_timeout(&self, seen: u64, timeout: Duration) -> WaitOutcome {
        let guard = self.lock();
        let (state, result) = self
            .cond
            .wait_timeout_while(guard, timeout, |s| {
                !s.terminated && s.generation == seen
            })
            .unwrap_or_else(PoisonError::into_inner);
        if state.terminated {
            WaitOutcome::Terminated
        } else if result.timed_out() && state.generation == seen {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Notified(state.generation)
        }
    }

    /// Blocks until the generation moves past `seen` or termination.
    pub fn wait(&self, seen: u64) -> WaitOutcome {
        let guard = self.lock();
        let state = self
            .cond
            .wait_while(guard, |s| !s.terminated && s.generation == seen)
            .unwrap_or_else(PoisonError::into_inner);
        if state.terminated {
            WaitOutcome::Terminated
        } else {
            WaitOutcome::Notified(state.generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_notify_before_wait_is_not_lost() {
        let signal = Signal::new();
        let seen = signal.generation();
        signal.notify();
        assert_eq!(
            signal.wait_timeout(seen, Duration::from_millis(10)),
            WaitOutcome::Notified(seen + 1)
        );
    }

    #[test]
    fn signal_times_out_without_notify() {
        let signal = Signal::new();
        assert_eq!(
            signal.wait_timeout(signal.generation(), Duration::from_millis(20)),
            WaitOutcome::TimedOut
        );
    }

    #[test]
    fn signal_terminate_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || signal.wait(signal.generation()))
        };
        thread::sleep(Duration::from_millis(20));
        signal.terminate();
        assert_eq!(waiter.join().unwrap(), WaitOutcome::Terminated);
        assert!(signal.is_terminated());
    }

    #[test]
    fn signal_wakes_on_notify_from_other_thread() {
        let signal = Arc::new(Signal::new());
        let seen = signal.generation();
        let notifier = {
            let signal = signal.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                signal.notify();
            })
        };
        assert!(matches!(
            signal.wait_timeout(seen, Duration::from_secs(5)),
            WaitOutcome::Notified(_)
        ));
        notifier.join().unwrap();
    }
}
