//! Background loop abstraction
//!
//! The engine only knows the [`Worker`] trait. [`NativeWorker`] runs the
//! step on a dedicated OS thread; [`ManualWorker`] lets an external loop
//! (a GUI timer, a test) drive each iteration through a [`ManualPump`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{HarvestError, Result};

/// What the loop should do after one step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Exit,
}

/// One iteration of a background loop
pub type Step = Box<dyn FnMut() -> StepOutcome + Send>;

/// A start/stop-able loop around a step function
pub trait Worker: Send {
    /// Start invoking `step` until stopped or it returns [`StepOutcome::Exit`].
    fn start(&mut self, step: Step) -> Result<()>;

    /// Clear the running flag and wait for the current iteration to finish.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Runs the step on a named `std::thread`
pub struct NativeWorker {
    name: String,
    idle: Duration,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NativeWorker {
    pub fn new(name: impl Into<String>, idle: Duration) -> Self {
        Self {
            name: name.into(),
            idle,
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Worker for NativeWorker {
    fn start(&mut self, mut step: Step) -> Result<()> {
        if self.handle.is_some() {
            // Previous loop exited on its own; reap it before restarting
            self.stop();
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let idle = self.idle;

        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                while running.load(Ordering::Acquire) {
                    if step() == StepOutcome::Exit {
                        break;
                    }
                    if !idle.is_zero() {
                        thread::sleep(idle);
                    }
                }
                running.store(false, Ordering::Release);
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                HarvestError::Worker(format!("failed to spawn {}: {}", self.name, e))
            })?;

        debug!(worker = %self.name, "worker started");
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(worker = %self.name, "worker thread panicked");
            }
            debug!(worker = %self.name, "worker stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for NativeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ManualState {
    running: AtomicBool,
    step: Mutex<Option<Step>>,
}

/// Holds the step until an external loop pumps it
pub struct ManualWorker {
    state: Arc<ManualState>,
}

/// Handle used by the external loop to run iterations
#[derive(Clone)]
pub struct ManualPump {
    state: Arc<ManualState>,
}

impl ManualWorker {
    pub fn new() -> (Self, ManualPump) {
        let state = Arc::new(ManualState {
            running: AtomicBool::new(false),
            step: Mutex::new(None),
        });
        (
            Self {
                state: Arc::clone(&state),
            },
            ManualPump { state },
        )
    }
}

impl Worker for ManualWorker {
    fn start(&mut self, step: Step) -> Result<()> {
        *self.state.step.lock() = Some(step);
        self.state.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        self.state.running.store(false, Ordering::Release);
        // Waits for an in-progress pump to finish
        self.state.step.lock().take();
    }

    fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }
}

impl ManualPump {
    /// Run one iteration. Returns false when the worker is not running.
    pub fn pump(&self) -> bool {
        if !self.state.running.load(Ordering::Acquire) {
            return false;
        }
        let mut guard = self.state.step.lock();
        let Some(step) = guard.as_mut() else {
            return false;
        };
        if step() == StepOutcome::Exit {
            self.state.running.store(false, Ordering::Release);
        }
        true
    }

    /// Run up to `n` iterations, stopping early if the worker stops.
    pub fn pump_n(&self, n: usize) -> usize {
        (0..n).take_while(|_| self.pump()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_step(counter: Arc<AtomicUsize>, exit_after: usize) -> Step {
        Box::new(move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= exit_after {
                StepOutcome::Exit
            } else {
                StepOutcome::Continue
            }
        })
    }

    #[test]
    fn test_native_worker_exits_on_step() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = NativeWorker::new("test-worker", Duration::ZERO);
        worker
            .start(counting_step(Arc::clone(&counter), 5))
            .unwrap();
        worker.stop();
        assert!(counter.load(Ordering::SeqCst) <= 5);
        assert!(!worker.is_running());
    }

    #[test]
    fn test_native_worker_restarts() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut worker = NativeWorker::new("restart", Duration::from_micros(10));
        worker
            .start(counting_step(Arc::clone(&counter), usize::MAX))
            .unwrap();
        assert!(worker.is_running());
        worker.stop();
        worker
            .start(counting_step(Arc::clone(&counter), usize::MAX))
            .unwrap();
        assert!(worker.is_running());
        worker.stop();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_manual_pump() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (mut worker, pump) = ManualWorker::new();
        assert!(!pump.pump());

        worker.start(counting_step(Arc::clone(&counter), 3)).unwrap();
        assert_eq!(pump.pump_n(10), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!worker.is_running());

        worker.start(counting_step(Arc::clone(&counter), 100)).unwrap();
        assert!(pump.pump());
        worker.stop();
        assert!(!pump.pump());
    }
}
