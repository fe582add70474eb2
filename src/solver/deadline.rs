//! Hard deadline enforcement for a running solver.
//!
//! The solver is trusted to honour its own time limit, but a wedged solver
//! would hold a worker forever. A watchdog thread kills the solver's process
//! group once the deadline passes, or as soon as the worker is asked to shut
//! down.

use crate::process::signal_group;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often the watchdog checks the clock and the interrupt flag.
const DEADLINE_POLL_INTERVAL: Duration = Duration::from_millis(250);

const FIRED_NONE: u8 = 0;
const FIRED_TIMEOUT: u8 = 1;
const FIRED_INTERRUPT: u8 = 2;

/// Why the watchdog killed the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineCause {
    TimedOut,
    Interrupted,
}

/// Watchdog thread guarding one solver process group.
pub struct Deadline {
    cancel: Option<Sender<()>>,
    fired: Arc<AtomicU8>,
    thread: Option<JoinHandle<()>>,
}

impl Deadline {
    /// Start watching `pgid`.
    ///
    /// After `limit` the group gets SIGTERM, then SIGKILL if it is still
    /// around `grace` later. Setting `interrupt` triggers the same sequence
    /// early.
    pub fn arm(
        pgid: Pid,
        limit: Duration,
        grace: Duration,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> std::io::Result<Self> {
        let (cancel, cancelled) = mpsc::channel();
        let fired = Arc::new(AtomicU8::new(FIRED_NONE));
        let fired_clone = fired.clone();

        let thread = thread::Builder::new()
            .name("solver-deadline".to_string())
            .spawn(move || {
                let start = Instant::now();
                loop {
                    match cancelled.recv_timeout(DEADLINE_POLL_INTERVAL) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                    }

                    let cause = if interrupt
                        .as_ref()
                        .is_some_and(|flag| flag.load(Ordering::Relaxed))
                    {
                        FIRED_INTERRUPT
                    } else if start.elapsed() >= limit {
                        FIRED_TIMEOUT
                    } else {
                        continue;
                    };

                    fired_clone.store(cause, Ordering::SeqCst);
                    tracing::warn!(
                        pgid = pgid.as_raw(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        reason = if cause == FIRED_TIMEOUT { "deadline" } else { "interrupt" },
                        "Stopping solver"
                    );
                    if let Err(e) = signal_group(pgid, Signal::SIGTERM) {
                        tracing::debug!(error = %e, "SIGTERM to solver failed");
                    }
                    if let Err(RecvTimeoutError::Timeout) = cancelled.recv_timeout(grace) {
                        tracing::debug!(pgid = pgid.as_raw(), "Solver outlived grace period, killing");
                        let _ = signal_group(pgid, Signal::SIGKILL);
                    }
                    return;
                }
            })?;

        Ok(Self {
            cancel: Some(cancel),
            fired,
            thread: Some(thread),
        })
    }

    /// Whether (and why) the watchdog has acted.
    pub fn fired(&self) -> Option<DeadlineCause> {
        match self.fired.load(Ordering::SeqCst) {
            FIRED_TIMEOUT => Some(DeadlineCause::TimedOut),
            FIRED_INTERRUPT => Some(DeadlineCause::Interrupted),
            _ => None,
        }
    }

    /// Stop the watchdog and wait for its thread.
    ///
    /// Call once the solver has been reaped.
    pub fn disarm(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.disarm();
    }
}
