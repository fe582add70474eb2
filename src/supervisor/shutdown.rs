//! Shutdown state shared between the interrupt handler and the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where a pipeline is in its shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    /// Workers are being asked to finish up.
    Draining,
    /// Everything gets killed immediately.
    Terminated,
}

impl ShutdownPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// Cloneable handle on the shutdown phase.
///
/// Each call to [`ShutdownSignal::request`] advances the phase by one step;
/// it never moves backwards. Safe to call from a signal-handling thread.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    phase: Arc<AtomicU8>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> ShutdownPhase {
        ShutdownPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Record an interrupt and return the new phase.
    pub fn request(&self) -> ShutdownPhase {
        let previous = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| Some(p.saturating_add(1).min(2)))
            .unwrap_or(2);
        ShutdownPhase::from_u8(previous.saturating_add(1).min(2))
    }

    /// Jump straight to [`ShutdownPhase::Terminated`].
    pub fn terminate(&self) {
        self.phase.store(2, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.phase() == ShutdownPhase::Running
    }
}
