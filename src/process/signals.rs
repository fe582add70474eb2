//! Classification of child process exits.

use crate::error::{ENVIRONMENT_EXIT_CODE, INTERRUPTED_EXIT_CODE};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a child process terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// SIGKILL with no request from us, most likely the OOM killer.
    OutOfMemory,
    /// SIGSEGV, or SIGBUS on macOS.
    Segfault,
    StillAlive,
    Unknown,
}

impl TerminationReason {
    /// Worker ran out of problems and stopped on its own.
    pub fn is_drained(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Worker found the solver environment unusable; respawning cannot help.
    pub fn is_environment_failure(&self) -> bool {
        matches!(self, Self::Exited(code) if *code == ENVIRONMENT_EXIT_CODE)
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) if *code == ENVIRONMENT_EXIT_CODE => {
                format!("exited with code {} (environment failure)", code)
            }
            Self::Exited(code) if *code == INTERRUPTED_EXIT_CODE => {
                format!("exited with code {} (stopped by a signal)", code)
            }
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled(sig) => format!("killed by signal {:?}", sig),
            Self::OutOfMemory => "killed by SIGKILL (possibly out of memory)".to_string(),
            Self::Segfault => "segmentation fault".to_string(),
            Self::StillAlive => "still running".to_string(),
            Self::Unknown => "unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => match signal {
            Signal::SIGKILL => TerminationReason::OutOfMemory,
            Signal::SIGSEGV | Signal::SIGBUS => TerminationReason::Segfault,
            _ => TerminationReason::Signaled(signal),
        },
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
