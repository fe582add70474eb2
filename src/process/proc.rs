//! Handle for a child that leads its own process group.

use crate::error::{HarvestError, Result};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

/// Owned handle to a spawned child.
///
/// The child must have been spawned with `process_group(0)`; signals are
/// always sent to the whole group.
pub struct ChildProc {
    pid: Pid,
    reaped: bool,
}

impl ChildProc {
    /// Take over a spawned child.
    ///
    /// Pipes the caller wants to keep must be taken out of `child` first;
    /// whatever is left is closed here.
    pub fn from_child(child: std::process::Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            reaped: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Try to reap the child (non-blocking).
    ///
    /// Returns `None` while the child is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        if self.reaped {
            return Err(HarvestError::Worker("Process already reaped".into()));
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                self.reaped = true;
                Ok(Some(status))
            }
            Err(e) => {
                self.reaped = true;
                Err(HarvestError::Worker(format!("waitpid failed: {}", e)))
            }
        }
    }

    /// Wait for the child to exit (blocking).
    pub fn wait(&mut self) -> Result<WaitStatus> {
        if self.reaped {
            return Err(HarvestError::Worker("Process already reaped".into()));
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.reaped = true;
                    return Err(HarvestError::Worker(format!("waitpid failed: {}", e)));
                }
            }
        }
    }

    /// Send a signal to the child's process group.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal_group(self.pid, signal)
    }

    /// Send SIGKILL to the process group and reap the child.
    pub fn kill(&mut self) -> Result<()> {
        if self.reaped {
            return Ok(());
        }
        self.signal(Signal::SIGKILL)?;
        self.wait()?;
        Ok(())
    }
}

impl Drop for ChildProc {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = signal_group(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

/// `killpg` that treats an already-empty group as success.
pub(crate) fn signal_group(pgid: Pid, signal: Signal) -> Result<()> {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(HarvestError::Worker(format!(
            "Failed to send {:?} to process group {}: {}",
            signal, pgid, e
        ))),
    }
}
