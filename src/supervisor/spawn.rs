//! Worker process spawning.

use crate::error::{HarvestError, Result};
use crate::process::{ChildProc, die_with_parent};
use nix::sys::signal::Signal;
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// Environment variable telling a worker which slot it fills.
pub const WORKER_SLOT_ENV: &str = "STATHARVEST_WORKER_SLOT";

/// How to start one worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<OsString>,
    pin_cpus: bool,
}

impl WorkerLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
            pin_cpus: false,
        }
    }

    /// Re-run the current executable with `args`.
    pub fn current_exe(args: Vec<OsString>) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| HarvestError::Worker(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(program, args))
    }

    /// Pin slot `n` to CPU `n % ncpu`.
    pub fn with_cpu_pinning(mut self, pin: bool) -> Self {
        self.pin_cpus = pin;
        self
    }

    /// Spawn a worker for `slot`.
    ///
    /// The worker leads its own process group, so signalling the group
    /// reaches the worker and nothing else of ours. Its stdout and stderr go
    /// to ours.
    pub fn spawn(&self, slot: usize) -> Result<ChildProc> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_SLOT_ENV, slot.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);
        // SIGTERM lets an orphaned worker stop its solver on the way out.
        // Safety: the hook only calls prctl(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| die_with_parent(Signal::SIGTERM));
        }

        let child = cmd.spawn().map_err(|e| {
            HarvestError::Worker(format!(
                "Failed to spawn worker {} ({}): {}",
                slot,
                self.program.display(),
                e
            ))
        })?;
        let proc = ChildProc::from_child(child);

        if self.pin_cpus {
            pin_to_cpu(&proc, slot);
        }
        Ok(proc)
    }
}

/// Best-effort CPU affinity for a freshly spawned worker.
#[cfg(target_os = "linux")]
fn pin_to_cpu(proc: &ChildProc, slot: usize) {
    use nix::sched::{CpuSet, sched_setaffinity};

    let ncpu = std::thread::available_parallelism().map_or(1, |n| n.get());
    let cpu = slot % ncpu;
    let mut set = CpuSet::new();
    let result = set
        .set(cpu)
        .and_then(|()| sched_setaffinity(proc.pid(), &set));
    match result {
        Ok(()) => tracing::debug!(slot, cpu, pid = proc.pid().as_raw(), "Pinned worker"),
        Err(e) => tracing::debug!(slot, cpu, error = %e, "Could not pin worker"),
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_proc: &ChildProc, slot: usize) {
    tracing::debug!(slot, "CPU pinning is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::WaitStatus;

    #[test]
    fn test_spawn_passes_slot_and_args() {
        let launcher = WorkerLauncher::new(
            "sh",
            vec!["-c".into(), format!("test \"${}\" = 3 && exit \"$0\"", WORKER_SLOT_ENV).into(), "5".into()],
        );
        let mut proc = launcher.spawn(3).unwrap();
        assert!(matches!(proc.wait().unwrap(), WaitStatus::Exited(_, 5)));
    }

    #[test]
    fn test_spawn_with_pinning() {
        let launcher = WorkerLauncher::new("true", Vec::new()).with_cpu_pinning(true);
        let mut proc = launcher.spawn(1).unwrap();
        assert!(matches!(proc.wait().unwrap(), WaitStatus::Exited(_, 0)));
    }

    #[test]
    fn test_spawn_missing_program() {
        let launcher = WorkerLauncher::new("/nonexistent/statharvest-worker", Vec::new());
        let err = launcher.spawn(0).err().unwrap();
        assert!(err.to_string().contains("Failed to spawn worker 0"));
    }
}
