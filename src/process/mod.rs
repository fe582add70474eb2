//! Child process plumbing shared by the supervisor and the solver runner.
//!
//! Every child we spawn is made the leader of its own process group, so a
//! single `killpg` reaches anything it forks in turn (the solver frontend
//! and its backend, for instance).

mod ipc;
mod proc;
mod signals;

pub use ipc::{LineReader, PipeFd};
pub use proc::ChildProc;
pub(crate) use proc::signal_group;
pub use signals::{TerminationReason, analyze_wait_status};

/// Ask the kernel to send `signal` to this process when its parent dies.
///
/// Must only be called from a `pre_exec` hook.
#[cfg(target_os = "linux")]
pub(crate) fn die_with_parent(signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    nix::sys::prctl::set_pdeathsig(signal).map_err(std::io::Error::from)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn die_with_parent(_signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    Ok(())
}
