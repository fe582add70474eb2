//! Pool supervisor: keeps a fixed number of worker processes alive.
//!
//! Each slot holds at most one worker process. Polling reaps dead workers
//! and decides per slot: a worker that exited 0 drained the queue and
//! retires its slot, one that found the environment broken retires it too
//! (respawning cannot help), and anything else gets a replacement in the
//! same slot. That includes a worker that was sent SIGTERM by someone else
//! and exited cleanly with
//! [`INTERRUPTED_EXIT_CODE`](crate::error::INTERRUPTED_EXIT_CODE).
//!
//! The supervisor returns once every slot is retired or a shutdown is
//! requested.

mod shutdown;
mod spawn;

pub use shutdown::{ShutdownPhase, ShutdownSignal};
pub use spawn::{WORKER_SLOT_ENV, WorkerLauncher};

use crate::error::{HarvestError, Result};
use crate::process::{ChildProc, TerminationReason, analyze_wait_status};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Step used when sleeping between polls so interrupts are noticed quickly.
const WAIT_STEP: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub worker_count: usize,
    /// Time between liveness checks.
    pub poll_interval: Duration,
    /// How long workers get to exit after SIGTERM before SIGKILL.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism().map_or(1, |n| n.get()),
            poll_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// State of one worker slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Running,
    /// Worker exited after draining the queue.
    Drained,
    /// Worker exited because the solver environment is unusable.
    EnvironmentFailure,
    /// Replacement could not be spawned; retried on the next poll.
    Vacant,
    /// Stopped by shutdown.
    Stopped,
}

impl SlotStatus {
    pub fn is_retired(&self) -> bool {
        matches!(self, Self::Drained | Self::EnvironmentFailure | Self::Stopped)
    }
}

/// Something that happened to a slot during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    Drained { slot: usize },
    EnvironmentFailure { slot: usize },
    Respawned { slot: usize, reason: TerminationReason },
    RespawnFailed { slot: usize, error: String },
}

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// Every worker drained the queue.
    Drained,
    /// At least one worker reported an environment failure.
    EnvironmentFailure,
    /// Stopped on request.
    Interrupted,
}

struct Slot {
    id: usize,
    proc: Option<ChildProc>,
    status: SlotStatus,
    restarts: usize,
    spawned_at: Instant,
}

pub struct Supervisor {
    config: SupervisorConfig,
    launcher: WorkerLauncher,
    slots: Vec<Slot>,
    shut_down: bool,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, launcher: WorkerLauncher) -> Self {
        Self {
            config,
            launcher,
            slots: Vec::new(),
            shut_down: false,
        }
    }

    /// Spawn `n` workers into slots `0..n`.
    pub fn start(&mut self, n: usize) -> Result<()> {
        if n == 0 {
            return Err(HarvestError::InvalidConfig("worker count must be at least 1".into()));
        }
        if !self.slots.is_empty() {
            return Err(HarvestError::Worker("supervisor already started".into()));
        }
        info!(workers = n, "Starting worker pool");
        for id in 0..n {
            let proc = self.launcher.spawn(id)?;
            info!(slot = id, pid = proc.pid().as_raw(), "Worker started");
            self.slots.push(Slot {
                id,
                proc: Some(proc),
                status: SlotStatus::Running,
                restarts: 0,
                spawned_at: Instant::now(),
            });
        }
        Ok(())
    }

    /// Check every slot once, respawning crashed workers.
    pub fn poll(&mut self) -> Vec<SlotEvent> {
        self.poll_slots(None)
    }

    /// Like [`Supervisor::poll`], but once `signal` leaves `Running` dead
    /// workers are marked stopped instead of being respawned or counted as
    /// drained.
    fn poll_slots(&mut self, signal: Option<&ShutdownSignal>) -> Vec<SlotEvent> {
        let stopping = || signal.is_some_and(|s| !s.is_running());
        let mut events = Vec::new();
        for slot in &mut self.slots {
            match slot.status {
                SlotStatus::Running => {}
                SlotStatus::Vacant if !stopping() => {
                    respawn(&self.launcher, slot, TerminationReason::Unknown, &mut events);
                    continue;
                }
                _ => continue,
            }

            let Some(proc) = slot.proc.as_mut() else {
                continue;
            };
            let reason = match proc.try_wait() {
                Ok(None) => continue,
                Ok(Some(status)) => analyze_wait_status(status),
                Err(e) => {
                    warn!(slot = slot.id, error = %e, "Lost track of worker");
                    TerminationReason::Unknown
                }
            };
            slot.proc = None;

            if stopping() {
                info!(slot = slot.id, %reason, "Worker stopped");
                slot.status = SlotStatus::Stopped;
            } else if reason.is_drained() {
                info!(slot = slot.id, "Worker drained the queue");
                slot.status = SlotStatus::Drained;
                events.push(SlotEvent::Drained { slot: slot.id });
            } else if reason.is_environment_failure() {
                error!(slot = slot.id, "Worker found the solver environment unusable; not respawning");
                slot.status = SlotStatus::EnvironmentFailure;
                events.push(SlotEvent::EnvironmentFailure { slot: slot.id });
            } else {
                let crash = HarvestError::ProcessCrashed {
                    slot: slot.id,
                    reason: reason.to_string(),
                };
                warn!(
                    slot = slot.id,
                    uptime_secs = slot.spawned_at.elapsed().as_secs(),
                    restarts = slot.restarts,
                    "{}",
                    crash
                );
                respawn(&self.launcher, slot, reason, &mut events);
            }
        }
        events
    }

    /// Poll until every slot is retired or `signal` leaves `Running`.
    pub fn supervise(&mut self, signal: &ShutdownSignal) -> Result<SupervisorExit> {
        if self.slots.is_empty() {
            self.start(self.config.worker_count)?;
        }
        loop {
            if !signal.is_running() {
                info!("Shutdown requested, stopping workers");
                self.shutdown_with(Some(signal));
                return Ok(SupervisorExit::Interrupted);
            }

            self.poll_slots(Some(signal));
            if !signal.is_running() {
                continue;
            }

            if self.slots.iter().all(|s| s.status.is_retired()) {
                self.shut_down = true;
                let exit = if self.slots.iter().any(|s| s.status == SlotStatus::EnvironmentFailure) {
                    SupervisorExit::EnvironmentFailure
                } else {
                    SupervisorExit::Drained
                };
                info!(?exit, "All workers finished");
                return Ok(exit);
            }

            let deadline = Instant::now() + self.config.poll_interval;
            while signal.is_running() && Instant::now() < deadline {
                std::thread::sleep(WAIT_STEP);
            }
        }
    }

    /// Stop all workers: SIGTERM, wait, then SIGKILL stragglers.
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&mut self) {
        self.shutdown_with(None);
    }

    /// Like [`Supervisor::shutdown`], but skips straight to SIGKILL once
    /// `signal` reaches [`ShutdownPhase::Terminated`].
    pub fn shutdown_with(&mut self, signal: Option<&ShutdownSignal>) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        let forced = |s: Option<&ShutdownSignal>| s.is_some_and(|s| s.phase() == ShutdownPhase::Terminated);

        for slot in &mut self.slots {
            if let Some(proc) = slot.proc.as_ref() {
                let sig = if forced(signal) { Signal::SIGKILL } else { Signal::SIGTERM };
                if let Err(e) = proc.signal(sig) {
                    warn!(slot = slot.id, error = %e, "Failed to signal worker");
                }
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            let mut alive = 0;
            for slot in &mut self.slots {
                if let Some(proc) = slot.proc.as_mut() {
                    match proc.try_wait() {
                        Ok(None) => alive += 1,
                        Ok(Some(_)) | Err(_) => {
                            slot.proc = None;
                            slot.status = SlotStatus::Stopped;
                        }
                    }
                }
            }
            if alive == 0 {
                break;
            }
            if forced(signal) || Instant::now() >= deadline {
                warn!(workers = alive, "Killing workers that did not stop in time");
                break;
            }
            std::thread::sleep(WAIT_STEP);
        }

        for slot in &mut self.slots {
            if let Some(mut proc) = slot.proc.take() {
                if let Err(e) = proc.kill() {
                    warn!(slot = slot.id, error = %e, "Failed to kill worker");
                }
            }
            if !slot.status.is_retired() {
                slot.status = SlotStatus::Stopped;
            }
        }
        if let Some(signal) = signal {
            signal.terminate();
        }
        info!("Worker pool stopped");
    }

    /// Pid per slot; `None` for slots without a live worker.
    pub fn slot_pids(&self) -> Vec<Option<Pid>> {
        self.slots
            .iter()
            .map(|s| s.proc.as_ref().map(ChildProc::pid))
            .collect()
    }

    pub fn slot_statuses(&self) -> Vec<SlotStatus> {
        self.slots.iter().map(|s| s.status).collect()
    }

    pub fn restarts(&self) -> usize {
        self.slots.iter().map(|s| s.restarts).sum()
    }

    /// Slots with a live worker.
    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.proc.is_some()).count()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn respawn(launcher: &WorkerLauncher, slot: &mut Slot, reason: TerminationReason, events: &mut Vec<SlotEvent>) {
    match launcher.spawn(slot.id) {
        Ok(proc) => {
            slot.restarts += 1;
            info!(
                slot = slot.id,
                pid = proc.pid().as_raw(),
                restarts = slot.restarts,
                "Worker respawned"
            );
            slot.proc = Some(proc);
            slot.status = SlotStatus::Running;
            slot.spawned_at = Instant::now();
            events.push(SlotEvent::Respawned { slot: slot.id, reason });
        }
        Err(e) => {
            error!(slot = slot.id, error = %e, "Failed to respawn worker");
            slot.status = SlotStatus::Vacant;
            events.push(SlotEvent::RespawnFailed {
                slot: slot.id,
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::kill;

    fn config(poll_ms: u64) -> SupervisorConfig {
        SupervisorConfig {
            worker_count: 2,
            poll_interval: Duration::from_millis(poll_ms),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn sh(script: &str) -> WorkerLauncher {
        WorkerLauncher::new("sh", vec!["-c".into(), script.into()])
    }

    /// Poll until something happens or two seconds pass.
    fn poll_until_event(supervisor: &mut Supervisor) -> Vec<SlotEvent> {
        let start = Instant::now();
        loop {
            let events = supervisor.poll();
            if !events.is_empty() || start.elapsed() > Duration::from_secs(2) {
                return events;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_killed_worker_is_replaced_in_its_slot() {
        let mut supervisor = Supervisor::new(config(50), WorkerLauncher::new("sleep", vec!["60".into()]));
        supervisor.start(2).unwrap();
        let before = supervisor.slot_pids();
        let victim = before[1].unwrap();

        kill(victim, Signal::SIGKILL).unwrap();
        let events = poll_until_event(&mut supervisor);

        assert_eq!(
            events,
            vec![SlotEvent::Respawned {
                slot: 1,
                reason: TerminationReason::OutOfMemory,
            }]
        );
        let after = supervisor.slot_pids();
        assert_eq!(after[0], before[0]);
        assert!(after[1].is_some());
        assert_ne!(after[1], before[1]);
        assert_eq!(supervisor.restarts(), 1);

        supervisor.shutdown();
        assert_eq!(supervisor.active_count(), 0);
    }

    #[test]
    fn test_worker_stopped_by_sigterm_is_replaced() {
        let script = format!(
            "trap 'exit {}' TERM; while :; do sleep 0.05; done",
            crate::error::INTERRUPTED_EXIT_CODE
        );
        let mut supervisor = Supervisor::new(config(50), sh(&script));
        supervisor.start(2).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let before = supervisor.slot_pids();

        // What `kill <pid>` does: SIGTERM to the worker alone.
        kill(before[1].unwrap(), Signal::SIGTERM).unwrap();
        let events = poll_until_event(&mut supervisor);

        assert_eq!(
            events,
            vec![SlotEvent::Respawned {
                slot: 1,
                reason: TerminationReason::Exited(crate::error::INTERRUPTED_EXIT_CODE),
            }]
        );
        let after = supervisor.slot_pids();
        assert_eq!(after[0], before[0]);
        assert!(after[1].is_some());
        assert_ne!(after[1], before[1]);
        assert_eq!(supervisor.slot_statuses(), vec![SlotStatus::Running; 2]);

        supervisor.shutdown();
    }

    #[test]
    fn test_exits_during_shutdown_are_not_respawned() {
        let mut supervisor = Supervisor::new(config(20), sh("exit 3"));
        supervisor.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let signal = ShutdownSignal::new();
        signal.request();
        let events = supervisor.poll_slots(Some(&signal));

        assert!(events.is_empty());
        assert_eq!(supervisor.slot_statuses(), vec![SlotStatus::Stopped]);
        assert_eq!(supervisor.restarts(), 0);
        assert_eq!(supervisor.active_count(), 0);
    }

    #[test]
    fn test_second_interrupt_escalates_to_sigkill() {
        let mut cfg = config(50);
        cfg.shutdown_timeout = Duration::from_secs(30);
        let mut supervisor = Supervisor::new(cfg, sh("trap '' TERM; while :; do sleep 0.05; done"));
        supervisor.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let signal = ShutdownSignal::new();
        assert_eq!(signal.request(), ShutdownPhase::Draining);
        let handler_side = signal.clone();
        let second = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            handler_side.request()
        });

        let started = Instant::now();
        supervisor.shutdown_with(Some(&signal));

        assert_eq!(second.join().unwrap(), ShutdownPhase::Terminated);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.slot_statuses(), vec![SlotStatus::Stopped]);
    }

    #[test]
    fn test_drained_and_environment_exits_retire_slots() {
        let script = format!(
            "if [ \"${}\" = 0 ]; then exit 0; else exit {}; fi",
            WORKER_SLOT_ENV,
            crate::error::ENVIRONMENT_EXIT_CODE
        );
        let mut supervisor = Supervisor::new(config(20), sh(&script));
        let exit = supervisor.supervise(&ShutdownSignal::new()).unwrap();

        assert_eq!(exit, SupervisorExit::EnvironmentFailure);
        assert_eq!(
            supervisor.slot_statuses(),
            vec![SlotStatus::Drained, SlotStatus::EnvironmentFailure]
        );
        assert_eq!(supervisor.restarts(), 0);
    }

    #[test]
    fn test_all_drained() {
        let mut supervisor = Supervisor::new(config(20), WorkerLauncher::new("true", Vec::new()));
        assert_eq!(
            supervisor.supervise(&ShutdownSignal::new()).unwrap(),
            SupervisorExit::Drained
        );
    }

    #[test]
    fn test_crashing_worker_is_respawned() {
        let mut supervisor = Supervisor::new(config(20), sh("exit 3"));
        supervisor.start(1).unwrap();

        let events = poll_until_event(&mut supervisor);
        assert_eq!(
            events,
            vec![SlotEvent::Respawned {
                slot: 0,
                reason: TerminationReason::Exited(3),
            }]
        );
        supervisor.shutdown();
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut supervisor = Supervisor::new(config(50), WorkerLauncher::new("sleep", vec!["60".into()]));
        supervisor.start(2).unwrap();
        assert_eq!(supervisor.active_count(), 2);

        supervisor.shutdown();
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(supervisor.slot_statuses(), vec![SlotStatus::Stopped; 2]);

        supervisor.shutdown();
        assert_eq!(supervisor.active_count(), 0);
    }

    #[test]
    fn test_stubborn_worker_is_killed() {
        let mut cfg = config(50);
        cfg.shutdown_timeout = Duration::from_millis(300);
        let mut supervisor = Supervisor::new(cfg, sh("trap '' TERM; sleep 60 & wait; sleep 60"));
        supervisor.start(1).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        supervisor.shutdown();
        assert_eq!(supervisor.active_count(), 0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_supervise_stops_on_interrupt() {
        let mut supervisor = Supervisor::new(config(50), WorkerLauncher::new("sleep", vec!["60".into()]));
        let signal = ShutdownSignal::new();
        let handler_side = signal.clone();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            handler_side.request();
        });

        let exit = supervisor.supervise(&signal).unwrap();
        trigger.join().unwrap();

        assert_eq!(exit, SupervisorExit::Interrupted);
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(signal.phase(), ShutdownPhase::Terminated);
    }

    #[test]
    fn test_start_rejects_zero_workers() {
        let mut supervisor = Supervisor::new(config(50), WorkerLauncher::new("true", Vec::new()));
        assert!(matches!(supervisor.start(0), Err(HarvestError::InvalidConfig(_))));
    }
}
