//! Worker loop: claim a problem, run the solver, report, repeat.
//!
//! One worker runs per process and handles one problem at a time. The loop
//! moves through `Idle -> Claimed -> Running -> Reporting | Failed -> Idle`.
//! Per-problem failures are recorded on the problem and the loop carries
//! on; environment failures end the worker, and store outages are waited
//! out with capped exponential backoff.

use crate::error::{HarvestError, Result};
use crate::snapshot::{SavePoints, SnapshotExtractor};
use crate::solver::{DEFAULT_TIME_KEY, SolverRunner};
use crate::store::{Mode, Problem, TaskStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

/// Granularity of interruptible sleeps.
const SLEEP_STEP: Duration = Duration::from_millis(100);

/// Where the worker is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Claimed,
    Running,
    Reporting,
    Failed,
}

/// What to do when the queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePolicy {
    /// Stop with [`WorkerExit::Drained`].
    Exit,
    /// Sleep and try again.
    Poll(Duration),
}

/// Backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Give up after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub mode: Mode,
    /// Solver time limit in milliseconds.
    pub time_limit_ms: u64,
    pub save_points: SavePoints,
    /// Statistic carrying elapsed search seconds.
    pub time_key: String,
    pub idle: IdlePolicy,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(mode: Mode, time_limit_ms: u64, save_points: SavePoints) -> Self {
        Self {
            mode,
            time_limit_ms,
            save_points,
            time_key: DEFAULT_TIME_KEY.to_string(),
            idle: IdlePolicy::Exit,
            retry: RetryPolicy::default(),
        }
    }
}

/// Why the worker loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// No problem left to claim.
    Drained,
    /// A stop was requested; any in-flight claim was released.
    Interrupted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
    pub released: usize,
    /// Results discarded because the claim was reset under us.
    pub lost_claims: usize,
}

enum Attempt {
    Finished,
    Interrupted,
}

pub struct Worker<'a, S: TaskStore> {
    store: &'a S,
    runner: SolverRunner,
    config: WorkerConfig,
    stop: Arc<AtomicBool>,
    state: WorkerState,
    stats: WorkerStats,
}

impl<'a, S: TaskStore> Worker<'a, S> {
    /// `stop` is polled between problems and handed to the solver runner,
    /// so setting it interrupts a running solve.
    pub fn new(store: &'a S, runner: SolverRunner, config: WorkerConfig, stop: Arc<AtomicBool>) -> Self {
        Self {
            store,
            runner,
            config,
            stop,
            state: WorkerState::Idle,
            stats: WorkerStats::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Run until the queue is drained or a stop is requested.
    ///
    /// The solver environment is checked before the first claim; an
    /// [`HarvestError::Environment`] from here means nothing was claimed.
    pub fn run(&mut self) -> Result<WorkerExit> {
        self.runner.validate_environment()?;
        info!(
            mode = %self.config.mode,
            time_limit_ms = self.config.time_limit_ms,
            save_points = self.config.save_points.len(),
            solver = %self.runner.config().solver_id,
            "Worker started"
        );

        let exit = self.claim_loop();
        info!(
            completed = self.stats.completed,
            failed = self.stats.failed,
            released = self.stats.released,
            peak_rss_mib = peak_rss_mib(),
            "Worker stopped"
        );
        exit
    }

    fn claim_loop(&mut self) -> Result<WorkerExit> {
        let mode = self.config.mode;
        loop {
            self.state = WorkerState::Idle;
            if self.stopping() {
                return Ok(WorkerExit::Interrupted);
            }

            let store = self.store;
            let Some(problem) = self.retry("claim", || store.claim_next(mode))? else {
                match self.config.idle {
                    IdlePolicy::Exit => {
                        info!(%mode, "No unclaimed problems left");
                        return Ok(WorkerExit::Drained);
                    }
                    IdlePolicy::Poll(interval) => {
                        debug!(%mode, interval_secs = interval.as_secs_f64(), "Queue empty, waiting");
                        self.sleep(interval);
                        continue;
                    }
                }
            };

            if let Some(exit) = self.process(problem)? {
                return Ok(exit);
            }
        }
    }

    fn process(&mut self, mut problem: Problem) -> Result<Option<WorkerExit>> {
        let mode = self.config.mode;
        let span = info_span!("problem", problem_id = problem.id, %mode);
        let _enter = span.enter();

        self.state = WorkerState::Claimed;
        problem.time_limit = Some(self.config.time_limit_ms);
        info!(
            model = %problem.model_ref,
            instance = problem.instance_ref.as_deref().unwrap_or("-"),
            "Claimed problem"
        );

        self.state = WorkerState::Running;
        let started = Instant::now();
        let store = self.store;
        match self.attempt(&mut problem) {
            Ok(Attempt::Interrupted) => {
                self.retry("release", || store.release_claim(&problem))?;
                self.stats.released += 1;
                info!("Run interrupted, claim released");
                Ok(Some(WorkerExit::Interrupted))
            }
            Ok(Attempt::Finished) => {
                self.state = WorkerState::Reporting;
                let written = self.retry("update", || store.update_result(&problem))?;
                let marked = self.retry("complete", || store.mark_completed(&problem, mode, false))?;
                if written && marked {
                    self.stats.completed += 1;
                    info!(
                        solved = problem.solved,
                        problem_type = %problem.problem_type,
                        time_to_solution = ?problem.time_to_solution,
                        snapshots = problem.statistics.len(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Problem completed"
                    );
                } else {
                    self.stats.lost_claims += 1;
                    warn!("Claim was reset while solving; result discarded");
                }
                Ok(None)
            }
            Err(e) if e.is_per_task() => {
                self.state = WorkerState::Failed;
                warn!(error = %e, "Problem failed");
                self.retry("complete", || store.mark_completed(&problem, mode, true))?;
                self.retry("update", || store.update_result(&problem))?;
                self.stats.failed += 1;
                Ok(None)
            }
            Err(e) => {
                // Fatal for this worker; hand the problem back before leaving.
                if let Err(release_err) = store.release_claim(&problem) {
                    warn!(error = %release_err, "Failed to release claim");
                }
                Err(e)
            }
        }
    }

    /// Solve `problem`, writing whatever results were produced into it.
    ///
    /// Results are written before a solver error is returned, so the
    /// failure path can persist partial data.
    fn attempt(&self, problem: &mut Problem) -> Result<Attempt> {
        let mode = self.config.mode;
        let time_limit_ms = self.config.time_limit_ms;
        let mut run = self.runner.run(problem, time_limit_ms, Some(self.stop.clone()))?;

        let mut extractor = (mode == Mode::Features).then(|| {
            SnapshotExtractor::new(
                self.config.save_points.clone(),
                time_limit_ms,
                self.config.time_key.as_str(),
            )
        });
        for event in run.by_ref() {
            if let Some(extractor) = extractor.as_mut() {
                extractor.observe_event(&event);
            }
        }
        let outcome = run.finish()?;

        match (mode, extractor) {
            (Mode::Features, Some(extractor)) => {
                if !extractor.is_complete() {
                    debug!(
                        snapshots = extractor.snapshots().len(),
                        save_points = self.config.save_points.len(),
                        untimed = extractor.skipped_events(),
                        "Statistics stream ended before the last save point"
                    );
                }
                problem.statistics = extractor.into_snapshots();
            }
            _ => {
                problem.solved = outcome.solved;
                problem.problem_type = outcome.problem_type;
                problem.time_to_solution = outcome.time_to_solution;
            }
        }

        if outcome.interrupted {
            return Ok(Attempt::Interrupted);
        }
        if outcome.hard_timeout {
            warn!(time_limit_ms, "Solver overran its time limit and was killed");
        }
        if let Some(message) = outcome.error_message {
            return Err(HarvestError::SolverRuntime(message));
        }
        Ok(Attempt::Finished)
    }

    /// Run a store operation, waiting out transient failures.
    fn retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let policy = &self.config.retry;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_transient() && policy.max_attempts.is_none_or(|max| attempt < max) => {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        operation = what,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Task store unavailable, retrying"
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SLEEP_STEP.min(deadline - now));
        }
    }
}

/// Peak resident set size of this process in MiB.
fn peak_rss_mib() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = usage.max_rss().max(0) as u64;

            #[cfg(target_os = "macos")]
            {
                // macOS: max_rss is in bytes
                max_rss / (1024 * 1024)
            }

            #[cfg(not(target_os = "macos"))]
            {
                // Linux: max_rss is in kilobytes
                max_rss / 1024
            }
        }
        Err(_) => 0,
    }
}
