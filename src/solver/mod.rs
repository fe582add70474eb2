//! Running the constraint solver on one problem.
//!
//! A [`SolverRunner`] owns the solver configuration and checks the
//! environment once. Each [`SolverRunner::run`] starts the solver in its own
//! process group and returns a [`SolverRun`], an iterator over the decoded
//! event stream. [`SolverRun::finish`] reaps the process and folds
//! everything into a [`RunOutcome`].

mod deadline;
mod event;
mod outcome;

pub use deadline::{Deadline, DeadlineCause};
pub use event::SolverEvent;
pub use outcome::{OutcomeTracker, ProcessEnding, RunOutcome};

use crate::error::{HarvestError, Result};
use crate::paths;
use crate::process::{ChildProc, LineReader, PipeFd, die_with_parent};
use crate::store::{Mode, Problem};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

/// Solver frontend looked up on `PATH` by default.
pub const DEFAULT_EXECUTABLE: &str = "minizinc";

/// Statistic holding elapsed search time, in seconds.
pub const DEFAULT_TIME_KEY: &str = "optTime";

/// Stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// Solver used when none is configured for a mode.
pub fn default_solver_id(mode: Mode) -> &'static str {
    match mode {
        Mode::Label => "org.chuffed.chuffed",
        // Emits statistics periodically during search.
        Mode::Features => "org.chuffed.modded-chuffed",
    }
}

/// How to invoke the solver.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Solver frontend, either a bare name searched on `PATH` or a path.
    pub executable: PathBuf,
    /// Backend solver identifier passed to `--solver`.
    pub solver_id: String,
    /// Base directory for relative model and instance references.
    pub data_dir: PathBuf,
    /// Appended verbatim after the standard arguments.
    pub extra_args: Vec<String>,
    /// Hard deadline as a multiple of the time limit.
    pub slack_factor: f64,
    /// Added to the hard deadline for compilation and startup.
    pub startup_allowance: Duration,
    /// Time between SIGTERM and SIGKILL when the deadline fires.
    pub kill_grace: Duration,
    /// Ask the frontend whether it knows `solver_id` before the first run.
    pub check_solvers: bool,
}

impl SolverConfig {
    pub fn new(executable: impl Into<PathBuf>, solver_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            solver_id: solver_id.into(),
            data_dir: data_dir.into(),
            extra_args: Vec::new(),
            slack_factor: 1.5,
            startup_allowance: Duration::from_secs(10),
            kill_grace: Duration::from_secs(5),
            check_solvers: true,
        }
    }

    /// Wall-clock budget after which the solver is killed.
    pub fn hard_limit(&self, time_limit_ms: u64) -> Duration {
        let scaled = (time_limit_ms as f64 * self.slack_factor.max(1.0)).ceil() as u64;
        Duration::from_millis(scaled) + self.startup_allowance
    }
}

/// Launches solver runs for one worker.
pub struct SolverRunner {
    config: SolverConfig,
    resolved: OnceLock<PathBuf>,
}

impl SolverRunner {
    pub fn new(config: SolverConfig) -> Self {
        Self {
            config,
            resolved: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Check that the data directory, the solver frontend and the backend
    /// solver are all usable.
    ///
    /// Any failure is an [`HarvestError::Environment`]; no problem can make
    /// progress until it is fixed. The result is cached after the first
    /// success.
    pub fn validate_environment(&self) -> Result<&Path> {
        if let Some(exe) = self.resolved.get() {
            return Ok(exe);
        }

        if !self.config.data_dir.is_dir() {
            return Err(HarvestError::Environment(format!(
                "Data directory ({}) was not found",
                self.config.data_dir.display()
            )));
        }

        let exe = find_executable(&self.config.executable).ok_or_else(|| {
            HarvestError::Environment(format!(
                "Executable ({}) was not found",
                self.config.executable.display()
            ))
        })?;

        if self.config.check_solvers {
            let output = Command::new(&exe)
                .arg("--solvers")
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .output()
                .map_err(|e| {
                    HarvestError::Environment(format!(
                        "Executable ({}) could not be run: {}",
                        exe.display(),
                        e
                    ))
                })?;
            if !output.status.success() {
                return Err(HarvestError::Environment(format!(
                    "Executable ({}) failed to list solvers ({})",
                    exe.display(),
                    output.status
                )));
            }
            let listing = String::from_utf8_lossy(&output.stdout);
            if !listing.contains(self.config.solver_id.as_str()) {
                return Err(HarvestError::Environment(format!(
                    "Solver ({}) was not found",
                    self.config.solver_id
                )));
            }
        }

        tracing::debug!(executable = %exe.display(), solver = %self.config.solver_id, "Solver environment ok");
        Ok(self.resolved.get_or_init(|| exe))
    }

    /// Resolve and check the model and instance files of a problem.
    pub fn resolve_inputs(&self, problem: &Problem) -> Result<(PathBuf, Option<PathBuf>)> {
        let model = paths::resolve_input(&self.config.data_dir, &problem.model_ref);
        if !model.is_file() {
            return Err(HarvestError::InputNotFound {
                what: "Model",
                path: model,
            });
        }

        let instance = match &problem.instance_ref {
            Some(reference) => {
                let path = paths::resolve_input(&self.config.data_dir, reference);
                if !path.is_file() {
                    return Err(HarvestError::InputNotFound {
                        what: "Problem instance",
                        path,
                    });
                }
                Some(path)
            }
            None => None,
        };

        Ok((model, instance))
    }

    /// Argument list for one run, without the executable.
    pub fn arguments(&self, model: &Path, instance: Option<&Path>, time_limit_ms: u64) -> Vec<String> {
        let mut args = vec![model.display().to_string()];
        if let Some(instance) = instance {
            args.push(instance.display().to_string());
        }
        args.extend([
            "--solver".to_string(),
            self.config.solver_id.clone(),
            "-t".to_string(),
            time_limit_ms.to_string(),
            "--json-stream".to_string(),
            "--output-time".to_string(),
        ]);
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Start the solver on `problem`.
    ///
    /// Setting `interrupt` kills the solver early; the outcome then reports
    /// the run as interrupted.
    pub fn run(
        &self,
        problem: &Problem,
        time_limit_ms: u64,
        interrupt: Option<Arc<AtomicBool>>,
    ) -> Result<SolverRun> {
        let exe = self.validate_environment()?;
        let (model, instance) = self.resolve_inputs(problem)?;

        let mut cmd = Command::new(exe);
        cmd.args(self.arguments(&model, instance.as_deref(), time_limit_ms))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        // The solver's group is out of reach of the supervisor's signals, so
        // a worker killed outright takes the solver with it.
        // Safety: the hook only calls prctl(2), which is async-signal-safe.
        unsafe {
            cmd.pre_exec(|| die_with_parent(Signal::SIGKILL));
        }

        let mut child = cmd.spawn().map_err(|e| {
            HarvestError::Environment(format!("Failed to start {}: {}", exe.display(), e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarvestError::Worker("Solver stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarvestError::Worker("Solver stderr not captured".into()))?;
        let proc = ChildProc::from_child(child);

        let hard_limit = self.config.hard_limit(time_limit_ms);
        let deadline = Deadline::arm(proc.pid(), hard_limit, self.config.kill_grace, interrupt)?;

        tracing::debug!(
            problem_id = problem.id,
            pid = proc.pid().as_raw(),
            time_limit_ms,
            hard_limit_ms = hard_limit.as_millis() as u64,
            "Solver started"
        );

        Ok(SolverRun {
            problem_id: problem.id,
            stdout: LineReader::new(PipeFd::from(stdout)),
            stderr: Some(spawn_stderr_collector(problem.id, PipeFd::from(stderr))?),
            deadline,
            tracker: OutcomeTracker::new(),
            stream_done: false,
            proc,
        })
    }
}

/// A running solver.
///
/// Iterating yields decoded events in stream order; malformed lines are
/// logged and skipped. Dropping an unfinished run kills the solver.
pub struct SolverRun {
    problem_id: i64,
    stdout: LineReader,
    stderr: Option<JoinHandle<Vec<String>>>,
    deadline: Deadline,
    tracker: OutcomeTracker,
    stream_done: bool,
    proc: ChildProc,
}

impl SolverRun {
    /// Drain the stream, reap the solver and classify the run.
    pub fn finish(mut self) -> Result<RunOutcome> {
        while self.next().is_some() {}

        let status = self.proc.wait()?;
        self.deadline.disarm();
        let stderr_tail = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let mut ending = ProcessEnding {
            stderr_tail,
            ..Default::default()
        };
        match status {
            WaitStatus::Exited(_, code) => ending.exit_code = Some(code),
            WaitStatus::Signaled(..) => ending.signaled = true,
            _ => {}
        }
        match self.deadline.fired() {
            Some(DeadlineCause::TimedOut) => ending.hard_timeout = true,
            Some(DeadlineCause::Interrupted) => ending.interrupted = true,
            None => {}
        }

        let outcome = std::mem::take(&mut self.tracker).finish(ending);
        tracing::debug!(
            problem_id = self.problem_id,
            solved = outcome.solved,
            problem_type = %outcome.problem_type,
            timed_out = outcome.timed_out,
            events = outcome.events,
            malformed = outcome.malformed_lines,
            "Solver finished"
        );
        Ok(outcome)
    }
}

impl Iterator for SolverRun {
    type Item = SolverEvent;

    fn next(&mut self) -> Option<SolverEvent> {
        while !self.stream_done {
            match self.stdout.read_line() {
                Ok(Some(line)) => {
                    let Some(event) = SolverEvent::from_line(line) else {
                        continue;
                    };
                    self.tracker.observe(&event);
                    if let Some(e) = event.decode_error() {
                        tracing::warn!(problem_id = self.problem_id, error = %e, "Skipping solver output");
                        continue;
                    }
                    return Some(event);
                }
                Ok(None) => self.stream_done = true,
                Err(e) => {
                    tracing::warn!(problem_id = self.problem_id, error = %e, "Failed to read solver output");
                    self.stream_done = true;
                }
            }
        }
        None
    }
}

/// Forward solver stderr to the debug log and keep the last few lines.
fn spawn_stderr_collector(problem_id: i64, fd: PipeFd) -> std::io::Result<JoinHandle<Vec<String>>> {
    std::thread::Builder::new()
        .name(format!("solver-stderr-{}", problem_id))
        .spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(fd).lines() {
                let Ok(line) = line else { break };
                let line = line.trim_end().to_string();
                if line.is_empty() {
                    continue;
                }
                tracing::debug!(problem_id, "solver: {}", line);
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail)
        })
}

/// Locate `executable` the way a shell would.
fn find_executable(executable: &Path) -> Option<PathBuf> {
    if executable.components().count() > 1 {
        return is_executable(executable).then(|| executable.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(executable))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::store::ProblemType;
    use std::fs;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for the solver frontend.
    ///
    /// `--solvers` lists both default solvers; any other invocation runs
    /// `body`.
    pub(crate) fn fake_solver(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-minizinc");
        let script = format!(
            "#!/bin/sh\nif [ \"$1\" = \"--solvers\" ]; then\n  echo org.chuffed.chuffed\n  echo org.chuffed.modded-chuffed\n  exit 0\nfi\n{}\n",
            body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub(crate) fn problem(model: &str, instance: Option<&str>) -> Problem {
        Problem {
            id: 1,
            model_ref: model.to_string(),
            instance_ref: instance.map(str::to_string),
            time_limit: None,
            problem_type: ProblemType::Unknown,
            time_to_solution: None,
            solved: false,
            error: false,
            statistics: Vec::new(),
            claimed_label: false,
            claimed_features: false,
            generated_label: false,
            generated_features: false,
            updated_at: None,
            lease: None,
        }
    }

    fn setup(body: &str) -> (TempDir, SolverRunner) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.mzn"), "var 1..3: x;\nsolve satisfy;\n").unwrap();
        fs::write(dir.path().join("b.dzn"), "").unwrap();
        let exe = fake_solver(dir.path(), body);
        let runner = SolverRunner::new(SolverConfig::new(exe, "org.chuffed.chuffed", dir.path()));
        (dir, runner)
    }

    #[test]
    fn test_hard_limit() {
        let mut config = SolverConfig::new("minizinc", "x", "/tmp");
        config.slack_factor = 2.0;
        config.startup_allowance = Duration::from_secs(1);
        assert_eq!(config.hard_limit(1000), Duration::from_millis(3000));

        // Slack never shrinks the budget.
        config.slack_factor = 0.5;
        assert_eq!(config.hard_limit(1000), Duration::from_millis(2000));
    }

    #[test]
    fn test_missing_executable_is_environment_error() {
        let dir = TempDir::new().unwrap();
        let runner = SolverRunner::new(SolverConfig::new(
            "statharvest-no-such-solver",
            "org.chuffed.chuffed",
            dir.path(),
        ));
        let err = runner.validate_environment().unwrap_err();
        assert!(matches!(err, HarvestError::Environment(_)));
        assert!(err.to_string().contains("statharvest-no-such-solver"));
    }

    #[test]
    fn test_missing_solver_is_environment_error() {
        let (_dir, runner) = setup("exit 0");
        let mut config = runner.config().clone();
        config.solver_id = "org.gecode.gecode".to_string();
        let err = SolverRunner::new(config).validate_environment().unwrap_err();
        assert!(matches!(err, HarvestError::Environment(_)));
        assert!(err.to_string().contains("org.gecode.gecode"));
    }

    #[test]
    fn test_missing_data_dir_is_environment_error() {
        let runner = SolverRunner::new(SolverConfig::new(
            "sh",
            "org.chuffed.chuffed",
            "/nonexistent/statharvest/data",
        ));
        assert!(matches!(
            runner.validate_environment(),
            Err(HarvestError::Environment(_))
        ));
    }

    #[test]
    fn test_missing_inputs_are_reported() {
        let (_dir, runner) = setup("exit 0");

        let err = runner.resolve_inputs(&problem("nope.mzn", None)).unwrap_err();
        assert!(matches!(err, HarvestError::InputNotFound { what: "Model", .. }));

        let err = runner
            .resolve_inputs(&problem("a.mzn", Some("nope.dzn")))
            .unwrap_err();
        assert!(matches!(
            err,
            HarvestError::InputNotFound {
                what: "Problem instance",
                ..
            }
        ));

        let (model, instance) = runner.resolve_inputs(&problem("a.mzn", Some("b.dzn"))).unwrap();
        assert!(model.ends_with("a.mzn"));
        assert!(instance.unwrap().ends_with("b.dzn"));
    }

    #[test]
    fn test_arguments_layout() {
        let (_dir, runner) = setup("exit 0");
        let args = runner.arguments(Path::new("/d/a.mzn"), Some(Path::new("/d/b.dzn")), 5000);
        assert_eq!(
            args,
            vec![
                "/d/a.mzn",
                "/d/b.dzn",
                "--solver",
                "org.chuffed.chuffed",
                "-t",
                "5000",
                "--json-stream",
                "--output-time"
            ]
        );

        let args = runner.arguments(Path::new("/d/a.mzn"), None, 10);
        assert_eq!(args[1], "--solver");
    }

    #[test]
    fn test_run_streams_events() {
        let (_dir, runner) = setup(
            r#"echo '{"type":"statistics","statistics":{"optTime":0.1,"nodes":4}}'
echo 'garbage'
echo ''
echo '{"type":"solution","output":{"default":"x = 1;"},"time":500}'
echo '{"type":"status","status":"OPTIMAL_SOLUTION","time":600}'
echo 'note on stderr' >&2"#,
        );
        let mut run = runner.run(&problem("a.mzn", Some("b.dzn")), 1000, None).unwrap();
        let events: Vec<SolverEvent> = run.by_ref().collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], SolverEvent::Statistics { .. }));

        let outcome = run.finish().unwrap();
        assert!(outcome.solved);
        assert_eq!(outcome.problem_type, ProblemType::Opt);
        assert_eq!(outcome.time_to_solution, Some(500.0));
        assert_eq!(outcome.malformed_lines, 1);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(!outcome.had_error);
    }

    #[test]
    fn test_run_reports_solver_failure() {
        let (_dir, runner) = setup("echo 'flattening failed' >&2\nexit 1");
        let run = runner.run(&problem("a.mzn", None), 1000, None).unwrap();
        let outcome = run.finish().unwrap();
        assert!(outcome.had_error);
        assert!(outcome.error_message.unwrap().contains("flattening failed"));
        assert!(!outcome.solved);
    }

    #[test]
    fn test_run_hard_timeout() {
        let (_dir, runner) = setup("exec sleep 60");
        let mut config = runner.config().clone();
        config.slack_factor = 1.0;
        config.startup_allowance = Duration::ZERO;
        config.kill_grace = Duration::from_millis(500);
        let runner = SolverRunner::new(config);

        let run = runner.run(&problem("a.mzn", None), 300, None).unwrap();
        let outcome = run.finish().unwrap();
        assert!(outcome.hard_timeout);
        assert!(outcome.timed_out);
        assert!(!outcome.solved);
        assert!(!outcome.had_error);
    }

    #[test]
    fn test_run_interrupted() {
        let (_dir, runner) = setup("exec sleep 60");
        let interrupt = Arc::new(AtomicBool::new(false));
        let run = runner
            .run(&problem("a.mzn", None), 60_000, Some(interrupt.clone()))
            .unwrap();
        interrupt.store(true, std::sync::atomic::Ordering::Relaxed);
        let outcome = run.finish().unwrap();
        assert!(outcome.interrupted);
        assert!(!outcome.had_error);
    }
}
