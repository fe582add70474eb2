//! Command-line interface definitions using clap.

use crate::logging::{LogFormat, LogRotation};
use crate::output::OutputFormat;
use crate::paths;
use crate::solver::{DEFAULT_EXECUTABLE, DEFAULT_TIME_KEY, default_solver_id};
use crate::store::Mode;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::ffi::OsString;
use std::path::PathBuf;

/// Worker pool that runs constraint solvers over a problem queue and
/// records labels and time-sliced solver statistics.
#[derive(Parser, Debug)]
#[command(name = "statharvest")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the problem database.
    #[arg(long, global = true, env = "STATHARVEST_DB_PATH", default_value_os_t = paths::get_store_path())]
    pub db_path: PathBuf,

    /// Seconds to wait on a locked database before giving up.
    #[arg(long, global = true, default_value_t = 10)]
    pub busy_timeout: u64,

    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    /// Also write logs to this file.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// When to start a new log file.
    #[arg(long, global = true, value_enum, requires = "log_file")]
    pub log_rotation: Option<LogRotation>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pool of workers until the queue drains.
    Run(RunArgs),

    /// Run a single worker loop in this process.
    Worker(WorkerArgs),

    /// Release claims left behind by crashed workers.
    ResetStale(ResetStaleArgs),

    /// Add a problem to the queue.
    Add(AddArgs),

    /// Show queue counts per mode.
    Status(StatusArgs),

    /// Show one problem record.
    Show(ShowArgs),

    /// Generate shell completions.
    Completions(CompletionsArgs),
}

/// Arguments for shell completions.
#[derive(Parser, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for.
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate and print completions to stdout.
    pub fn generate(&self) {
        clap_complete::generate(
            self.shell,
            &mut Cli::command(),
            "statharvest",
            &mut std::io::stdout(),
        );
    }
}

/// Options shared by `run` and `worker`.
#[derive(Parser, Debug, Clone)]
pub struct WorkerArgs {
    /// Kind of data to generate.
    #[arg(long, value_enum)]
    pub mode: ModeArg,

    /// Solver time limit in milliseconds.
    #[arg(short = 't', long, default_value_t = 7_200_000)]
    pub time_limit: u64,

    /// Spacing of statistics save points, in percent of the time limit.
    #[arg(short = 'i', long, default_value_t = 0.5)]
    pub increments: f64,

    /// Base directory for model and instance files.
    #[arg(short = 'd', long, env = "STATHARVEST_DATA_DIR", default_value = ".")]
    pub data_dir: PathBuf,

    /// Solver frontend executable.
    #[arg(long, env = "STATHARVEST_EXECUTABLE", default_value = DEFAULT_EXECUTABLE)]
    pub executable: PathBuf,

    /// Backend solver id (defaults depend on the mode).
    #[arg(long)]
    pub solver: Option<String>,

    /// Statistic that carries elapsed search time in seconds.
    #[arg(long, default_value = DEFAULT_TIME_KEY)]
    pub time_key: String,

    /// Kill the solver after this multiple of the time limit.
    #[arg(long, default_value_t = 1.5)]
    pub slack: f64,

    /// Milliseconds between SIGTERM and SIGKILL when stopping the solver.
    #[arg(long, default_value_t = 5000)]
    pub kill_grace: u64,

    /// Poll an empty queue every N seconds instead of exiting.
    #[arg(long)]
    pub idle_poll: Option<u64>,

    /// Extra argument passed to the solver (repeatable).
    #[arg(long = "solver-arg", allow_hyphen_values = true)]
    pub solver_args: Vec<String>,

    /// Skip the check that the frontend knows the solver id.
    #[arg(long)]
    pub skip_solver_check: bool,
}

impl WorkerArgs {
    pub fn mode(&self) -> Mode {
        self.mode.into()
    }

    /// Solver id to use, falling back to the mode's default.
    pub fn solver_id(&self) -> String {
        self.solver
            .clone()
            .unwrap_or_else(|| default_solver_id(self.mode()).to_string())
    }

    /// Render back into command-line form for a child `worker` process.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--mode".into(),
            self.mode().as_str().into(),
            "--time-limit".into(),
            self.time_limit.to_string().into(),
            "--increments".into(),
            self.increments.to_string().into(),
            "--data-dir".into(),
            self.data_dir.clone().into(),
            "--executable".into(),
            self.executable.clone().into(),
            "--solver".into(),
            self.solver_id().into(),
            "--time-key".into(),
            self.time_key.clone().into(),
            "--slack".into(),
            self.slack.to_string().into(),
            "--kill-grace".into(),
            self.kill_grace.to_string().into(),
        ];
        if let Some(secs) = self.idle_poll {
            args.push("--idle-poll".into());
            args.push(secs.to_string().into());
        }
        for extra in &self.solver_args {
            args.push(format!("--solver-arg={}", extra).into());
        }
        if self.skip_solver_check {
            args.push("--skip-solver-check".into());
        }
        args
    }
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub worker: WorkerArgs,

    /// Number of worker processes (defaults to CPU count).
    #[arg(short = 'j', long, default_value_t = num_cpus())]
    pub jobs: usize,

    /// Seconds between worker liveness checks.
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Seconds workers get to exit after SIGTERM before SIGKILL.
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Do not pin workers to CPUs.
    #[arg(long)]
    pub no_pin: bool,
}

impl RunArgs {
    /// Worker options handed to child processes.
    ///
    /// The solver kill grace is capped at half the shutdown timeout, so a
    /// worker told to stop still kills its solver before the supervisor
    /// kills the worker.
    pub fn child_worker_args(&self) -> WorkerArgs {
        let mut worker = self.worker.clone();
        worker.kill_grace = worker
            .kill_grace
            .min(self.shutdown_timeout.saturating_mul(1000) / 2);
        worker
    }
}

/// Arguments for the reset-stale command.
#[derive(Parser, Debug)]
pub struct ResetStaleArgs {
    /// Only reset claims for this mode (default: both).
    #[arg(long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Only reset claims older than this many seconds.
    #[arg(long)]
    pub older_than: Option<u64>,
}

/// Arguments for the add command.
#[derive(Parser, Debug)]
pub struct AddArgs {
    /// Model file, relative to the data directory unless absolute.
    pub model: String,

    /// Instance data file.
    pub instance: Option<String>,
}

/// Arguments for the status command.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Table)]
    pub format: OutputFormatArg,
}

/// Arguments for the show command.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Problem id.
    pub id: i64,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = OutputFormatArg::Table)]
    pub format: OutputFormatArg,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModeArg {
    #[default]
    Label,
    Features,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Label => Mode::Label,
            ModeArg::Features => Mode::Features,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormatArg {
    #[default]
    Table,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Table => OutputFormat::Table,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Verbosity level for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Normal,
    Debug,
    Trace,
}

impl From<u8> for Verbosity {
    fn from(count: u8) -> Self {
        match count {
            0 => Verbosity::Normal,
            1 => Verbosity::Debug,
            _ => Verbosity::Trace,
        }
    }
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::from(self.verbose)
        }
    }

    /// Global options a child process must inherit.
    pub fn global_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--db-path".into(),
            self.db_path.clone().into(),
            "--busy-timeout".into(),
            self.busy_timeout.to_string().into(),
        ];
        match self.verbosity() {
            Verbosity::Quiet => args.push("--quiet".into()),
            Verbosity::Normal => {}
            Verbosity::Debug => args.push("-v".into()),
            Verbosity::Trace => args.push("-vv".into()),
        }
        if self.no_color {
            args.push("--no-color".into());
        }
        if let Some(format) = self.log_format
            && let Some(value) = format.to_possible_value()
        {
            args.push("--log-format".into());
            args.push(value.get_name().into());
        }
        if let Some(file) = &self.log_file {
            args.push("--log-file".into());
            args.push(file.clone().into());
        }
        if let Some(rotation) = self.log_rotation
            && let Some(value) = rotation.to_possible_value()
        {
            args.push("--log-rotation".into());
            args.push(value.get_name().into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_worker_defaults() {
        let cli = Cli::try_parse_from(["statharvest", "worker", "--mode", "label"]).unwrap();
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(args.mode(), Mode::Label);
                assert_eq!(args.time_limit, 7_200_000);
                assert_eq!(args.increments, 0.5);
                assert_eq!(args.time_key, "optTime");
                assert_eq!(args.slack, 1.5);
                assert_eq!(args.idle_poll, None);
                assert_eq!(args.kill_grace, 5000);
                assert_eq!(args.solver_id(), "org.chuffed.chuffed");
            }
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_worker_requires_mode() {
        assert!(Cli::try_parse_from(["statharvest", "worker"]).is_err());
        assert!(Cli::try_parse_from(["statharvest", "worker", "--mode", "both"]).is_err());
    }

    #[test]
    fn test_features_default_solver() {
        let cli = Cli::try_parse_from(["statharvest", "worker", "--mode", "features"]).unwrap();
        match cli.command {
            Commands::Worker(args) => assert_eq!(args.solver_id(), "org.chuffed.modded-chuffed"),
            _ => panic!("Expected Worker command"),
        }
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::try_parse_from([
            "statharvest",
            "run",
            "--mode",
            "features",
            "-j",
            "4",
            "-t",
            "60000",
            "-i",
            "2.5",
            "--no-pin",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.jobs, 4);
                assert_eq!(args.worker.time_limit, 60_000);
                assert_eq!(args.worker.increments, 2.5);
                assert_eq!(args.poll_interval, 10);
                assert_eq!(args.shutdown_timeout, 10);
                assert!(args.no_pin);
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_worker_args_round_trip_through_child_command_line() {
        let cli = Cli::try_parse_from([
            "statharvest",
            "run",
            "--mode",
            "label",
            "-t",
            "1000",
            "--idle-poll",
            "5",
            "--solver-arg",
            "--free-search",
            "--skip-solver-check",
        ])
        .unwrap();
        let Commands::Run(run) = cli.command else {
            panic!("Expected Run command");
        };

        let mut argv: Vec<OsString> = vec!["statharvest".into(), "worker".into()];
        argv.extend(run.worker.to_args());
        let child = Cli::try_parse_from(argv).unwrap();
        let Commands::Worker(args) = child.command else {
            panic!("Expected Worker command");
        };
        assert_eq!(args.time_limit, 1000);
        assert_eq!(args.idle_poll, Some(5));
        assert_eq!(args.solver_args, vec!["--free-search".to_string()]);
        assert_eq!(args.solver.as_deref(), Some("org.chuffed.chuffed"));
        assert!(args.skip_solver_check);
        assert_eq!(args.kill_grace, 5000);
    }

    #[test]
    fn test_child_kill_grace_fits_in_shutdown_timeout() {
        let parse = |extra: &[&str]| {
            let mut argv = vec!["statharvest", "run", "--mode", "label"];
            argv.extend_from_slice(extra);
            match Cli::try_parse_from(argv).unwrap().command {
                Commands::Run(args) => args,
                _ => panic!("Expected Run command"),
            }
        };

        assert_eq!(parse(&[]).child_worker_args().kill_grace, 5000);
        assert_eq!(parse(&["--shutdown-timeout", "1"]).child_worker_args().kill_grace, 500);
        assert_eq!(
            parse(&["--shutdown-timeout", "4", "--kill-grace", "200"])
                .child_worker_args()
                .kill_grace,
            200
        );
        assert_eq!(parse(&["--shutdown-timeout", "0"]).child_worker_args().kill_grace, 0);
    }

    #[test]
    fn test_global_args_are_inherited() {
        let cli = Cli::try_parse_from([
            "statharvest",
            "--db-path",
            "/tmp/q.db",
            "-v",
            "--log-format",
            "json",
            "--log-file",
            "/tmp/q.log",
            "--log-rotation",
            "daily",
            "status",
        ])
        .unwrap();
        let args: Vec<String> = cli
            .global_args()
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.windows(2).any(|w| w == ["--db-path", "/tmp/q.db"]));
        assert!(args.contains(&"-v".to_string()));
        assert!(args.windows(2).any(|w| w == ["--log-format", "json"]));
        assert!(args.windows(2).any(|w| w == ["--log-rotation", "daily"]));

        // Rotation only makes sense with a file.
        assert!(Cli::try_parse_from(["statharvest", "--log-rotation", "daily", "status"]).is_err());
    }

    #[test]
    fn test_add_command() {
        let cli = Cli::try_parse_from(["statharvest", "add", "rcpsp.mzn", "j30_1.dzn"]).unwrap();
        match cli.command {
            Commands::Add(args) => {
                assert_eq!(args.model, "rcpsp.mzn");
                assert_eq!(args.instance.as_deref(), Some("j30_1.dzn"));
            }
            _ => panic!("Expected Add command"),
        }
    }

    #[test]
    fn test_reset_stale_command() {
        let cli = Cli::try_parse_from([
            "statharvest",
            "reset-stale",
            "--mode",
            "features",
            "--older-than",
            "3600",
        ])
        .unwrap();
        match cli.command {
            Commands::ResetStale(args) => {
                assert_eq!(args.mode, Some(ModeArg::Features));
                assert_eq!(args.older_than, Some(3600));
            }
            _ => panic!("Expected ResetStale command"),
        }
    }

    #[test]
    fn test_status_format() {
        let cli = Cli::try_parse_from(["statharvest", "status", "--format", "json"]).unwrap();
        match cli.command {
            Commands::Status(args) => assert_eq!(args.format, OutputFormatArg::Json),
            _ => panic!("Expected Status command"),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        let result = Cli::try_parse_from(["statharvest", "-q", "-v", "status"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::from(0), Verbosity::Normal);
        assert_eq!(Verbosity::from(1), Verbosity::Debug);
        assert_eq!(Verbosity::from(5), Verbosity::Trace);
        let cli = Cli::try_parse_from(["statharvest", "-q", "status"]).unwrap();
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
    }
}
