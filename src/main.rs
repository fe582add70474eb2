//! statharvest - solver statistics harvester

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::{Level, info, info_span, warn};

use statharvest::cli::{
    AddArgs, Cli, Commands, ResetStaleArgs, RunArgs, ShowArgs, StatusArgs, Verbosity, WorkerArgs,
};
use statharvest::error::{ENVIRONMENT_EXIT_CODE, HarvestError, INTERRUPTED_EXIT_CODE};
use statharvest::logging::{self, LogConfig};
use statharvest::output::{self, OutputFormat};
use statharvest::snapshot::SavePoints;
use statharvest::solver::{SolverConfig, SolverRunner};
use statharvest::store::{Mode, SqliteStore, TaskStore};
use statharvest::supervisor::{
    ShutdownPhase, ShutdownSignal, Supervisor, SupervisorConfig, SupervisorExit, WORKER_SLOT_ENV,
    WorkerLauncher,
};
use statharvest::worker::{IdlePolicy, Worker, WorkerConfig, WorkerExit};
use statharvest::{paths, theme};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }
    init_logging(&cli);

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker(args) => cmd_worker(&cli, args),
        Commands::ResetStale(args) => cmd_reset_stale(&cli, args),
        Commands::Add(args) => cmd_add(&cli, args),
        Commands::Status(args) => cmd_status(&cli, args),
        Commands::Show(args) => cmd_show(&cli, args),
        Commands::Completions(args) => {
            args.generate();
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{}: {}",
                "error"
                    .if_supports_color(Stderr, |text| text.red())
                    .if_supports_color(Stderr, |text| text.bold()),
                e
            );
            for cause in e.chain().skip(1) {
                eprintln!(
                    "  {}: {}",
                    "caused by".if_supports_color(Stderr, |text| text.yellow()),
                    cause
                );
            }
            let code = e
                .downcast_ref::<HarvestError>()
                .map_or(1, HarvestError::exit_code);
            std::process::exit(code);
        }
    }
}

fn init_logging(cli: &Cli) {
    let mut config = match cli.command {
        Commands::Worker(_) => LogConfig::for_worker(),
        _ => LogConfig::for_supervisor(),
    };
    config = match cli.verbosity() {
        Verbosity::Quiet => config.with_filter(Level::ERROR.to_string().to_lowercase()),
        Verbosity::Normal => config,
        Verbosity::Debug => config.with_filter("statharvest=debug"),
        Verbosity::Trace => config.with_filter("statharvest=trace"),
    };
    config = config.with_ansi(!cli.no_color);
    if let Some(format) = cli.log_format {
        config = config.with_format(format);
    }
    if let Some(file) = &cli.log_file {
        config = config.with_file(paths::expand_tilde(file));
    }
    if let Some(rotation) = cli.log_rotation {
        config = config.with_rotation(rotation);
    }
    logging::init(config.with_env_overrides());
}

fn open_store(cli: &Cli) -> Result<SqliteStore> {
    let path = paths::expand_tilde(&cli.db_path);
    paths::ensure_parent_dir(&path)
        .with_context(|| format!("Failed to create directory for {}", path.display()))?;
    let store = SqliteStore::open_with_timeout(&path, Duration::from_secs(cli.busy_timeout))
        .with_context(|| format!("Failed to open problem database {}", path.display()))?;
    Ok(store)
}

fn build_runner(args: &WorkerArgs) -> SolverRunner {
    let mut config = SolverConfig::new(
        paths::expand_tilde(&args.executable),
        args.solver_id(),
        paths::expand_tilde(&args.data_dir),
    );
    config.extra_args = args.solver_args.clone();
    config.slack_factor = args.slack;
    config.check_solvers = !args.skip_solver_check;
    config.kill_grace = Duration::from_millis(args.kill_grace);
    SolverRunner::new(config)
}

fn build_worker_config(args: &WorkerArgs) -> Result<WorkerConfig> {
    let save_points = SavePoints::from_increment(args.increments)?;
    let mut config = WorkerConfig::new(args.mode(), args.time_limit, save_points);
    config.time_key = args.time_key.clone();
    config.idle = match args.idle_poll {
        Some(secs) => IdlePolicy::Poll(Duration::from_secs(secs)),
        None => IdlePolicy::Exit,
    };
    Ok(config)
}

/// Run one worker loop in this process.
fn cmd_worker(cli: &Cli, args: &WorkerArgs) -> Result<i32> {
    let slot = std::env::var(WORKER_SLOT_ENV).ok();
    let span = info_span!("worker", slot = slot.as_deref().unwrap_or("-"), pid = std::process::id());
    let _guard = span.enter();

    let config = build_worker_config(args)?;
    let store = open_store(cli)?;
    let runner = build_runner(args);

    // SIGTERM from the supervisor and Ctrl+C both land here.
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .context("Failed to install signal handler")?;

    let mut worker = Worker::new(&store, runner, config, stop);
    let exit = worker.run()?;
    let stats = worker.stats();
    info!(
        ?exit,
        completed = stats.completed,
        failed = stats.failed,
        released = stats.released,
        lost_claims = stats.lost_claims,
        "Worker finished"
    );
    Ok(match exit {
        WorkerExit::Drained => 0,
        WorkerExit::Interrupted => INTERRUPTED_EXIT_CODE,
    })
}

/// Run a supervised pool of worker processes.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<i32> {
    // Reject bad settings here rather than in every worker.
    build_worker_config(&args.worker)?;
    if args.jobs == 0 {
        anyhow::bail!("--jobs must be at least 1");
    }
    // Creates the schema before workers race to open the file.
    let store = open_store(cli)?;
    let stats = store.queue_stats()?;
    drop(store);
    info!(
        mode = %args.worker.mode(),
        pending = stats.for_mode(args.worker.mode()).pending,
        jobs = args.jobs,
        "Starting worker pool"
    );

    let mut worker_args = cli.global_args();
    worker_args.push("worker".into());
    worker_args.extend(args.child_worker_args().to_args());
    let launcher = WorkerLauncher::current_exe(worker_args)?.with_cpu_pinning(!args.no_pin);

    let config = SupervisorConfig {
        worker_count: args.jobs,
        poll_interval: Duration::from_secs(args.poll_interval),
        shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
    };
    let mut supervisor = Supervisor::new(config, launcher);

    let signal = ShutdownSignal::new();
    let handler_signal = signal.clone();
    ctrlc::set_handler(move || match handler_signal.request() {
        ShutdownPhase::Draining => {
            eprintln!("\nReceived interrupt, stopping workers (interrupt again to kill)...")
        }
        ShutdownPhase::Terminated => eprintln!("\nKilling workers..."),
        ShutdownPhase::Running => {}
    })
    .context("Failed to install signal handler")?;

    let exit = supervisor.supervise(&signal)?;
    let restarts = supervisor.restarts();
    drop(supervisor);

    match exit {
        SupervisorExit::Drained => {
            info!(restarts, "Queue drained");
            Ok(0)
        }
        SupervisorExit::Interrupted => {
            info!(restarts, "Worker pool stopped");
            Ok(0)
        }
        SupervisorExit::EnvironmentFailure => {
            warn!("Workers could not validate the solver environment");
            Ok(ENVIRONMENT_EXIT_CODE)
        }
    }
}

fn cmd_reset_stale(cli: &Cli, args: &ResetStaleArgs) -> Result<i32> {
    let store = open_store(cli)?;
    let modes: Vec<Mode> = match args.mode {
        Some(mode) => vec![mode.into()],
        None => Mode::ALL.to_vec(),
    };
    let older_than = args.older_than.map(Duration::from_secs);

    let mut total = 0;
    for mode in modes {
        let reset = store.reset_stale_claims(mode, older_than)?;
        info!(%mode, reset, "Reset stale claims");
        total += reset;
    }
    eprintln!("Reset {} stale claim(s)", total);
    Ok(0)
}

fn cmd_add(cli: &Cli, args: &AddArgs) -> Result<i32> {
    let store = open_store(cli)?;
    let id = store.insert_problem(&args.model, args.instance.as_deref())?;
    println!("{}", id);
    Ok(0)
}

fn cmd_status(cli: &Cli, args: &StatusArgs) -> Result<i32> {
    let store = open_store(cli)?;
    let stats = store.queue_stats()?;
    output::print_status(&stats, args.format.into());
    Ok(0)
}

fn cmd_show(cli: &Cli, args: &ShowArgs) -> Result<i32> {
    let store = open_store(cli)?;
    let problem = store
        .get_problem(args.id)?
        .with_context(|| format!("Problem {} not found", args.id))?;
    match OutputFormat::from(args.format) {
        OutputFormat::Table => output::print_problem(&problem),
        OutputFormat::Json => output::json::print_json(&output::json::problem_json(&problem)),
    }
    Ok(0)
}
