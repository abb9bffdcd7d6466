//! `foreman` binary: wires the CLI front-end to the library's `Master`.
//!
//! This is the only place `anyhow` appears (§7 expansion): library code
//! returns `ForemanError`/`ConfigError` directly; this binary wraps either
//! at its outermost boundary for a readable top-level error message.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use nix::unistd::{dup2, fork, setsid, ForkResult};

use foreman::backoff::{DEFAULT_DELAY_MAX_SECS, DEFAULT_DELAY_STEP_SECS};
use foreman::cli::{Cli, Commands, DumpArgs, StartArgs};
use foreman::config::{environment_from_env, ConfigLoader, FileConfigLoader};
use foreman::{logging, DefaultWorker, HookSet, Master, Pool, ShutdownPolicy, Worker, WorkerKindRegistry};

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start(args) => run_start(args),
        Commands::Dump(args) => run_dump(args),
    }
}

fn run_start(args: StartArgs) -> Result<()> {
    if args.daemon {
        daemonize().context("daemonizing")?;
    }

    let sink = match &args.log_file {
        Some(path) => logging::LogSink::file(path).context("opening log file")?,
        None => logging::LogSink::stderr(),
    };
    let sink = logging::init(sink).context("installing logging")?;

    let path = args.resolved_config_path();
    let mut loader = FileConfigLoader::new(&path);
    let environment = args.environment.clone().or_else(environment_from_env);

    // Fail fast at startup on a bad config file (§4.6): nothing to
    // reconcile toward otherwise. `Master::start` re-resolves and reloads
    // internally, but this call surfaces a crisp error before any fork.
    loader
        .load(environment.as_deref())
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let delay_step = env_duration_secs("DELAY_SPAWN_LIMIT", DEFAULT_DELAY_STEP_SECS);
    let delay_max = env_duration_secs("DELAY_SPAWN_MAX", DEFAULT_DELAY_MAX_SECS);

    let pool = Pool::new(default_worker_kinds(), delay_step, delay_max);
    let hooks = HookSet::new();
    let shutdown = ShutdownPolicy::default();

    let mut master =
        Master::new(pool, hooks, Box::new(loader), shutdown, sink).context("initializing master")?;

    if let Some(pidfile) = &args.pidfile {
        std::fs::write(pidfile, std::process::id().to_string()).context("writing pidfile")?;
    }

    master.start().context("master control loop exited with an error")
}

fn run_dump(args: DumpArgs) -> Result<()> {
    let path = args.resolved_config_path();
    let mut loader = FileConfigLoader::new(&path);
    let environment = args.environment.clone().or_else(environment_from_env);

    let configuration = loader
        .load(environment.as_deref())
        .with_context(|| format!("loading configuration from {}", path.display()))?;

    let mut entries: Vec<_> = configuration.into_iter().collect();
    entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
    for (queue_group, count) in entries {
        println!("{queue_group}: {count}");
    }

    Ok(())
}

/// The out-of-the-box worker kind registry (§4.4 expansion): only
/// `DefaultWorker`, backed by a no-op `JobExecutor`. Real deployments are
/// expected to register their own kinds via the library API before calling
/// `Master::start` from their own `main`; this binary exists chiefly to make
/// `foreman dump`/`foreman start` usable for smoke-testing a config file.
fn default_worker_kinds() -> WorkerKindRegistry {
    let mut kinds = WorkerKindRegistry::new();
    kinds.register(
        "default",
        Box::new(|queue_group| {
            let queue_group = queue_group.clone();
            Ok(Box::new(DefaultWorker::new(queue_group, Box::new(|_| Ok(())))) as Box<dyn Worker>)
        }),
    );
    kinds
}

fn env_duration_secs(var: &str, default: u64) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default))
}

/// Detach from the controlling terminal via the classic double-fork
/// (`--daemon`, §2 expansion's CLI surface): fork once and let the first
/// parent exit, call `setsid` to become a session leader with no
/// controlling terminal, fork again so the process can never reacquire one,
/// then point stdio at `/dev/null`. Must run before any other thread exists
/// in the process, same constraint as `Pool::spawn`'s fork.
fn daemonize() -> Result<()> {
    // SAFETY: called as the first thing `run_start` does when `--daemon` is
    // set, before logging, configuration loading, or the master spawn any
    // worker threads.
    match unsafe { fork() }.context("first daemonizing fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().context("detaching from the controlling terminal")?;

    // SAFETY: still single-threaded — the first child never spawned
    // anything between the two forks.
    match unsafe { fork() }.context("second daemonizing fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    let fd = devnull.as_raw_fd();
    dup2(fd, 0).context("redirecting stdin to /dev/null")?;
    dup2(fd, 1).context("redirecting stdout to /dev/null")?;
    dup2(fd, 2).context("redirecting stderr to /dev/null")?;

    Ok(())
}
