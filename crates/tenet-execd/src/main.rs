//! tenet-execd - scheduling daemon for tenet-agent.
//!
//! Runs the agent locally according to a schedule specified in policy
//! (executor control body), optionally splaying runs to spread load across
//! a fleet. Reloads its configuration on SIGHUP or when the policy
//! validation stamp advances.
//!
//! # Fork safety
//!
//! The daemon is deliberately single-threaded: every agent run and every
//! runagent request handler is a forked child, and `fork()` in a
//! multi-threaded process is undefined behaviour. Daemonization happens
//! first thing in `main`, before logging or any other machinery starts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setsid, ForkResult, Pid};
use tenet_core::engine::{EngineOptions, EngineState};
use tenet_core::policy::Policy;
use tenet_core::store::{check_repair_flag, StoreRegistry};
use tenet_core::{actuate, env, signals};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tenet_execd::config::ExecdConfig;
use tenet_execd::runagent::handle_requests_or_sleep;
use tenet_execd::schedule::{schedule_run, SchedulePaths};
use tenet_execd::{exec, runagent};

/// Environment variable overriding the work directory, for tests.
const WORKDIR_OVERRIDE_ENV: &str = "TENET_TEST_OVERRIDE_WORKDIR";

/// Default work directory.
const DEFAULT_WORKDIR: &str = "/var/lib/tenet";

/// Main-loop pulse: one minute resolution is enough.
const PULSE: Duration = Duration::from_secs(60);

/// tenet-execd - scheduling daemon for tenet-agent
#[derive(Parser, Debug)]
#[command(name = "tenet-execd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Specify an alternative policy file instead of the default
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Comma-separated classes to define at the start of execution
    #[arg(short = 'D', long = "define")]
    define: Vec<String>,

    /// Comma-separated classes to undefine for the whole run
    #[arg(short = 'N', long = "negate")]
    negate: Vec<String>,

    /// Ignore ifelapsed/expireafter locking constraints
    #[arg(short = 'K', long = "no-lock")]
    no_lock: bool,

    /// Print basic information about changes made to the system
    #[arg(short = 'I', long)]
    inform: bool,

    /// Output verbose information about the behaviour of the daemon
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable debugging output
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'g', long, default_value = "info")]
    log_level: String,

    /// All talk and no action mode
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Run as a foreground process (do not fork)
    #[arg(short = 'F', long = "no-fork")]
    no_fork: bool,

    /// Run once and then exit (implies no-fork)
    #[arg(short = 'O', long)]
    once: bool,

    /// Set LD_LIBRARY_PATH for child processes
    #[arg(short = 'L', long = "ld-library-path")]
    ld_library_path: Option<String>,

    /// Colorize output: always, auto or never
    #[arg(long)]
    color: Option<String>,

    /// Log timestamps on each line of log output
    #[arg(short = 'l', long)]
    timestamp: bool,

    /// Ignore def_preferred.json in favour of def.json
    #[arg(long = "ignore-preferred-augments")]
    ignore_preferred_augments: bool,

    /// Skip database integrity checks at startup (yes/no)
    #[arg(long = "skip-db-check", num_args = 0..=1, default_missing_value = "yes")]
    skip_db_check: Option<String>,

    /// Directory for the runagent socket, or "no" to disable it
    #[arg(long = "with-runagent-socket")]
    with_runagent_socket: Option<String>,

    /// Work directory holding state, inputs and databases
    #[arg(long)]
    workdir: Option<PathBuf>,
}

extern "C" fn handle_termination_signal(_signo: nix::libc::c_int) {
    signals::set_pending_termination();
}

extern "C" fn handle_reload_signal(_signo: nix::libc::c_int) {
    signals::request_reload();
}

extern "C" fn handle_toggle_signal(_signo: nix::libc::c_int) {
    // Internal toggles; the wakeup alone interrupts the current sleep.
}

fn install_signal_handlers() -> Result<()> {
    let term = SigAction::new(
        SigHandler::Handler(handle_termination_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let hup = SigAction::new(
        SigHandler::Handler(handle_reload_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let toggle = SigAction::new(
        SigHandler::Handler(handle_toggle_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

    // SAFETY: the handlers only touch atomics, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGTERM, &term).context("failed to install SIGTERM handler")?;
        sigaction(Signal::SIGINT, &term).context("failed to install SIGINT handler")?;
        sigaction(Signal::SIGHUP, &hup).context("failed to install SIGHUP handler")?;
        sigaction(Signal::SIGUSR1, &toggle).context("failed to install SIGUSR1 handler")?;
        sigaction(Signal::SIGUSR2, &toggle).context("failed to install SIGUSR2 handler")?;
        sigaction(Signal::SIGPIPE, &ignore).context("failed to ignore SIGPIPE")?;
    }
    Ok(())
}

/// Background the process: fork (parent exits), become session leader,
/// detach stdio.
///
/// Must run while the process is still single-threaded.
fn daemonize() -> Result<()> {
    // SAFETY: called first thing in main, before any thread exists.
    match unsafe { fork() }.context("daemonization fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid failed")?;

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("failed to open /dev/null")?;
    use std::os::fd::AsRawFd;
    for fd in 0..=2 {
        nix::unistd::dup2(devnull.as_raw_fd(), fd).context("failed to detach stdio")?;
    }
    Ok(())
}

fn effective_log_level(args: &Args) -> &str {
    if args.debug {
        "trace"
    } else if args.verbose {
        "debug"
    } else if args.inform {
        "info"
    } else {
        &args.log_level
    }
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_new(effective_log_level(args)).unwrap_or_else(|_| EnvFilter::new("info"));
    let ansi = match args.color.as_deref() {
        Some("always") => true,
        Some("never") => false,
        _ => std::io::IsTerminal::is_terminal(&std::io::stderr()),
    };
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi);
    if args.timestamp {
        tracing_subscriber::registry().with(filter).with(layer).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.without_time())
            .init();
    }
}

fn resolve_workdir(args: &Args) -> PathBuf {
    if let Ok(dir) = std::env::var(WORKDIR_OVERRIDE_ENV) {
        return PathBuf::from(dir);
    }
    args.workdir
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKDIR))
}

fn write_pid_file(pid_path: &Path) -> Result<()> {
    if let Some(parent) = pid_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_path, std::process::id().to_string())?;
    info!(path = %pid_path.display(), "pid file written");
    Ok(())
}

fn remove_pid_file(pid_path: &Path) {
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(pid_path) {
            warn!(error = %e, "failed to remove pid file");
        }
    }
}

/// Deliver SIGTERM to a stale prior instance of this daemon, identified by
/// its pid file.
fn apoptosis(pid_path: &Path) {
    let Ok(text) = std::fs::read_to_string(pid_path) else {
        return;
    };
    let Ok(pid) = text.trim().parse::<i32>() else {
        return;
    };
    if pid == i32::try_from(std::process::id()).unwrap_or(0) {
        return;
    }
    let target = Pid::from_raw(pid);
    if kill(target, None).is_ok() {
        info!(pid, "terminating stale prior instance");
        if let Err(e) = kill(target, Signal::SIGTERM) {
            warn!(pid, error = %e, "unable to terminate stale instance");
        }
    }
    debug!("pruning complete");
}

/// Reap any exited children without blocking.
fn reap_children() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _)) => {
                debug!(pid = pid.as_raw(), "reaped child process");
            }
            Ok(_) => {}
        }
    }
}

fn apply_class_flags(state: &mut EngineState, args: &Args) {
    for list in &args.define {
        for class in list.split(',').filter(|c| !c.is_empty()) {
            state.ctx.class_put_hard(class);
        }
    }
    for list in &args.negate {
        for class in list.split(',').filter(|c| !c.is_empty()) {
            state.ctx.class_negate(class);
        }
    }
}

/// Default local run command when the executor control body names none:
/// the agent binary next to this one, with pass-through flags.
fn default_exec_command(args: &Args) -> String {
    let agent = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("tenet-agent")))
        .map_or_else(|| "tenet-agent".to_string(), |p| p.display().to_string());
    let mut command = format!("{agent} --inform");
    if args.ignore_preferred_augments {
        command.push_str(" --ignore-preferred-augments");
    }
    command
}

#[allow(clippy::too_many_lines)]
fn main() -> Result<()> {
    let args = Args::parse();

    // Daemonize before anything else: the process must still be
    // single-threaded, and children must not inherit a terminal.
    if !(args.no_fork || args.once) {
        if let Err(e) = daemonize() {
            eprintln!("daemonization failed: {e}");
            return Err(e);
        }
    }

    init_logging(&args);

    if let Some(path) = &args.ld_library_path {
        info!(path, "setting LD_LIBRARY_PATH for children");
        std::env::set_var("LD_LIBRARY_PATH", path);
    }

    let work_dir = resolve_workdir(&args);
    let state_dir = work_dir.join("state");
    let input_dir = work_dir.join("inputs");
    std::fs::create_dir_all(&state_dir).context("failed to create state directory")?;

    // Database integrity: an explicit --skip-db-check=no or a repair flag
    // file forces a pass over every known database.
    let perform_db_check = match args.skip_db_check.as_deref() {
        None => false,
        Some(v) if v.eq_ignore_ascii_case("yes") => false,
        Some(v) if v.eq_ignore_ascii_case("no") => true,
        Some(other) => bail!("invalid argument for --skip-db-check (yes/no): '{other}'"),
    };
    let force_repair = check_repair_flag(&state_dir);
    let stores = Arc::new(StoreRegistry::new(&state_dir, &work_dir));
    if force_repair || perform_db_check {
        info!(forced = force_repair, "running database integrity checks");
        stores.repair_all();
    }

    let opts = EngineOptions {
        dry_run: args.dry_run,
        ignore_locks: args.no_lock || args.dry_run,
        ..EngineOptions::default()
    };
    let mut state = EngineState::new(stores.clone(), opts);

    let policy_file = args
        .file
        .clone()
        .unwrap_or_else(|| input_dir.join("promises.json"));
    let paths = SchedulePaths {
        state_dir: state_dir.clone(),
        work_dir: work_dir.clone(),
        input_dir: input_dir.clone(),
        policy_file: policy_file.clone(),
    };

    env::detect_environment(
        &mut state.ctx,
        &state_dir.display().to_string(),
        &work_dir.display().to_string(),
        &input_dir.display().to_string(),
    );
    env::update_time_classes(&mut state.ctx, chrono::Local::now());
    apply_class_flags(&mut state, &args);

    let mut policy = if policy_file.exists() {
        Policy::from_file(&policy_file).context("error reading policy, exiting")?
    } else {
        warn!(path = %policy_file.display(), "policy input missing, using failsafe policy");
        Policy::failsafe()
    };
    let table = actuate::ActuatorTable::standard();
    actuate::resolve_policy(&mut state, &policy, &table);

    let mut config = ExecdConfig::from_context(&state.ctx);
    if config.exec_command.is_empty() {
        config.exec_command = default_exec_command(&args);
    }

    let pid_path = state_dir.join("tenet-execd.pid");
    if !args.once {
        apoptosis(&pid_path);
    }
    write_pid_file(&pid_path).context("cannot write pid file, exiting")?;

    install_signal_handlers()?;
    umask(Mode::from_bits_truncate(0o077));

    let socket_path = runagent::socket_path(&state_dir, args.with_runagent_socket.as_deref());
    let listener = match &socket_path {
        Some(path) => match runagent::setup_socket(path) {
            Ok(listener) => {
                runagent::apply_socket_access(path, &config.runagent_allow_users);
                Some(listener)
            }
            Err(e) => {
                warn!(error = %e, "failed to create socket for runagent requests");
                None
            }
        },
        None => None,
    };

    info!(
        pid = std::process::id(),
        workdir = %work_dir.display(),
        "daemon started"
    );

    if args.once {
        exec::local_exec(&config.exec_command);
    } else {
        // Nothing seen yet: the first tick with a stamp file present
        // triggers a full reload.
        let mut last_validated_at = 0i64;
        while !signals::is_pending_termination() {
            reap_children();

            let tick = schedule_run(
                &mut state,
                &mut policy,
                &mut config,
                &paths,
                &mut last_validated_at,
            );
            apply_class_flags(&mut state, &args);
            if config.exec_command.is_empty() {
                config.exec_command = default_exec_command(&args);
            }
            if tick.users_changed {
                if let Some(path) = &socket_path {
                    runagent::apply_socket_access(path, &config.runagent_allow_users);
                }
            }

            if tick.due {
                if handle_requests_or_sleep(
                    Duration::from_secs(config.splay_time),
                    "splay time",
                    listener.as_ref(),
                    &config.exec_command,
                ) {
                    break;
                }
                if exec::local_exec_in_fork(&config.exec_command).is_none() {
                    info!("unable to run agent in a fork, falling back to blocking execution");
                    exec::local_exec(&config.exec_command);
                }
            }

            if handle_requests_or_sleep(
                PULSE,
                "pulse time",
                listener.as_ref(),
                &config.exec_command,
            ) {
                break;
            }
        }
    }

    if let Some(path) = &socket_path {
        runagent::unlink_socket(path);
    }
    remove_pid_file(&pid_path);
    drop(state);
    stores.close_all();
    info!("daemon shutdown complete");
    Ok(())
}
