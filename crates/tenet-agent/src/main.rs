//! tenet-agent - one-shot policy evaluation.
//!
//! Loads a policy document, discovers the host environment, and runs the
//! convergence loop with the standard actuator table. This is the binary
//! the scheduling daemon forks on every due run.

mod actuators;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tenet_core::actuate::{run_policy, POLICY_ERROR_THRESHOLD};
use tenet_core::engine::{EngineOptions, EngineState};
use tenet_core::policy::Policy;
use tenet_core::store::StoreRegistry;
use tenet_core::{env, eval::DataType, policy::Rval};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the work directory, for tests.
const WORKDIR_OVERRIDE_ENV: &str = "TENET_TEST_OVERRIDE_WORKDIR";

/// Default work directory.
const DEFAULT_WORKDIR: &str = "/var/lib/tenet";

/// tenet-agent - evaluate policy against this host
#[derive(Parser, Debug)]
#[command(name = "tenet-agent")]
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

    /// All talk and no action: report what would change, change nothing
    #[arg(short = 'n', long = "dry-run")]
    dry_run: bool,

    /// Print basic information about changes made to the system
    #[arg(short = 'I', long)]
    inform: bool,

    /// Output verbose information about the behaviour of the agent
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Enable debugging output
    #[arg(short = 'd', long)]
    debug: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'g', long, default_value = "warn")]
    log_level: String,

    /// Colorize output: always, auto or never
    #[arg(long)]
    color: Option<String>,

    /// Log timestamps on each line of log output
    #[arg(short = 'l', long)]
    timestamp: bool,

    /// Comma-separated bundle sequence overriding policy control
    #[arg(short = 'b', long)]
    bundlesequence: Option<String>,

    /// Work directory holding state, inputs and databases
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Ignore def_preferred.json in favour of def.json
    #[arg(long = "ignore-preferred-augments")]
    ignore_preferred_augments: bool,
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
        EnvFilter::try_new(effective_log_level(args)).unwrap_or_else(|_| EnvFilter::new("warn"));
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

/// Load augments (`def.json`, or `def_preferred.json` when present and not
/// ignored) into the `def` scope.
fn load_augments(state: &mut EngineState, input_dir: &std::path::Path, ignore_preferred: bool) {
    let preferred = input_dir.join("def_preferred.json");
    let fallback = input_dir.join("def.json");
    let path = if !ignore_preferred && preferred.exists() {
        preferred
    } else {
        fallback
    };
    if !path.exists() {
        return;
    }

    let Ok(text) = std::fs::read_to_string(&path) else {
        warn!(path = %path.display(), "failed to read augments file");
        return;
    };
    let Ok(doc) = serde_json::from_str::<serde_json::Value>(&text) else {
        warn!(path = %path.display(), "failed to parse augments file");
        return;
    };

    if let Some(vars) = doc.get("vars").and_then(|v| v.as_object()) {
        for (name, value) in vars {
            let (rval, dtype) = match value {
                serde_json::Value::String(s) => (Rval::Scalar(s.clone()), DataType::String),
                serde_json::Value::Array(items) => (
                    Rval::List(
                        items
                            .iter()
                            .map(|i| match i {
                                serde_json::Value::String(s) => Rval::Scalar(s.clone()),
                                other => Rval::Scalar(other.to_string()),
                            })
                            .collect(),
                    ),
                    DataType::Slist,
                ),
                other => (Rval::Container(other.clone()), DataType::Container),
            };
            let reference = format!("def.{name}");
            if let Err(e) = state.ctx.variable_put(&reference, rval, dtype, &["source=augments"]) {
                warn!(name = %name, error = %e, "failed to bind augments variable");
            }
        }
    }
    if let Some(classes) = doc.get("classes").and_then(|v| v.as_array()) {
        for class in classes.iter().filter_map(|c| c.as_str()) {
            state.ctx.class_put_hard(class);
        }
    }
    info!(path = %path.display(), "augments loaded");
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let work_dir = resolve_workdir(&args);
    let state_dir = work_dir.join("state");
    let input_dir = work_dir.join("inputs");
    std::fs::create_dir_all(&state_dir).context("failed to create state directory")?;

    let stores = Arc::new(StoreRegistry::new(&state_dir, &work_dir));
    let opts = EngineOptions {
        dry_run: args.dry_run,
        ignore_locks: args.no_lock || args.dry_run,
        ..EngineOptions::default()
    };
    let mut state = EngineState::new(stores.clone(), opts);

    env::detect_environment(
        &mut state.ctx,
        &state_dir.display().to_string(),
        &work_dir.display().to_string(),
        &input_dir.display().to_string(),
    );
    env::update_time_classes(&mut state.ctx, chrono::Local::now());

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

    if let Err(e) = state.load_persistent_classes() {
        warn!(error = %e, "persistent classes unavailable");
    }

    load_augments(&mut state, &input_dir, args.ignore_preferred_augments);

    let policy_path = args
        .file
        .clone()
        .unwrap_or_else(|| input_dir.join("promises.json"));
    let policy = if policy_path.exists() {
        Policy::from_file(&policy_path).context("error reading policy")?
    } else {
        warn!(path = %policy_path.display(), "policy input missing, running failsafe policy");
        Policy::failsafe()
    };

    let bundlesequence: Option<Vec<String>> = args
        .bundlesequence
        .as_deref()
        .map(|s| s.split(',').map(String::from).collect());

    let table = actuators::agent_actuator_table();
    let outcome = run_policy(&mut state, &policy, &table, bundlesequence.as_deref());
    info!(outcome = %outcome, "agent run finished");

    let errors = state.policy_errors;
    drop(state);
    stores.close_all();

    if errors > POLICY_ERROR_THRESHOLD {
        anyhow::bail!("aborted after {errors} policy errors");
    }
    Ok(())
}
