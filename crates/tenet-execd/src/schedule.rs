//! Run scheduling: policy freshness and time-class matching.
//!
//! On every loop tick the daemon compares the on-disk validation stamp to
//! the one it remembers. A newer stamp whose policy parses triggers a full
//! reload (clear context, rediscover environment, reload policy, rebuild
//! executor config); anything else is an environment reload (clear context,
//! rediscover environment). Afterwards the run is *due* when any configured
//! schedule expression holds against the freshly-defined time classes.

use std::path::{Path, PathBuf};

use tenet_core::engine::EngineState;
use tenet_core::policy::Policy;
use tenet_core::{actuate, env, signals};
use tracing::{debug, info, warn};

use crate::config::ExecdConfig;

/// Stamp file updated by whatever validates and installs new policy.
pub const VALIDATED_AT_FILE: &str = "policy_validated_at";

/// What kind of reload a tick performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reload {
    /// Context and environment only.
    Environment,
    /// Context, environment, policy and executor config.
    Full,
}

/// Paths the scheduler needs on every tick.
pub struct SchedulePaths {
    /// State directory holding the validation stamp.
    pub state_dir: PathBuf,
    /// Work directory (legacy database location).
    pub work_dir: PathBuf,
    /// Input directory.
    pub input_dir: PathBuf,
    /// The policy file to reload from.
    pub policy_file: PathBuf,
}

/// Read the policy validation stamp: the mtime of the stamp file, `0` when
/// absent.
#[must_use]
pub fn read_validated_at(state_dir: &Path) -> i64 {
    let path = state_dir.join(VALIDATED_AT_FILE);
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Decide between a full and an environment reload.
///
/// A full reload needs both a newer validation stamp (or an explicit
/// reload signal) and a syntactically valid policy file; invalid new
/// promises are ignored with a log line.
pub fn check_new_promises(paths: &SchedulePaths, last_validated_at: &mut i64) -> Reload {
    debug!(file = %paths.policy_file.display(), "checking for policy updates");

    let validated_at = read_validated_at(&paths.state_dir);
    let mut reload = false;

    if *last_validated_at < validated_at {
        info!("new promises detected");
        reload = true;
    }
    if signals::take_reload_request() {
        info!("forced reload of input files");
        reload = true;
    }

    if reload {
        *last_validated_at = validated_at;
        match Policy::from_file(&paths.policy_file) {
            Ok(_) => return Reload::Full,
            Err(e) => {
                info!(error = %e, "new promises file contains syntax errors, ignoring");
            }
        }
    } else {
        debug!("no new promises found");
    }

    Reload::Environment
}

/// Outcome of one scheduling tick.
pub struct ScheduleOutcome {
    /// Whether a run is due now.
    pub due: bool,
    /// Whether the runagent allowed-user set changed on reload.
    pub users_changed: bool,
}

/// One scheduling tick: reload as needed, recompute time classes, and
/// match the schedule.
pub fn schedule_run(
    state: &mut EngineState,
    policy: &mut Policy,
    config: &mut ExecdConfig,
    paths: &SchedulePaths,
    last_validated_at: &mut i64,
) -> ScheduleOutcome {
    let mut users_changed = false;

    match check_new_promises(paths, last_validated_at) {
        Reload::Full => {
            info!(file = %paths.policy_file.display(), "re-reading promise file");

            state.ctx.clear();
            refresh_environment(state, paths);

            *policy = match Policy::from_file(&paths.policy_file) {
                Ok(new_policy) => new_policy,
                Err(e) => {
                    warn!(error = %e, "policy reload failed, running failsafe policy");
                    Policy::failsafe()
                }
            };

            let table = actuate::ActuatorTable::standard();
            actuate::resolve_policy(state, policy, &table);

            let old_users = config.runagent_allow_users.clone();
            *config = ExecdConfig::from_context(&state.ctx);
            users_changed = old_users != config.runagent_allow_users;
        }
        Reload::Environment => {
            state.ctx.clear();
            refresh_environment(state, paths);
        }
    }

    let due = config
        .schedule
        .iter()
        .any(|expr| state.ctx.is_defined_class(expr).unwrap_or(false));
    if due {
        info!("waking up the agent: schedule matched");
    } else {
        debug!("nothing to do this pulse");
    }

    ScheduleOutcome { due, users_changed }
}

fn refresh_environment(state: &mut EngineState, paths: &SchedulePaths) {
    env::detect_environment(
        &mut state.ctx,
        &paths.state_dir.display().to_string(),
        &paths.work_dir.display().to_string(),
        &paths.input_dir.display().to_string(),
    );
    env::update_time_classes(&mut state.ctx, chrono::Local::now());
    state.ctx.class_put_hard("tenet_execd");
}
