//! Host-facing actuators for the one-shot agent: `files` and `commands`.
//!
//! Both run their critical section under the promise lock and honour
//! dry-run mode by reporting `WARN` instead of touching the system.

use std::process::Command;

use tenet_core::actuate::{with_promise_lock, Actuator, ActuatorTable, Outcome};
use tenet_core::engine::EngineState;
use tenet_core::policy::{Policy, Promise, Rval};
use tracing::{info, warn};

/// Keeps promised files present.
pub struct FilesActuator;

impl Actuator for FilesActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        _policy: &Policy,
        _table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        with_promise_lock(state, "files", promise, |state| {
            let path = std::path::Path::new(&promise.promiser);
            let create = promise
                .constraint_str("create")
                .map_or(true, |v| v == "true" || v == "yes");

            if !create || path.exists() {
                return Outcome::Noop;
            }
            if state.opts.dry_run {
                warn!(path = %promise.promiser, "dry-run: would create file");
                return Outcome::Warn;
            }
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    warn!(path = %promise.promiser, error = %e, "cannot create parent directory");
                    return Outcome::Fail;
                }
            }
            match std::fs::File::create(path) {
                Ok(_) => {
                    info!(path = %promise.promiser, "created file");
                    Outcome::Change
                }
                Err(e) => {
                    warn!(path = %promise.promiser, error = %e, "failed to create file");
                    Outcome::Fail
                }
            }
        })
    }
}

/// Executes promised commands.
pub struct CommandsActuator;

impl Actuator for CommandsActuator {
    fn actuate(
        &self,
        state: &mut EngineState,
        _policy: &Policy,
        _table: &ActuatorTable,
        promise: &Promise,
    ) -> Outcome {
        with_promise_lock(state, "commands", promise, |state| {
            if state.opts.dry_run {
                warn!(command = %promise.promiser, "dry-run: would execute command");
                return Outcome::Warn;
            }

            let mut parts = promise.promiser.split_whitespace();
            let Some(program) = parts.next() else {
                warn!("commands promise with empty promiser");
                return Outcome::Fail;
            };
            let mut command = Command::new(program);
            command.args(parts);
            if let Some(Rval::Scalar(args)) = promise.constraint("args") {
                command.args(args.split_whitespace());
            }

            match command.status() {
                Ok(status) if status.success() => {
                    info!(command = %promise.promiser, "command completed");
                    Outcome::Change
                }
                Ok(status) => {
                    warn!(
                        command = %promise.promiser,
                        code = status.code().unwrap_or(-1),
                        "command exited non-zero"
                    );
                    Outcome::Fail
                }
                Err(e) => {
                    warn!(command = %promise.promiser, error = %e, "failed to execute command");
                    Outcome::Fail
                }
            }
        })
    }
}

/// The standard table plus the host-facing actuators.
#[must_use]
pub fn agent_actuator_table() -> ActuatorTable {
    let mut table = ActuatorTable::standard();
    table.register("files", Box::new(FilesActuator));
    table.register("commands", Box::new(CommandsActuator));
    table
}
