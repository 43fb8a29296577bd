//! Forked agent execution.
//!
//! Every due run happens in a forked child. Everything the child needs
//! (argv, environment) is precomputed in the parent; between `fork` and
//! `exec` only async-signal-safe calls are made: signal disposition reset,
//! descriptor scrubbing, `execv`. When the fork fails the caller falls
//! back to blocking in-process execution.

use std::ffi::CString;
use std::process::Command;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{info, warn};

/// Highest descriptor scrubbed in the child before `exec`.
const SCRUB_FD_MAX: i32 = 255;

/// Split a command line into argv words. Quoting is not interpreted; the
/// exec command is policy-controlled and simple by convention.
fn argv_of(command_line: &str) -> Vec<String> {
    command_line.split_whitespace().map(String::from).collect()
}

/// Run the local command in this process, blocking until it exits.
pub fn local_exec(command_line: &str) {
    let argv = argv_of(command_line);
    let Some((program, args)) = argv.split_first() else {
        warn!("no exec command configured, nothing to run");
        return;
    };
    info!(command = command_line, "running agent inline");
    match Command::new(program).args(args).status() {
        Ok(status) if status.success() => info!("agent run completed"),
        Ok(status) => warn!(code = status.code().unwrap_or(-1), "agent run exited non-zero"),
        Err(e) => warn!(error = %e, "failed to run agent"),
    }
}

/// Fork a child that execs the local command. Returns the child pid, or
/// `None` when the fork failed (caller should fall back to
/// [`local_exec`]) or nothing is configured.
pub fn local_exec_in_fork(command_line: &str) -> Option<Pid> {
    let argv = argv_of(command_line);
    if argv.is_empty() {
        warn!("no exec command configured, nothing to run");
        return None;
    }

    // Precompute all argv strings before forking; allocation is not
    // async-signal-safe.
    let cstrings: Vec<CString> = argv
        .iter()
        .filter_map(|a| CString::new(a.as_str()).ok())
        .collect();
    if cstrings.len() != argv.len() {
        warn!(command = command_line, "exec command contains NUL bytes");
        return None;
    }

    info!(command = command_line, "forking for agent execution");

    // SAFETY: the daemon main loop is single-threaded; no locks can be
    // held by other threads across this fork.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => Some(child),
        Ok(ForkResult::Child) => {
            // Child: async-signal-safe work only from here to exec.
            unsafe {
                let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
                let _ = signal(Signal::SIGTERM, SigHandler::SigDfl);
                let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
                let _ = signal(Signal::SIGHUP, SigHandler::SigDfl);
            }
            for fd in 3..=SCRUB_FD_MAX {
                let _ = nix::unistd::close(fd);
            }
            let _ = nix::unistd::execv(&cstrings[0], &cstrings);
            // Only reached when exec failed.
            unsafe { nix::libc::_exit(127) }
        }
        Err(e) => {
            warn!(error = %e, "failed to fork for agent execution");
            None
        }
    }
}
