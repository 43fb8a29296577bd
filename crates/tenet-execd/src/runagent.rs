//! The runagent control socket.
//!
//! A UNIX-domain stream socket, by default under the state directory, on
//! which short textual run requests arrive. Connections are accepted on
//! the main thread and handed to short-lived forked children that invoke
//! the configured local run command and copy its output back.
//!
//! The listen queue is deliberately short: new connections are accepted
//! quickly and handed to children, so a pile-up means something is
//! seriously wrong and shedding connections is the better failure mode.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{SigHandler, Signal};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use nix::unistd::{fork, ForkResult};
use tenet_core::signals;
use tracing::{debug, info, warn};

/// Socket file name.
pub const RUNAGENT_SOCKET_NAME: &str = "runagent.socket";

/// Default socket directory under the state directory.
pub const RUNAGENT_SOCKET_DIR: &str = "tenet-execd.sockets";

const LISTEN_QUEUE: i32 = 5;

/// Resolve the socket path. `override_dir` of `"no"` (case-insensitive)
/// disables the socket entirely.
#[must_use]
pub fn socket_path(state_dir: &Path, override_dir: Option<&str>) -> Option<PathBuf> {
    match override_dir {
        Some(dir) if dir.eq_ignore_ascii_case("no") => None,
        Some(dir) => Some(Path::new(dir).join(RUNAGENT_SOCKET_NAME)),
        None => Some(state_dir.join(RUNAGENT_SOCKET_DIR).join(RUNAGENT_SOCKET_NAME)),
    }
}

/// Create, bind and listen on the runagent socket. The parent directory is
/// created mode 0750; a leftover socket from a previous process is
/// unlinked first.
pub fn setup_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o750))
                .context("failed to set socket directory permissions")?;
        }
    }

    // Remove potential left-overs from old processes.
    let _ = std::fs::remove_file(path);

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    )
    .context("failed to create runagent socket")?;
    let addr = UnixAddr::new(path).context("socket path too long")?;
    bind(fd.as_raw_fd(), &addr).context("failed to bind runagent socket")?;
    listen(&fd, Backlog::new(LISTEN_QUEUE).context("invalid listen backlog")?)
        .context("failed to listen on runagent socket")?;

    info!(path = %path.display(), "runagent socket listening");
    Ok(UnixListener::from(OwnedFd::from(fd)))
}

/// Apply socket access for the allowed-user set: owner-only when the set
/// is empty, group-accessible otherwise (the daemon's service group is
/// expected to carry the configured users). Re-applied on reload when the
/// set changes.
pub fn apply_socket_access(path: &Path, allow_users: &BTreeSet<String>) {
    let mode = if allow_users.is_empty() { 0o600 } else { 0o660 };
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        warn!(path = %path.display(), error = %e, "failed to set runagent socket permissions");
        return;
    }
    if let Some(parent) = path.parent() {
        let parent_mode = if allow_users.is_empty() { 0o750 } else { 0o751 };
        if let Err(e) =
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(parent_mode))
        {
            warn!(parent = %parent.display(), error = %e, "failed to set socket directory permissions");
        }
    }
    info!(
        path = %path.display(),
        users = allow_users.len(),
        "runagent socket access applied"
    );
}

/// Remove the socket file on shutdown.
pub fn unlink_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to unlink runagent socket");
        }
    }
}

/// Serve one runagent connection: read the newline-terminated request,
/// invoke the local run command, and copy its combined output back.
pub fn handle_request(stream: UnixStream, local_run_command: &str) {
    let mut reader = BufReader::new(stream);
    let mut request = String::new();
    if let Err(e) = reader.read_line(&mut request) {
        warn!(error = %e, "failed to read runagent request");
        return;
    }
    let request = request.trim();
    info!(request, "runagent request received");

    let output = if local_run_command.is_empty() {
        Err(std::io::Error::other("no local run command configured"))
    } else {
        std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg(local_run_command)
            .output()
    };

    let mut stream = reader.into_inner();
    match output {
        Ok(output) => {
            let _ = stream.write_all(&output.stdout);
            let _ = stream.write_all(&output.stderr);
        }
        Err(e) => {
            warn!(error = %e, "local run command failed");
            let _ = stream.write_all(format!("error: {e}\n").as_bytes());
        }
    }
    let _ = stream.flush();
}

/// Fork a short-lived child to serve one runagent connection. The child
/// restores the default SIGPIPE disposition, serves the request and exits
/// without unwinding back into daemon state.
pub fn spawn_handler(stream: UnixStream, local_run_command: &str) {
    // SAFETY: the daemon main loop is single-threaded.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => drop(stream),
        Ok(ForkResult::Child) => {
            unsafe {
                let _ = nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigDfl);
            }
            handle_request(stream, local_run_command);
            unsafe { nix::libc::_exit(0) }
        }
        Err(e) => warn!(error = %e, "failed to fork runagent request handler"),
    }
}

/// Sleep for the given duration while serving runagent requests, waking at
/// least once a second to check the pending-termination flag.
///
/// Returns whether to terminate (skip any further actions).
pub fn handle_requests_or_sleep(
    duration: Duration,
    reason: &str,
    listener: Option<&UnixListener>,
    local_run_command: &str,
) -> bool {
    if signals::is_pending_termination() {
        return true;
    }
    debug!(seconds = duration.as_secs(), reason, "sleeping");

    let deadline = Instant::now() + duration;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        if signals::is_pending_termination() {
            return true;
        }
        let chunk = remaining.min(Duration::from_secs(1));

        match listener {
            Some(listener) => {
                let mut fds = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
                let millis = u16::try_from(chunk.as_millis()).unwrap_or(1000);
                match poll(&mut fds, PollTimeout::from(millis)) {
                    Ok(0) => {}
                    Ok(_) => {
                        if signals::is_pending_termination() {
                            return true;
                        }
                        match listener.accept() {
                            Ok((stream, _)) => spawn_handler(stream, local_run_command),
                            Err(e) => warn!(error = %e, "failed to accept runagent connection"),
                        }
                    }
                    Err(nix::errno::Errno::EINTR) => {}
                    Err(e) => warn!(error = %e, "poll failed during sleep"),
                }
            }
            None => std::thread::sleep(chunk),
        }
    }

    signals::is_pending_termination()
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_socket_path_resolution() {
        let state = Path::new("/var/lib/tenet/state");
        let default = socket_path(state, None).unwrap();
        assert_eq!(
            default,
            state.join(RUNAGENT_SOCKET_DIR).join(RUNAGENT_SOCKET_NAME)
        );

        let custom = socket_path(state, Some("/tmp/sock")).unwrap();
        assert_eq!(custom, Path::new("/tmp/sock").join(RUNAGENT_SOCKET_NAME));

        assert!(socket_path(state, Some("no")).is_none());
        assert!(socket_path(state, Some("NO")).is_none());
    }

    #[test]
    fn test_setup_creates_directory_with_mode_0750() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let path = socket_path(&state, None).unwrap();
        let _listener = setup_socket(&path).unwrap();

        assert!(path.exists());
        let parent_mode = std::fs::metadata(path.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(parent_mode & 0o777, 0o750);
    }

    #[test]
    fn test_setup_replaces_leftover_socket() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RUNAGENT_SOCKET_NAME);
        std::fs::write(&path, b"stale").unwrap();
        let _listener = setup_socket(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_handle_request_returns_command_output() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(RUNAGENT_SOCKET_NAME);
        let listener = setup_socket(&path).unwrap();

        let client_path = path.clone();
        let client = std::thread::spawn(move || {
            let mut stream = UnixStream::connect(&client_path).unwrap();
            stream.write_all(b"run now\n").unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).unwrap();
            response
        });

        let (stream, _addr) = listener.accept().unwrap();
        handle_request(stream, "echo agent-ran");

        let response = client.join().unwrap();
        assert_eq!(response.trim(), "agent-ran");
    }

    #[test]
    fn test_socket_access_modes() {
        let dir = TempDir::new().unwrap();
        let state = dir.path().join("state");
        let path = socket_path(&state, None).unwrap();
        let _listener = setup_socket(&path).unwrap();

        apply_socket_access(&path, &BTreeSet::new());
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let users = BTreeSet::from(["operator".to_string()]);
        apply_socket_access(&path, &users);
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o660);

        unlink_socket(&path);
        assert!(!path.exists());
    }
}
