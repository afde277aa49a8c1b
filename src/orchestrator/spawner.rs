//! External process spawner.
//!
//! Spawns one child per session with:
//! - `kill_on_drop(true)` so a dropped session never leaks its process.
//! - All three stdio handles piped.
//! - Its own process group on Unix (when `kill_process_group` is set) so a
//!   forceful kill also reaches grandchildren holding the pipes open.
//! - An optional environment allowlist: when `env_allowlist` is non-empty the
//!   inherited environment is cleared and only listed variables survive.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::models::session::{SessionHandle, SpawnRequest};
use crate::{AppError, Result};

/// Environment variable carrying the session handle into the child.
pub const SESSION_ENV_VAR: &str = "COMMAND_ASSIST_SESSION_ID";

/// A freshly spawned child with its stdio handles taken out.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Child process handle; owns the process lifetime.
    pub child: Child,
    /// OS process id.
    pub pid: Option<u32>,
    /// Child's stdin.
    pub stdin: ChildStdin,
    /// Child's stdout.
    pub stdout: ChildStdout,
    /// Child's stderr.
    pub stderr: ChildStderr,
}

/// Spawn the process described by `request`.
///
/// # Errors
///
/// Returns `AppError::Spawn` when the working directory does not exist, the
/// executable is missing or not executable, or a stdio handle cannot be
/// captured.
pub fn spawn_process(
    request: &SpawnRequest,
    config: &EngineConfig,
    handle: SessionHandle,
) -> Result<SpawnedProcess> {
    if !request.working_directory.is_dir() {
        return Err(AppError::Spawn(format!(
            "working directory {} does not exist",
            request.working_directory.display()
        )));
    }

    let mut cmd = Command::new(&request.command);
    cmd.args(request.child_args());

    if !config.env_allowlist.is_empty() {
        cmd.env_clear();
        for key in &config.env_allowlist {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
    }
    cmd.env(SESSION_ENV_VAR, handle.to_string());

    cmd.current_dir(&request.working_directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    if config.kill_process_group {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(|err| spawn_error(&request.command, &err))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture child stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture child stderr".into()))?;

    let pid = child.id();
    info!(
        %handle,
        pid = pid.unwrap_or(0),
        command = %request.command,
        cwd = %request.working_directory.display(),
        "process spawned"
    );

    Ok(SpawnedProcess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}

/// Map an OS spawn failure to an actionable message.
fn spawn_error(command: &str, err: &std::io::Error) -> AppError {
    match err.kind() {
        ErrorKind::NotFound => AppError::Spawn(format!(
            "executable `{command}` not found; check installation"
        )),
        ErrorKind::PermissionDenied => {
            AppError::Spawn(format!("permission denied launching `{command}`"))
        }
        _ => AppError::Spawn(format!("failed to launch `{command}`: {err}")),
    }
}

/// Forcefully kill `child` and, on Unix, its whole process group.
///
/// Errors are logged only: the process may already have exited.
pub fn kill_process_tree(child: &mut Child, pid: Option<u32>, kill_group: bool) {
    #[cfg(unix)]
    if kill_group {
        if let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            if let Err(err) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
                debug!(pgid, %err, "killpg failed; group may already be gone");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = (pid, kill_group);

    if let Err(err) = child.start_kill() {
        debug!(%err, "start_kill failed; process may already have exited");
    }
}

/// Exit code and human-readable description of an exit status.
#[must_use]
pub fn describe_exit(status: ExitStatus) -> (Option<i32>, String) {
    let code = status.code();
    let reason = code.map_or_else(
        || "process terminated by signal".to_owned(),
        |c| format!("process exited with code {c}"),
    );
    (code, reason)
}
