//! Sandboxed child-process execution.
//!
//! Spawns the resolved command with a policy-derived environment, captures
//! stdout/stderr concurrently under a byte cap (continuing to drain the
//! pipes past the cap so a chatty child never deadlocks on a full pipe
//! buffer), and enforces a wall-clock timeout. Grounded in the
//! spawn-then-race-against-a-timer shape used for sidecar process
//! supervision elsewhere in this lineage, generalized from a long-lived
//! sidecar to a single bounded command run.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use requiem_error::{ErrorCode, RequiemError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Appended once a captured stream hits its byte cap.
pub const TRUNCATION_MARKER: &str = "(truncated)";

/// Exit code reported when the executor kills a child for exceeding its
/// wall-clock timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long a timed-out child is given to exit after `SIGTERM` before the
/// executor escalates to a forceful kill.
const TIMEOUT_GRACE_PERIOD: Duration = Duration::from_millis(2_000);

/// One captured output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOutput {
    /// Captured bytes, at most `max_output_bytes` plus the truncation marker.
    pub bytes: Vec<u8>,
    /// Whether the stream produced more bytes than the cap allowed.
    pub truncated: bool,
}

/// Outcome of one sandboxed run, before canonicalization or hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawExecution {
    /// Raw process exit code, or [`TIMEOUT_EXIT_CODE`] on timeout.
    pub exit_code: i32,
    /// One of `""`, `"timeout"`, `"signal"`.
    pub termination_reason: String,
    /// Captured stdout.
    pub stdout: RawOutput,
    /// Captured stderr.
    pub stderr: RawOutput,
}

impl RawExecution {
    /// Whether this run counts as a clean success: exit 0, no timeout, no signal.
    pub fn ok(&self) -> bool {
        self.exit_code == 0 && self.termination_reason.is_empty()
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> std::io::Result<RawOutput> {
    let mut buf = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        if buf.len() < cap {
            let remaining = cap - buf.len();
            let take = remaining.min(n);
            buf.extend_from_slice(&chunk[..take]);
            if take < n {
                truncated = true;
            }
        } else {
            truncated = true;
        }
        // Keep draining past the cap so the child's pipe never backs up,
        // even though we stop accumulating bytes once `cap` is hit.
    }
    if truncated {
        buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
    }
    Ok(RawOutput { bytes: buf, truncated })
}

/// Spawn `command` with `argv`, `cwd`, and exactly `env` (no inherited
/// parent environment), capture stdout/stderr under `max_output_bytes`
/// each, and enforce `timeout_ms`.
///
/// On timeout the child is signaled gracefully first (`SIGTERM` on unix),
/// given [`TIMEOUT_GRACE_PERIOD`] to exit, and killed forcefully only if it
/// is still running afterwards. Either way `exit_code` is reported as
/// [`TIMEOUT_EXIT_CODE`] with `termination_reason = "timeout"`. A child
/// terminated by a signal outside of our own timeout handling is reported
/// with `termination_reason = "signal"`.
pub async fn execute_sandboxed(
    command: &Path,
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
    max_output_bytes: u64,
    timeout_ms: u64,
) -> Result<RawExecution, RequiemError> {
    let cap = usize::try_from(max_output_bytes).unwrap_or(usize::MAX);

    let mut cmd = Command::new(command);
    cmd.args(argv)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        RequiemError::new(ErrorCode::SpawnFailed, format!("failed to spawn child: {e}"))
            .with_source(e)
    })?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_task = tokio::spawn(read_capped(stdout, cap));
    let stderr_task = tokio::spawn(read_capped(stderr, cap));

    let timeout = Duration::from_millis(timeout_ms);
    let (exit_code, termination_reason) = match tokio::time::timeout(timeout, child.wait()).await
    {
        Ok(Ok(status)) => exit_status_to_reason(&status),
        Ok(Err(e)) => {
            return Err(RequiemError::new(
                ErrorCode::SpawnFailed,
                format!("failed waiting on child: {e}"),
            )
            .with_source(e));
        }
        Err(_elapsed) => {
            tracing::warn!(timeout_ms, "execution timed out, sending graceful signal");
            send_graceful_signal(&child);
            if tokio::time::timeout(TIMEOUT_GRACE_PERIOD, child.wait()).await.is_err() {
                tracing::warn!("child ignored graceful signal, killing forcefully");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
            (TIMEOUT_EXIT_CODE, "timeout".to_string())
        }
    };

    let stdout = stdout_task
        .await
        .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("stdout capture task: {e}")))?
        .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("stdout capture io: {e}")))?;
    let stderr = stderr_task
        .await
        .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("stderr capture task: {e}")))?
        .map_err(|e| RequiemError::new(ErrorCode::Internal, format!("stderr capture io: {e}")))?;

    Ok(RawExecution {
        exit_code,
        termination_reason,
        stdout,
        stderr,
    })
}

/// Send a graceful termination signal to a still-running child. Best-effort:
/// a failure here (child already exited, permission denied) just falls
/// through to the forceful kill once the grace period expires.
#[cfg(unix)]
fn send_graceful_signal(child: &tokio::process::Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let pid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
        tracing::debug!(error = %e, "SIGTERM delivery failed, will rely on forceful kill");
    }
}

#[cfg(not(unix))]
fn send_graceful_signal(_child: &tokio::process::Child) {}

#[cfg(unix)]
fn exit_status_to_reason(status: &std::process::ExitStatus) -> (i32, String) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
        (128 + signal, "signal".to_string())
    } else {
        (status.code().unwrap_or(-1), String::new())
    }
}

#[cfg(not(unix))]
fn exit_status_to_reason(status: &std::process::ExitStatus) -> (i32, String) {
    (status.code().unwrap_or(-1), String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh() -> PathBuf {
        PathBuf::from("/bin/sh")
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "echo hello".to_string()],
            dir.path(),
            &BTreeMap::new(),
            1024,
            5000,
        )
        .await
        .unwrap();

        assert!(result.ok());
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.bytes, b"hello\n");
        assert!(!result.stdout.truncated);
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_ok() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "exit 7".to_string()],
            dir.path(),
            &BTreeMap::new(),
            1024,
            5000,
        )
        .await
        .unwrap();

        assert!(!result.ok());
        assert_eq!(result.exit_code, 7);
        assert_eq!(result.termination_reason, "");
    }

    #[tokio::test]
    async fn truncates_output_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "printf '0123456789'".to_string()],
            dir.path(),
            &BTreeMap::new(),
            4,
            5000,
        )
        .await
        .unwrap();

        assert!(result.stdout.truncated);
        assert_eq!(
            result.stdout.bytes,
            [b"0123".as_slice(), TRUNCATION_MARKER.as_bytes()].concat()
        );
    }

    #[tokio::test]
    async fn timeout_kills_child_and_reports_124() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "sleep 5".to_string()],
            dir.path(),
            &BTreeMap::new(),
            1024,
            50,
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.termination_reason, "timeout");
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn timeout_escalates_to_forceful_kill_when_child_ignores_sigterm() {
        let dir = tempfile::tempdir().unwrap();
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "trap '' TERM; sleep 5".to_string()],
            dir.path(),
            &BTreeMap::new(),
            1024,
            50,
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.termination_reason, "timeout");
        assert!(!result.ok());
    }

    #[tokio::test]
    async fn env_is_exactly_what_was_passed() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = BTreeMap::new();
        env.insert("ONLY_VAR".to_string(), "value".to_string());
        let result = execute_sandboxed(
            &sh(),
            &["-c".to_string(), "env".to_string()],
            dir.path(),
            &env,
            4096,
            5000,
        )
        .await
        .unwrap();

        let out = String::from_utf8_lossy(&result.stdout.bytes);
        assert_eq!(out.trim(), "ONLY_VAR=value");
    }

    #[tokio::test]
    async fn spawn_failure_reports_spawn_failed() {
        let dir = tempfile::tempdir().unwrap();
        let err = execute_sandboxed(
            &PathBuf::from("/nonexistent/definitely/not/a/binary"),
            &[],
            dir.path(),
            &BTreeMap::new(),
            1024,
            1000,
        )
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::SpawnFailed);
    }
}
