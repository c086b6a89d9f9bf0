//! Worker process supervision.
//!
//! Owns the lifetime of one `deno` subprocess: spawning it with
//! permission-derived flags and the staged bootstrap script, and tearing
//! it down with a bounded grace period. The session layer owns the stdio
//! streams; this module only keeps the child handle.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{Result, VmError};
use crate::permissions::PermissionSet;

/// The worker-side command loop, shipped with the crate and staged into
/// a temp directory at spawn time.
const VM_SERVER: &str = include_str!("../runtime/vm-server.js");

/// A running worker process. Dropping it kills the child; prefer
/// [`WorkerProcess::terminate`] for a clean shutdown.
#[derive(Debug)]
pub(crate) struct WorkerProcess {
    child: Child,
    /// Keeps the staged bootstrap script alive for the child's lifetime.
    _stage: tempfile::TempDir,
}

impl WorkerProcess {
    /// Spawns the worker with flags derived from `permissions` plus
    /// read access to the staged script. Absent permission categories
    /// stay denied; the default posture is least privilege.
    pub(crate) fn spawn(
        config: &ServerConfig,
        permissions: &PermissionSet,
    ) -> Result<(WorkerProcess, ChildStdin, ChildStdout)> {
        let stage = tempfile::TempDir::new()
            .map_err(|e| VmError::Process(format!("failed to stage vm-server: {e}")))?;
        let script = stage.path().join("vm-server.js");
        std::fs::write(&script, VM_SERVER)
            .map_err(|e| VmError::Process(format!("failed to stage vm-server: {e}")))?;

        let mut command = Command::new(&config.command);
        command
            .arg("run")
            .arg("--unstable-worker-options")
            .args(permissions.to_launch_args())
            // The worker runtime itself only needs to read its own
            // bootstrap script.
            .arg(format!("--allow-read={}", stage.path().display()))
            .arg(&script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // stderr is a diagnostic stream, never protocol content.
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        debug!(command = %config.command, "spawning vm-server");
        let mut child = command.spawn().map_err(|e| {
            VmError::Process(format!(
                "failed to start vm-server: '{}' is unavailable ({e})",
                config.command
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| VmError::Process("worker stdin was not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VmError::Process("worker stdout was not piped".into()))?;

        Ok((WorkerProcess { child, _stage: stage }, stdin, stdout))
    }

    /// Waits up to `grace` for the child to exit (the caller has already
    /// closed its stdin, which signals clean shutdown), then kills it.
    ///
    /// Best-effort cleanup: failures here are logged, never propagated,
    /// so a caller's own close sequence is not masked by an unrelated
    /// teardown fault.
    pub(crate) async fn terminate(mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("vm-server exited cleanly");
            }
            Ok(Ok(status)) => {
                warn!(%status, "vm-server exited with non-zero status");
            }
            Ok(Err(e)) => {
                warn!("failed to reap vm-server: {e}");
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "vm-server did not exit in time, killing");
                if let Err(e) = self.child.kill().await {
                    warn!("failed to kill vm-server: {e}");
                }
            }
        }
    }
}
