//! Worker subprocess spawning.
//!
//! The worker runs inside the workspace's worker directory with the leased
//! display exported as `DISPLAY`. Its stdin and stdout become the request and
//! reply pipes; stderr is inherited so JVM diagnostics reach the host log.

use std::process::{Command, Stdio};

use tracing::info;

use super::proc::WorkerHandle;
use crate::config::WorkerSpec;
use crate::display::DisplayLease;
use crate::error::{IjError, Result};
use crate::workspace::Workspace;

/// Start the worker. Takes ownership of the workspace and the display lease;
/// both are released by the returned handle's teardown.
///
/// On failure the workspace and display are released before returning.
pub fn spawn_worker(
    spec: &WorkerSpec,
    workspace: Workspace,
    lease: DisplayLease,
) -> Result<WorkerHandle> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(workspace.worker_dir())
        .env("DISPLAY", lease.env_value())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let err = IjError::Spawn(format!("{}: {}", spec.program.display(), e));
            drop(lease);
            // Best effort; the spawn failure is what gets reported
            let _ = workspace.remove();
            return Err(err);
        }
    };

    info!(
        pid = child.id(),
        program = %spec.program.display(),
        display = %lease.env_value(),
        cwd = %workspace.worker_dir().display(),
        "Worker started"
    );

    WorkerHandle::from_child(child, workspace, lease)
}
