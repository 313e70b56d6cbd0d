//! Handle for the worker subprocess.
//!
//! Bundles the process id, both pipe ends, the display lease and the
//! workspace, and tears all of them down exactly once.

use std::process::Child;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use super::exit::{ExitReason, WorkerFailure, analyze_wait_status};
use super::ipc::{self, PipeFd, ReplyReader, RequestWriter};
use crate::config::ProtocolVariant;
use crate::display::DisplayLease;
use crate::error::{IjError, Result};
use crate::protocol::{AttributeSink, ProtocolSession, SessionOutcome, write_request};
use crate::workspace::Workspace;

/// How long a worker that closed its pipes gets to finish exiting before the
/// failure is reported without an exit status.
const EXIT_GRACE: Duration = Duration::from_millis(200);

/// Live worker process and everything it depends on.
#[derive(Debug)]
pub struct WorkerHandle {
    pid: Pid,
    writer: Option<RequestWriter>,
    reader: Option<ReplyReader>,
    display: Option<DisplayLease>,
    workspace: Option<Workspace>,
    /// Exit status already collected; the pid must not be signalled again.
    reaped: bool,
    torn_down: bool,
}

impl WorkerHandle {
    /// Wrap a spawned child. Takes ownership of its stdin and stdout.
    pub fn from_child(
        mut child: Child,
        workspace: Workspace,
        display: DisplayLease,
    ) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(IjError::Spawn("worker stdio was not captured".into()));
            }
        };

        Ok(Self {
            pid,
            writer: Some(ipc::request_writer(PipeFd::from(stdin))),
            reader: Some(ipc::reply_reader(PipeFd::from(stdout))),
            display: Some(display),
            workspace: Some(workspace),
            reaped: false,
            torn_down: false,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Workspace root, until teardown removes it.
    pub fn workspace_root(&self) -> Option<&std::path::Path> {
        self.workspace.as_ref().map(Workspace::root)
    }

    /// Display the worker was started on, until teardown releases it.
    pub fn display(&self) -> Option<&DisplayLease> {
        self.display.as_ref()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Check if the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        if self.reaped {
            return false;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            _ => {
                self.reaped = true;
                false
            }
        }
    }

    /// Send one request: the image frame followed by the macro-name frame.
    pub fn send_request(&mut self, image: &[u8], macro_name: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(Self::torn_down_error)?;
        let result = write_request(writer, image, macro_name);
        result.map_err(|e| self.gone("sending the request", e))?;
        debug!(
            pid = self.pid.as_raw(),
            image_bytes = image.len(),
            "Request sent to worker"
        );
        Ok(())
    }

    /// Read one reply, streaming attributes into `sink` as they arrive.
    ///
    /// Framing errors come back as [`SessionOutcome::Framing`]. A closed or
    /// failing pipe is reported as [`IjError::WorkerGone`] with the exit reason.
    pub fn read_outcome<S>(&mut self, variant: ProtocolVariant, sink: &mut S) -> Result<SessionOutcome>
    where
        S: AttributeSink + ?Sized,
    {
        let reader = self.reader.as_mut().ok_or_else(Self::torn_down_error)?;
        let result = match variant {
            ProtocolVariant::Framed => ProtocolSession::new(reader).run(sink),
            ProtocolVariant::BareResult => reader.read_bare_result().map_err(IjError::from),
        };
        match result {
            Err(IjError::Io(e)) => Err(self.gone("reading the reply", e)),
            other => other,
        }
    }

    /// Kill the worker, close both pipes, stop the display server and remove
    /// the workspace. Runs once; later calls return `Ok(())`.
    ///
    /// Every step is attempted even if an earlier one fails. The first
    /// failure is returned.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut first_error: Option<IjError> = None;

        if !self.reaped {
            match signal::kill(self.pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => record(&mut first_error, IjError::Io(e.into())),
            }
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.reaped = true;
                    debug!(pid = self.pid.as_raw(), reason = %analyze_wait_status(status), "Worker reaped");
                }
                Err(e) => record(&mut first_error, IjError::Io(e.into())),
            }
        }

        if let Some(writer) = self.writer.take() {
            ipc::discard(writer);
        }
        self.reader = None;

        if let Some(mut display) = self.display.take()
            && let Err(e) = display.release()
        {
            record(
                &mut first_error,
                IjError::Display(format!("stopping display {}: {}", display.display(), e)),
            );
        }

        if let Some(workspace) = self.workspace.take() {
            let root = workspace.root().to_path_buf();
            match workspace.remove() {
                Ok(()) => debug!(workspace = %root.display(), "Workspace removed"),
                Err(e) => record(&mut first_error, e),
            }
        }

        info!(pid = self.pid.as_raw(), "Worker torn down");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Why the worker stopped, waiting briefly for a process that is exiting.
    fn exit_reason(&mut self) -> ExitReason {
        if self.reaped {
            return ExitReason::Unknown;
        }
        let deadline = std::time::Instant::now() + EXIT_GRACE;
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(WaitStatus::StillAlive) => return ExitReason::StillRunning,
                Ok(status) => {
                    self.reaped = true;
                    return analyze_wait_status(status);
                }
                Err(_) => {
                    self.reaped = true;
                    return ExitReason::Unknown;
                }
            }
        }
    }

    fn gone(&mut self, context: &str, error: std::io::Error) -> IjError {
        let failure = WorkerFailure::new(self.exit_reason())
            .with_context(context)
            .with_message(error.to_string());
        warn!(pid = self.pid.as_raw(), "{}", failure);
        IjError::WorkerGone(failure.to_string())
    }

    fn torn_down_error() -> IjError {
        IjError::WorkerGone("worker has already been torn down".into())
    }
}

fn record(slot: &mut Option<IjError>, error: IjError) {
    warn!("Teardown step failed: {}", error);
    slot.get_or_insert(error);
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!(pid = self.pid.as_raw(), "Teardown on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkspaceSources;
    use crate::protocol::{AttributeRecord, FramingError};
    use crate::workspace::{bootstrap, fixtures::asset_dir};
    use serial_test::serial;
    use std::process::{Command, Stdio};
    use tempfile::tempdir;

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let assets = tempdir().unwrap();
        let sources: WorkspaceSources = asset_dir(assets.path());
        let ws = bootstrap(&sources, &[]).unwrap();
        (assets, ws)
    }

    fn spawn_sh(script: &str, ws: Workspace) -> WorkerHandle {
        let child = Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        WorkerHandle::from_child(child, ws, DisplayLease::fixed(99)).unwrap()
    }

    fn pid_exists(pid: Pid) -> bool {
        signal::kill(pid, None).is_ok()
    }

    fn no_attrs(_: AttributeRecord) -> Result<()> {
        Ok(())
    }

    #[test]
    #[serial(children)]
    fn test_teardown_kills_and_removes() {
        let (_assets, ws) = workspace();
        let root = ws.root().to_path_buf();
        let mut worker = spawn_sh("exec sleep 60", ws);
        let pid = worker.pid();

        assert!(worker.is_running());
        assert_eq!(worker.workspace_root(), Some(root.as_path()));

        worker.teardown().unwrap();

        assert!(!root.exists());
        assert!(!pid_exists(pid));
        assert!(worker.workspace_root().is_none());
        assert!(worker.is_torn_down());

        // Idempotent
        worker.teardown().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_drop_tears_down() {
        let (_assets, ws) = workspace();
        let root = ws.root().to_path_buf();
        let worker = spawn_sh("exec sleep 60", ws);
        let pid = worker.pid();

        drop(worker);

        assert!(!root.exists());
        assert!(!pid_exists(pid));
    }

    #[test]
    #[serial(children)]
    fn test_request_and_reply() {
        let (_assets, ws) = workspace();
        // Ignore the request, answer with a fixed reply
        let mut worker = spawn_sh(
            "printf 'BEGIN\\nATTR\\nK\\n1\\nk\\nV\\n2\\nvv\\nRESULT\\n3\\n2.5\\n'; exec sleep 60",
            ws,
        );

        worker.send_request(b"IMG", b"m").unwrap();
        let mut attrs = Vec::new();
        let mut sink = |r: AttributeRecord| -> Result<()> {
            attrs.push(r);
            Ok(())
        };
        let outcome = worker.read_outcome(ProtocolVariant::Framed, &mut sink).unwrap();

        assert_eq!(outcome.value(), 2.5);
        assert_eq!(attrs[0].value, b"vv".to_vec());
        worker.teardown().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_bare_result_variant() {
        let (_assets, ws) = workspace();
        let mut worker = spawn_sh("echo 12.75; exec sleep 60", ws);

        let outcome = worker
            .read_outcome(ProtocolVariant::BareResult, &mut no_attrs)
            .unwrap();
        assert_eq!(outcome.value(), 12.75);
    }

    #[test]
    #[serial(children)]
    fn test_framing_error_keeps_worker() {
        let (_assets, ws) = workspace();
        let mut worker = spawn_sh("echo HELLO; exec sleep 60", ws);

        let outcome = worker
            .read_outcome(ProtocolVariant::Framed, &mut no_attrs)
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Framing(FramingError::MissingBegin("HELLO".into()))
        );
        assert!(worker.is_running());
    }

    #[test]
    #[serial(children)]
    fn test_dead_worker_reports_exit_code() {
        let (_assets, ws) = workspace();
        let mut worker = spawn_sh("exit 3", ws);

        let err = worker
            .read_outcome(ProtocolVariant::Framed, &mut no_attrs)
            .unwrap_err();

        assert!(matches!(err, IjError::WorkerGone(_)));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("exited with code 3"));

        // Already reaped; teardown must not signal a recycled pid
        worker.teardown().unwrap();
    }

    #[test]
    #[serial(children)]
    fn test_send_after_teardown() {
        let (_assets, ws) = workspace();
        let mut worker = spawn_sh("exec sleep 60", ws);
        worker.teardown().unwrap();

        let err = worker.send_request(b"", b"").unwrap_err();
        assert!(matches!(err, IjError::WorkerGone(_)));
    }
}
