//! Virtual display allocation.
//!
//! The worker's GUI toolkit needs a display even when it never draws, so a
//! disposable framebuffer server is started first. Candidates are probed one
//! at a time: the server is launched with `SIGUSR1` ignored, which makes it
//! signal its parent once the display is bound. A server that cannot bind
//! exits instead. Both outcomes arrive through [`notify::NotifyChannel`].

mod notify;

use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};

use tracing::{debug, info, warn};

use crate::error::{IjError, Result};
pub use notify::{Notification, NotifyChannel};

/// Launches a display server bound to a given display number.
pub trait DisplayLauncher {
    /// Build the command for one candidate. Stdio and signal setup are applied
    /// by the allocator.
    fn command(&self, display: u32) -> Command;
}

/// Program plus arguments; `{display}` in any argument is replaced by the
/// candidate number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayServerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl DisplayServerCommand {
    pub const PLACEHOLDER: &'static str = "{display}";

    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Xvfb listening on TCP, so `localhost:N` resolves for the worker.
    pub fn xvfb() -> Self {
        Self::new(
            "Xvfb",
            [":{display}", "-listen", "tcp", "-screen", "0", "1024x768x24"]
                .into_iter()
                .map(String::from)
                .collect(),
        )
    }
}

impl DisplayLauncher for DisplayServerCommand {
    fn command(&self, display: u32) -> Command {
        let number = display.to_string();
        let mut cmd = Command::new(&self.program);
        cmd.args(
            self.args
                .iter()
                .map(|arg| arg.replace(Self::PLACEHOLDER, &number)),
        );
        cmd
    }
}

/// A bound display and the server process that owns it.
///
/// Dropping the lease kills and reaps the server.
#[derive(Debug)]
pub struct DisplayLease {
    display: u32,
    server: Option<Child>,
}

impl DisplayLease {
    /// A display managed outside this process; nothing to shut down.
    pub fn fixed(display: u32) -> Self {
        Self {
            display,
            server: None,
        }
    }

    pub fn display(&self) -> u32 {
        self.display
    }

    /// Value for the worker's `DISPLAY` variable.
    pub fn env_value(&self) -> String {
        format!("localhost:{}", self.display)
    }

    pub fn server_pid(&self) -> Option<u32> {
        self.server.as_ref().map(Child::id)
    }

    /// Kill and reap the display server. Safe to call more than once.
    pub fn release(&mut self) -> io::Result<()> {
        let Some(mut server) = self.server.take() else {
            return Ok(());
        };
        debug!(display = self.display, pid = server.id(), "Stopping display server");
        match server.kill() {
            Ok(()) => {}
            // Already exited; wait() below reaps it
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        server.wait().map(|_| ())
    }
}

impl Drop for DisplayLease {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(display = self.display, "Failed to stop display server: {}", e);
        }
    }
}

enum Probe {
    Ready,
    Exited(ExitStatus),
}

/// Find an unused display by probing `0..max_candidates` in order.
///
/// A busy candidate is never reported; exhausting every candidate is fatal.
/// Signal dispositions are restored before this returns.
pub fn allocate_display<L>(launcher: &L, max_candidates: u32) -> Result<DisplayLease>
where
    L: DisplayLauncher + ?Sized,
{
    let mut channel = NotifyChannel::arm()
        .map_err(|e| IjError::Display(format!("arming notification channel: {}", e)))?;

    for candidate in 0..max_candidates {
        let mut cmd = launcher.command(candidate);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Safety: signal(2) is async-signal-safe. An inherited SIG_IGN for
        // SIGUSR1 is what tells the server to report readiness to its parent.
        unsafe {
            cmd.pre_exec(|| {
                libc::signal(libc::SIGUSR1, libc::SIG_IGN);
                Ok(())
            });
        }

        let mut server = cmd.spawn().map_err(|e| {
            IjError::Display(format!(
                "launching {:?} for display {}: {}",
                cmd.get_program(),
                candidate,
                e
            ))
        })?;
        debug!(display = candidate, pid = server.id(), "Probing display");

        match probe(&mut channel, &mut server)? {
            Probe::Ready => {
                drop(channel);
                info!(display = candidate, pid = server.id(), "Display server ready");
                return Ok(DisplayLease {
                    display: candidate,
                    server: Some(server),
                });
            }
            Probe::Exited(status) => {
                debug!(display = candidate, %status, "Display busy, trying next");
            }
        }
    }

    Err(IjError::DisplayExhausted {
        candidates: max_candidates,
    })
}

/// Wait until `server` is either ready or has exited.
fn probe(channel: &mut NotifyChannel, server: &mut Child) -> Result<Probe> {
    loop {
        let notification = channel
            .wait()
            .map_err(|e| IjError::Display(format!("waiting for display server: {}", e)))?;
        match notification {
            Notification::Ready => return Ok(Probe::Ready),
            Notification::ChildExited => {
                // SIGCHLD may belong to an unrelated child
                if let Some(status) = server.try_wait()? {
                    return Ok(Probe::Exited(status));
                }
            }
        }
    }
}
