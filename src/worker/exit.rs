//! Exit analysis for the worker process.
//!
//! Turns a wait status into a readable reason so a vanished worker can be
//! reported with more than "broken pipe".

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why the worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// Process is still running.
    StillRunning,
    /// Already reaped, or the status carried nothing useful.
    Unknown,
}

impl ExitReason {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            // The JVM dies this way when the heap limit is hit under a cgroup
            Self::Signaled(Signal::SIGKILL) => "was killed (SIGKILL)".to_string(),
            Self::Signaled(sig) => format!("was killed by signal {:?}", sig),
            Self::StillRunning => "is still running".to_string(),
            Self::Unknown => "stopped for an unknown reason".to_string(),
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze a `WaitStatus` to determine the exit reason.
pub fn analyze_wait_status(status: WaitStatus) -> ExitReason {
    match status {
        WaitStatus::Exited(_, code) => ExitReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => ExitReason::Signaled(signal),
        WaitStatus::StillAlive => ExitReason::StillRunning,
        _ => ExitReason::Unknown,
    }
}

/// Information about a worker failure.
#[derive(Debug)]
pub struct WorkerFailure {
    pub reason: ExitReason,
    /// What the supervisor was doing when it noticed.
    pub context: Option<String>,
    pub message: Option<String>,
}

impl WorkerFailure {
    pub fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            context: None,
            message: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

impl std::fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {}", self.reason)?;
        if let Some(ctx) = &self.context {
            write!(f, " while {}", ctx)?;
        }
        if let Some(msg) = &self.message {
            write!(f, ": {}", msg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_analyze_wait_status() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(analyze_wait_status(status), ExitReason::Exited(3));

        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGSEGV, true);
        assert_eq!(
            analyze_wait_status(status),
            ExitReason::Signaled(Signal::SIGSEGV)
        );

        assert_eq!(
            analyze_wait_status(WaitStatus::StillAlive),
            ExitReason::StillRunning
        );
    }

    #[test]
    fn test_success() {
        assert!(ExitReason::Exited(0).is_success());
        assert!(!ExitReason::Exited(1).is_success());
        assert!(!ExitReason::Signaled(Signal::SIGTERM).is_success());
    }

    #[test]
    fn test_worker_failure_display() {
        let failure = WorkerFailure::new(ExitReason::Exited(1))
            .with_context("reading the reply")
            .with_message("stream closed mid-record");

        let display = failure.to_string();
        assert_eq!(
            display,
            "worker exited with code 1 while reading the reply: stream closed mid-record"
        );
    }
}
