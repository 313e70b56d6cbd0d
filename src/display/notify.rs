//! Self-pipe bridging display-server signals into a blocking read.
//!
//! The display server reports readiness with `SIGUSR1` and failure by exiting
//! (`SIGCHLD`). The handler publishes one byte into a pipe; the allocator
//! blocks on the read end. The handler touches nothing but an atomic load and
//! `write(2)`.

use std::io::{self, PipeReader, PipeWriter, Read};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Write end of the armed channel, or -1 when no channel is armed.
static NOTIFY_FD: AtomicI32 = AtomicI32::new(-1);

const READY_BYTE: u8 = b'R';
const CHILD_EXITED_BYTE: u8 = b'C';

/// An event observed through the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// A display server finished binding its display.
    Ready,
    /// Some child process changed state; the caller must check which.
    ChildExited,
}

extern "C" fn on_signal(signo: libc::c_int) {
    let fd = NOTIFY_FD.load(Ordering::Acquire);
    if fd < 0 {
        return;
    }
    let byte = if signo == libc::SIGUSR1 {
        READY_BYTE
    } else {
        CHILD_EXITED_BYTE
    };
    // Safety: write(2) is async-signal-safe and `byte` outlives the call.
    // A full pipe drops the byte (non-blocking fd); a pending byte already wakes the reader.
    unsafe {
        libc::write(fd, (&byte as *const u8).cast(), 1);
    }
}

/// Single-slot notification channel. At most one can be armed per process.
///
/// Dropping the channel restores the previous signal dispositions before the
/// pipe is closed.
pub struct NotifyChannel {
    reader: PipeReader,
    writer: PipeWriter,
    previous: Vec<(Signal, SigAction)>,
}

impl NotifyChannel {
    /// Create the pipe, publish its write end, and install the handlers.
    pub fn arm() -> io::Result<Self> {
        let (reader, writer) = io::pipe()?;
        let fd = writer.as_raw_fd();

        // Safety: `fd` is owned by `writer`, which outlives this call.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }

        NOTIFY_FD
            .compare_exchange(-1, fd, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "a display notification channel is already armed",
                )
            })?;

        let mut channel = Self {
            reader,
            writer,
            previous: Vec::with_capacity(2),
        };

        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        for sig in [Signal::SIGUSR1, Signal::SIGCHLD] {
            // Safety: the handler only loads an atomic and calls write(2).
            let old = unsafe { signal::sigaction(sig, &action) }.map_err(io::Error::from)?;
            channel.previous.push((sig, old));
        }

        Ok(channel)
    }

    /// Block until the next notification arrives.
    pub fn wait(&mut self) -> io::Result<Notification> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "notification pipe closed",
                    ));
                }
                Ok(_) => {
                    return match byte[0] {
                        READY_BYTE => Ok(Notification::Ready),
                        _ => Ok(Notification::ChildExited),
                    };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for NotifyChannel {
    fn drop(&mut self) {
        for (sig, old) in self.previous.drain(..).rev() {
            // Safety: reinstalling the disposition that was active before arm().
            let _ = unsafe { signal::sigaction(sig, &old) };
        }
        let _ = NOTIFY_FD.compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}
