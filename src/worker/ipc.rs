//! Buffered pipe I/O for the worker's standard streams.
//!
//! Provides EINTR-safe reads and writes over the pipes, so a signal delivered
//! to the supervisor mid-request never surfaces as a spurious I/O error.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::process::{ChildStdin, ChildStdout};

use crate::protocol::WireReader;

/// Default buffer size for worker pipes (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }
}

impl From<ChildStdin> for PipeFd {
    fn from(stdin: ChildStdin) -> Self {
        Self::new(OwnedFd::from(stdin))
    }
}

impl From<ChildStdout> for PipeFd {
    fn from(stdout: ChildStdout) -> Self {
        Self::new(OwnedFd::from(stdout))
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffered writer over the worker's stdin.
pub type RequestWriter = BufWriter<PipeFd>;

/// Record reader over the worker's stdout.
pub type ReplyReader = WireReader<BufReader<PipeFd>>;

pub fn request_writer(fd: PipeFd) -> RequestWriter {
    BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, fd)
}

pub fn reply_reader(fd: PipeFd) -> ReplyReader {
    WireReader::new(BufReader::with_capacity(DEFAULT_BUFFER_SIZE, fd))
}

/// Close a request writer without flushing what is still buffered.
///
/// Used on teardown, where the reader may already be gone and a flush
/// would raise `SIGPIPE`/`EPIPE` for no benefit.
pub fn discard(writer: RequestWriter) {
    let (fd, _unflushed) = writer.into_parts();
    drop(fd);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AttributeRecord, ProtocolSession, write_request};

    fn create_pipe() -> (PipeFd, PipeFd) {
        let (read_fd, write_fd) = nix::unistd::pipe().expect("Failed to create pipe");
        (PipeFd::new(read_fd), PipeFd::new(write_fd))
    }

    #[test]
    fn test_request_frames_over_pipe() {
        let (read_fd, write_fd) = create_pipe();
        let mut writer = request_writer(write_fd);

        write_request(&mut writer, b"IMG", b"macro").unwrap();
        drop(writer);

        let mut raw = Vec::new();
        let mut read_fd = read_fd;
        read_fd.read_to_end(&mut raw).unwrap();
        assert_eq!(raw, b"\x00\x00\x00\x03IMG\x00\x00\x00\x05macro".to_vec());
    }

    #[test]
    fn test_reply_session_over_pipe() {
        let (read_fd, mut write_fd) = create_pipe();
        let mut reader = reply_reader(read_fd);

        write_fd
            .write_all(b"BEGIN\r\nATTR\nK\n1\nk\nV\n1\nv\nRESULT\n2\n10\n")
            .unwrap();
        drop(write_fd);

        let mut seen = Vec::new();
        let mut sink = |r: AttributeRecord| -> crate::error::Result<()> {
            seen.push(r);
            Ok(())
        };
        let outcome = ProtocolSession::new(&mut reader).run(&mut sink).unwrap();
        assert_eq!(outcome.value(), 10.0);
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_discard_drops_buffered_bytes() {
        let (mut read_fd, write_fd) = create_pipe();
        let mut writer = request_writer(write_fd);

        writer.write_all(b"never sent").unwrap();
        discard(writer);

        let mut raw = Vec::new();
        read_fd.read_to_end(&mut raw).unwrap();
        assert!(raw.is_empty());
    }
}
