//! Owned pipe endpoints with EINTR handling.
//!
//! Every descriptor the pool hands around is wrapped in a [`PipeFd`], so it is
//! closed exactly once on every exit path.

use nix::errno::Errno;
use nix::fcntl::{FcntlArg, FdFlag, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

/// Capacity of one atomic kernel pipe write.
pub const PIPE_CAPACITY: usize = nix::libc::PIPE_BUF;

/// A file descriptor wrapper that implements Read/Write with EINTR handling.
#[derive(Debug)]
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    /// Create from an owned file descriptor.
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Create an anonymous pipe, returning `(read_end, write_end)`.
    ///
    /// Both ends are marked close-on-exec so that spawned workers never
    /// inherit them.
    pub fn pair() -> nix::Result<(PipeFd, PipeFd)> {
        let (read_fd, write_fd) = nix::unistd::pipe()?;
        let (read_end, write_end) = (Self::new(read_fd), Self::new(write_fd));
        read_end.set_cloexec()?;
        write_end.set_cloexec()?;
        Ok((read_end, write_end))
    }

    /// Switch the descriptor to non-blocking mode.
    pub fn set_nonblocking(&self) -> nix::Result<()> {
        let flags = OFlag::from_bits_truncate(fcntl(&self.fd, FcntlArg::F_GETFL)?);
        fcntl(&self.fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        Ok(())
    }

    /// Mark the descriptor close-on-exec.
    pub fn set_cloexec(&self) -> nix::Result<()> {
        let flags = FdFlag::from_bits_truncate(fcntl(&self.fd, FcntlArg::F_GETFD)?);
        fcntl(&self.fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
        Ok(())
    }

    /// Whether the close-on-exec flag is set.
    pub fn is_cloexec(&self) -> nix::Result<bool> {
        let flags = FdFlag::from_bits_truncate(fcntl(&self.fd, FcntlArg::F_GETFD)?);
        Ok(flags.contains(FdFlag::FD_CLOEXEC))
    }

    /// Block until the descriptor is readable or the peer hung up.
    pub fn wait_readable(&self) -> io::Result<()> {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLIN)];
        loop {
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
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
                Err(Errno::EINTR) => continue,
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
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(()) // Pipes don't need flushing at the fd level
    }
}

/// Wait until at least one of `fds` is readable (or hung up).
///
/// Retries on EINTR. An empty set returns immediately.
pub fn wait_any_readable(fds: &[BorrowedFd<'_>]) -> io::Result<()> {
    if fds.is_empty() {
        return Ok(());
    }
    let mut poll_fds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();
    loop {
        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_pair_roundtrip() {
        let (mut reader, mut writer) = PipeFd::pair().expect("Failed to create pipe");
        writer.write_all(b"hello\n").unwrap();
        drop(writer);

        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello\n");
    }

    #[test]
    fn test_pair_is_cloexec() {
        let (reader, writer) = PipeFd::pair().unwrap();
        assert!(reader.is_cloexec().unwrap());
        assert!(writer.is_cloexec().unwrap());
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let (mut reader, _writer) = PipeFd::pair().unwrap();
        reader.set_nonblocking().unwrap();

        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_nonblocking_read_eof_after_close() {
        let (mut reader, writer) = PipeFd::pair().unwrap();
        reader.set_nonblocking().unwrap();
        drop(writer);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_wait_readable_wakes_on_data() {
        let (reader, mut writer) = PipeFd::pair().unwrap();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            writer.write_all(b"x").unwrap();
        });
        reader.wait_readable().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_any_readable_empty_set() {
        wait_any_readable(&[]).unwrap();
    }

    #[test]
    fn test_wait_any_readable_wakes_on_hangup() {
        let (idle, _idle_writer) = PipeFd::pair().unwrap();
        let (closed, closed_writer) = PipeFd::pair().unwrap();
        drop(closed_writer);
        wait_any_readable(&[idle.as_fd(), closed.as_fd()]).unwrap();
    }
}
