//! Parent↔child IPC channel for readiness and shutdown signaling.
//!
//! A stream socket pair: the parent end stays with the daemon (non-blocking,
//! close-on-exec), the child end is inherited across exec and advertised to
//! the child via the `VELOS_IPC_FD` environment variable. Messages are
//! `u32 len (LE)` + payload, capped at 64 KiB.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};

use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

use crate::fd;

pub const MAX_MESSAGE: usize = 64 * 1024;
/// Environment variable carrying the child's decimal fd number.
pub const IPC_FD_ENV: &str = "VELOS_IPC_FD";

#[derive(Debug)]
pub struct IpcChannel {
    parent_fd: RawFd,
    child_fd: RawFd,
}

impl IpcChannel {
    pub fn new() -> io::Result<Self> {
        let (parent, child) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(io::Error::from)?;
        let parent_fd = parent.into_raw_fd();
        let child_fd = child.into_raw_fd();
        fd::set_nonblocking(parent_fd)?;
        // The parent end must not leak into the exec'd child; the child end
        // must survive exec.
        fd::set_cloexec(parent_fd)?;
        Ok(Self { parent_fd, child_fd })
    }

    pub fn child_fd(&self) -> RawFd {
        self.child_fd
    }

    /// Drop the daemon's copy of the child end after fork.
    pub fn close_child_end(&mut self) {
        fd::close(self.child_fd);
        self.child_fd = -1;
    }

    /// Synchronous framed send on the parent end. Messages are small, so a
    /// bounded retry on EWOULDBLOCK within the call is acceptable.
    pub fn send(&self, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_MESSAGE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("channel message too large: {} bytes", payload.len()),
            ));
        }
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(payload);

        let mut written = 0;
        while written < buf.len() {
            match fd::write(self.parent_fd, &buf[written..]) {
                Ok(n) => written += n,
                Err(e) if fd::would_block(&e) || fd::interrupted(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Non-blocking framed read on the parent end. `None` when no message is
    /// pending (EWOULDBLOCK before any byte, or EOF).
    pub fn try_read(&self) -> io::Result<Option<Vec<u8>>> {
        let mut header = [0u8; 4];
        match self.read_exact_retry(&mut header, true)? {
            ReadOutcome::Empty => return Ok(None),
            ReadOutcome::Done => {}
        }
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_MESSAGE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("channel message too large: {len} bytes"),
            ));
        }
        let mut payload = vec![0u8; len];
        if len > 0 {
            // The writer framed the whole message in one write; the tail is
            // already in flight, so a short retry loop is enough.
            match self.read_exact_retry(&mut payload, false)? {
                ReadOutcome::Empty => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel message truncated",
                    ))
                }
                ReadOutcome::Done => {}
            }
        }
        Ok(Some(payload))
    }

    fn read_exact_retry(&self, buf: &mut [u8], bail_if_idle: bool) -> io::Result<ReadOutcome> {
        let mut got = 0;
        while got < buf.len() {
            match fd::read(self.parent_fd, &mut buf[got..]) {
                Ok(0) => {
                    if got == 0 && bail_if_idle {
                        return Ok(ReadOutcome::Empty);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "channel closed mid-message",
                    ));
                }
                Ok(n) => got += n,
                Err(e) if fd::would_block(&e) => {
                    if got == 0 && bail_if_idle {
                        return Ok(ReadOutcome::Empty);
                    }
                    continue;
                }
                Err(e) if fd::interrupted(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(ReadOutcome::Done)
    }
}

enum ReadOutcome {
    Empty,
    Done,
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        fd::close(self.parent_fd);
        fd::close(self.child_fd);
        self.parent_fd = -1;
        self.child_fd = -1;
    }
}
