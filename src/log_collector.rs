//! Log collector: owns child output pipes, splits them into lines, and
//! routes every line to the per-process ring buffer and the rotated
//! on-disk writer.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::Path;

use tracing::warn;

use crate::error::VelosError;
use crate::event::EventLoop;
use crate::fd;
use crate::log_writer::{LogWriter, RotationLimits};
use crate::process::now_ms;
use crate::ring_buffer::{
    LogEntry, RingBuffer, LEVEL_ERROR, LEVEL_INFO, STREAM_STDERR, STREAM_STDOUT,
};

const READ_CHUNK: usize = 4096;

struct ProcessLogs {
    name: String,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    ring: RingBuffer,
}

pub struct LogCollector {
    procs: HashMap<u32, ProcessLogs>,
    /// fd → (process id, stream) reverse map.
    fd_index: HashMap<RawFd, (u32, u8)>,
    writer: LogWriter,
}

impl LogCollector {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            procs: HashMap::new(),
            fd_index: HashMap::new(),
            writer: LogWriter::new(log_dir),
        }
    }

    /// Take ownership of a fresh spawn's pipe fds.
    pub fn add_process(
        &mut self,
        id: u32,
        name: &str,
        stdout_fd: RawFd,
        stderr_fd: RawFd,
        limits: RotationLimits,
    ) {
        self.writer.set_limits(name, limits);
        self.fd_index.insert(stdout_fd, (id, STREAM_STDOUT));
        self.fd_index.insert(stderr_fd, (id, STREAM_STDERR));
        self.procs.insert(
            id,
            ProcessLogs {
                name: name.to_string(),
                stdout_fd,
                stderr_fd,
                ring: RingBuffer::default(),
            },
        );
    }

    pub fn has_process(&self, id: u32) -> bool {
        self.procs.contains_key(&id)
    }

    /// Keep log routing aligned when a cluster rename changes the process
    /// name (`web` -> `web:0`). Files already on disk keep the old name.
    pub fn rename_process(&mut self, id: u32, name: &str) {
        if let Some(p) = self.procs.get_mut(&id) {
            p.name = name.to_string();
        }
    }

    /// One non-blocking read off a ready pipe, split at newlines. A partial
    /// trailing line (no terminator in this chunk) is forwarded as-is; the
    /// coarse fidelity is accepted by design.
    pub fn handle_pipe_data(&mut self, ready: RawFd) {
        let Some(&(id, stream)) = self.fd_index.get(&ready) else {
            return;
        };
        let Some(proc_logs) = self.procs.get_mut(&id) else {
            return;
        };

        let mut buf = [0u8; READ_CHUNK];
        let n = match fd::read(ready, &mut buf) {
            Ok(n) => n,
            Err(e) if fd::would_block(&e) => return,
            Err(e) => {
                warn!(fd = ready, "pipe read failed: {e}");
                return;
            }
        };
        if n == 0 {
            return; // EOF; the hup event drives close_pipe
        }

        let level = if stream == STREAM_STDERR { LEVEL_ERROR } else { LEVEL_INFO };
        let ts = now_ms();
        for line in buf[..n].split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            proc_logs.ring.push(LogEntry {
                timestamp_ms: ts,
                level,
                stream,
                message: line.to_vec(),
            });
            if let Err(e) = self.writer.append_line(&proc_logs.name, stream, line) {
                warn!(name = %proc_logs.name, stream, "log append failed: {e}");
            }
        }
    }

    /// Deregister and close one pipe fd. Fds the collector closes are always
    /// removed from the event layer first.
    pub fn close_pipe(&mut self, ready: RawFd, events: &mut EventLoop) {
        let Some((id, stream)) = self.fd_index.remove(&ready) else {
            return;
        };
        if let Some(p) = self.procs.get_mut(&id) {
            if stream == STREAM_STDOUT && p.stdout_fd == ready {
                p.stdout_fd = -1;
            }
            if stream == STREAM_STDERR && p.stderr_fd == ready {
                p.stderr_fd = -1;
            }
        }
        events.remove_fd(ready);
        fd::close(ready);
    }

    /// Close both pipes and release the ring buffer. On-disk files survive.
    pub fn remove_process(&mut self, id: u32, events: &mut EventLoop) {
        let Some(p) = self.procs.get(&id) else {
            return;
        };
        let (out_fd, err_fd) = (p.stdout_fd, p.stderr_fd);
        for pipe in [out_fd, err_fd] {
            if pipe >= 0 {
                self.close_pipe(pipe, events);
            }
        }
        if let Some(p) = self.procs.remove(&id) {
            self.writer.forget(&p.name);
        }
    }

    /// Newest `n` buffered entries, oldest first.
    pub fn read_last(&self, id: u32, n: usize) -> Result<Vec<&LogEntry>, VelosError> {
        let p = self.procs.get(&id).ok_or(VelosError::ProcessNotFound(id))?;
        Ok(p.ring.read_last(n).collect())
    }

    /// Close every remaining pipe (daemon teardown).
    pub fn shutdown(&mut self, events: &mut EventLoop) {
        let ids: Vec<u32> = self.procs.keys().copied().collect();
        for id in ids {
            self.remove_process(id, events);
        }
    }
}
