//! Platform event layer: register fds and signals, block for readiness.
//!
//! Two compile-time-selected backends implement the same surface:
//! epoll plus a self-pipe for signals on Linux, kqueue with
//! `EVFILT_READ`/`EVFILT_SIGNAL` on the BSDs and macOS. A ready fd whose
//! readable side is at EOF is reported with the `_hup` variant of its kind so
//! the caller knows to drain and deregister.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// What a registered fd means to the daemon loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdKind {
    IpcAccept,
    IpcRead,
    PipeRead,
    Signal,
    Timer,
    IpcClientHup,
    PipeHup,
    /// A client socket with armed write interest became writable again.
    /// Reported only while `set_write_interest(fd, true)` is in effect.
    IpcWrite,
}

impl FdKind {
    fn hup_variant(self) -> FdKind {
        match self {
            FdKind::IpcRead => FdKind::IpcClientHup,
            FdKind::PipeRead => FdKind::PipeHup,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    /// Ready fd, or -1 for signal events.
    pub fd: RawFd,
    pub kind: FdKind,
    /// Signal number for `FdKind::Signal` events, 0 otherwise.
    pub signal: i32,
}

/// Upper bound on events surfaced per poll.
pub const MAX_EVENTS: usize = 64;

// ===============================================================
// epoll backend (Linux). Signals arrive through a self-pipe written
// from an async-signal-safe handler; the write end lives in a
// process-wide atomic initialized once.
// ===============================================================

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    use crate::fd;

    static SIGNAL_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

    extern "C" fn signal_to_pipe(signum: libc::c_int) {
        let wr = SIGNAL_PIPE_WR.load(Ordering::Relaxed);
        if wr >= 0 {
            let byte = signum as u8;
            // SAFETY: write(2) is async-signal-safe; one byte per delivery.
            unsafe {
                libc::write(wr, &byte as *const u8 as *const libc::c_void, 1);
            }
        }
    }

    pub struct EventLoop {
        epfd: RawFd,
        kinds: HashMap<RawFd, FdKind>,
        sig_rd: RawFd,
        sig_wr: RawFd,
    }

    impl EventLoop {
        pub fn new() -> io::Result<Self> {
            // SAFETY: plain epoll_create1.
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd < 0 {
                return Err(io::Error::last_os_error());
            }

            let mut fds = [0 as libc::c_int; 2];
            // SAFETY: fds is a valid 2-slot array.
            if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
                let e = io::Error::last_os_error();
                fd::close(epfd);
                return Err(e);
            }
            let (sig_rd, sig_wr) = (fds[0], fds[1]);
            for f in [sig_rd, sig_wr] {
                fd::set_nonblocking(f)?;
                fd::set_cloexec(f)?;
            }
            SIGNAL_PIPE_WR.store(sig_wr, Ordering::SeqCst);

            let this = Self { epfd, kinds: HashMap::new(), sig_rd, sig_wr };
            this.ctl_add(sig_rd)?;
            Ok(this)
        }

        fn ctl_add(&self, target: RawFd) -> io::Result<()> {
            let mut ev = libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                u64: target as u64,
            };
            // SAFETY: epfd and target are live fds; ev is a valid event.
            if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, target, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add_fd(&mut self, target: RawFd, kind: FdKind) -> io::Result<()> {
            self.ctl_add(target)?;
            self.kinds.insert(target, kind);
            Ok(())
        }

        pub fn remove_fd(&mut self, target: RawFd) {
            self.kinds.remove(&target);
            // SAFETY: removal of a possibly-already-closed fd; errors are
            // irrelevant (the kernel auto-deregisters on close).
            unsafe {
                libc::epoll_ctl(
                    self.epfd,
                    libc::EPOLL_CTL_DEL,
                    target,
                    std::ptr::null_mut(),
                );
            }
        }

        /// Arm or disarm write-readiness for an already registered fd.
        /// Callers arm it only while they hold unsent output for the fd.
        pub fn set_write_interest(&mut self, target: RawFd, on: bool) -> io::Result<()> {
            let mut interest = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
            if on {
                interest |= libc::EPOLLOUT as u32;
            }
            let mut ev = libc::epoll_event { events: interest, u64: target as u64 };
            // SAFETY: epfd and target are live fds; ev is a valid event.
            if unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, target, &mut ev) } < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add_signal(&mut self, signum: i32) -> io::Result<()> {
            // SAFETY: installing an async-signal-safe handler.
            unsafe {
                let mut sa: libc::sigaction = std::mem::zeroed();
                sa.sa_sigaction = signal_to_pipe as libc::sighandler_t;
                sa.sa_flags = libc::SA_RESTART;
                libc::sigemptyset(&mut sa.sa_mask);
                if libc::sigaction(signum, &sa, std::ptr::null_mut()) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        }

        /// Block up to `timeout_ms` (None = indefinite, 0 = non-blocking).
        /// Clears `out` and fills up to `MAX_EVENTS` events.
        pub fn poll(&mut self, out: &mut Vec<Event>, timeout_ms: Option<i32>) -> io::Result<usize> {
            out.clear();
            let mut raw = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
            let timeout = timeout_ms.unwrap_or(-1);
            // SAFETY: raw is a valid MAX_EVENTS-slot buffer.
            let n = unsafe {
                libc::epoll_wait(self.epfd, raw.as_mut_ptr(), MAX_EVENTS as i32, timeout)
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if fd::interrupted(&e) {
                    return Ok(0);
                }
                return Err(e);
            }

            for ev in raw.iter().take(n as usize) {
                let ready = ev.u64 as RawFd;
                if ready == self.sig_rd {
                    self.drain_signals(out);
                    continue;
                }
                let Some(&kind) = self.kinds.get(&ready) else {
                    continue; // deregistered earlier this tick
                };
                let bits = ev.events;
                let hup = bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0;
                let readable = bits & libc::EPOLLIN as u32 != 0;
                let writable = bits & libc::EPOLLOUT as u32 != 0;
                // Fds without write interest never carry EPOLLOUT, so they
                // always take the read/hup path.
                if hup || readable || !writable {
                    let k = if hup { kind.hup_variant() } else { kind };
                    out.push(Event { fd: ready, kind: k, signal: 0 });
                }
                if writable && !hup {
                    out.push(Event { fd: ready, kind: FdKind::IpcWrite, signal: 0 });
                }
            }
            Ok(out.len())
        }

        /// One read drains the pending deliveries; each byte is one signal.
        fn drain_signals(&self, out: &mut Vec<Event>) {
            let mut buf = [0u8; MAX_EVENTS];
            if let Ok(n) = fd::read(self.sig_rd, &mut buf) {
                for &b in &buf[..n] {
                    out.push(Event { fd: -1, kind: FdKind::Signal, signal: b as i32 });
                }
            }
        }

        pub fn close(&mut self) {
            let _ = SIGNAL_PIPE_WR.compare_exchange(
                self.sig_wr,
                -1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            fd::close(self.sig_rd);
            fd::close(self.sig_wr);
            fd::close(self.epfd);
            self.sig_rd = -1;
            self.sig_wr = -1;
            self.epfd = -1;
        }
    }

    impl Drop for EventLoop {
        fn drop(&mut self) {
            if self.epfd >= 0 {
                self.close();
            }
        }
    }
}

// ===============================================================
// kqueue backend (macOS / BSD). EVFILT_SIGNAL fires even when the
// disposition is SIG_IGN, which we install so SIGTERM/SIGINT do not
// take the default action.
// ===============================================================

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod imp {
    use super::*;

    use crate::fd;

    pub struct EventLoop {
        kq: RawFd,
        kinds: HashMap<RawFd, FdKind>,
    }

    impl EventLoop {
        pub fn new() -> io::Result<Self> {
            // SAFETY: plain kqueue(2).
            let kq = unsafe { libc::kqueue() };
            if kq < 0 {
                return Err(io::Error::last_os_error());
            }
            fd::set_cloexec(kq)?;
            Ok(Self { kq, kinds: HashMap::new() })
        }

        fn change(&self, ident: usize, filter: i16, flags: u16) -> io::Result<()> {
            let kev = libc::kevent {
                ident,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: std::ptr::null_mut(),
            };
            // SAFETY: kq is live; kev is a valid single-entry changelist.
            let r = unsafe {
                libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null())
            };
            if r < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }

        pub fn add_fd(&mut self, target: RawFd, kind: FdKind) -> io::Result<()> {
            self.change(target as usize, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR)?;
            self.kinds.insert(target, kind);
            Ok(())
        }

        pub fn remove_fd(&mut self, target: RawFd) {
            self.kinds.remove(&target);
            let _ = self.change(target as usize, libc::EVFILT_READ, libc::EV_DELETE);
            // Best-effort: the write filter exists only while armed.
            let _ = self.change(target as usize, libc::EVFILT_WRITE, libc::EV_DELETE);
        }

        /// Arm or disarm write-readiness for an already registered fd.
        /// Callers arm it only while they hold unsent output for the fd.
        pub fn set_write_interest(&mut self, target: RawFd, on: bool) -> io::Result<()> {
            if on {
                self.change(target as usize, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR)
            } else {
                let _ = self.change(target as usize, libc::EVFILT_WRITE, libc::EV_DELETE);
                Ok(())
            }
        }

        pub fn add_signal(&mut self, signum: i32) -> io::Result<()> {
            // SAFETY: replacing the disposition with SIG_IGN; EVFILT_SIGNAL
            // still observes delivery.
            unsafe {
                libc::signal(signum, libc::SIG_IGN);
            }
            self.change(signum as usize, libc::EVFILT_SIGNAL, libc::EV_ADD)
        }

        pub fn poll(&mut self, out: &mut Vec<Event>, timeout_ms: Option<i32>) -> io::Result<usize> {
            out.clear();
            let mut raw: [libc::kevent; MAX_EVENTS] = unsafe { std::mem::zeroed() };
            let ts;
            let ts_ptr = match timeout_ms {
                None => std::ptr::null(),
                Some(ms) => {
                    ts = libc::timespec {
                        tv_sec: (ms / 1000) as libc::time_t,
                        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
                    };
                    &ts as *const libc::timespec
                }
            };
            // SAFETY: raw is a valid MAX_EVENTS-slot eventlist.
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    raw.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    ts_ptr,
                )
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if fd::interrupted(&e) {
                    return Ok(0);
                }
                return Err(e);
            }

            for kev in raw.iter().take(n as usize) {
                if kev.filter == libc::EVFILT_SIGNAL {
                    out.push(Event { fd: -1, kind: FdKind::Signal, signal: kev.ident as i32 });
                    continue;
                }
                let ready = kev.ident as RawFd;
                let Some(&kind) = self.kinds.get(&ready) else {
                    continue;
                };
                let hup = kev.flags & libc::EV_EOF != 0;
                let kind = if kev.filter == libc::EVFILT_WRITE {
                    // A reader-gone EOF on the write filter is a hang-up.
                    if hup { kind.hup_variant() } else { FdKind::IpcWrite }
                } else if hup {
                    kind.hup_variant()
                } else {
                    kind
                };
                out.push(Event { fd: ready, kind, signal: 0 });
            }
            Ok(out.len())
        }

        pub fn close(&mut self) {
            fd::close(self.kq);
            self.kq = -1;
        }
    }

    impl Drop for EventLoop {
        fn drop(&mut self) {
            if self.kq >= 0 {
                self.close();
            }
        }
    }
}

pub use imp::EventLoop;
