//! Debounced directory watching for watch-driven restarts.
//!
//! Each watched process owns one watcher: inotify on Linux, a dedicated
//! kqueue with `EVFILT_VNODE` elsewhere. `check_for_changes` is
//! non-blocking: it drains pending events, stamps the last-change time, and
//! reports true only once the debounce delay has elapsed with no reset.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::fd;

pub struct FileWatcher {
    paths_spec: String,
    ignore: Vec<String>,
    delay_ms: u64,
    last_change_ms: u64,
    backend: Backend,
}

impl FileWatcher {
    /// `paths` and `ignore` are semicolon-separated; an empty path list means
    /// "watch the process working directory".
    pub fn new(paths: &str, ignore: &str, delay_ms: u64) -> Self {
        Self {
            paths_spec: paths.to_string(),
            ignore: split_spec(ignore),
            delay_ms,
            last_change_ms: 0,
            backend: Backend::closed(),
        }
    }

    /// Resolve the configured paths against `cwd` and register them.
    /// Returns how many directories were registered; ignore substrings
    /// exclude paths here, at registration time.
    pub fn setup(&mut self, cwd: &str) -> io::Result<usize> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        let specs = split_spec(&self.paths_spec);
        let raw: Vec<PathBuf> = if specs.is_empty() {
            vec![PathBuf::from(cwd)]
        } else {
            specs.iter().map(PathBuf::from).collect()
        };
        for p in raw {
            let abs = if p.is_absolute() { p } else { Path::new(cwd).join(p) };
            let display_path = abs.to_string_lossy();
            if self.ignore.iter().any(|pat| display_path.contains(pat.as_str())) {
                debug!(path = %display_path, "watch path excluded by ignore pattern");
                continue;
            }
            dirs.push(abs);
        }

        self.backend = Backend::open()?;
        let mut registered = 0;
        for dir in &dirs {
            match self.backend.register(dir) {
                Ok(()) => registered += 1,
                Err(e) => debug!(path = %dir.display(), "watch registration failed: {e}"),
            }
        }
        Ok(registered)
    }

    /// Drain pending events; true iff a change was seen at least
    /// `delay_ms` ago and nothing newer reset the clock.
    pub fn check_for_changes(&mut self, now_ms: u64) -> bool {
        if self.backend.drain() {
            self.last_change_ms = now_ms;
        }
        if self.last_change_ms != 0 && now_ms.saturating_sub(self.last_change_ms) >= self.delay_ms {
            self.last_change_ms = 0;
            return true;
        }
        false
    }
}

fn split_spec(spec: &str) -> Vec<String> {
    spec.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ---------------------------------------------------------------
// inotify backend (Linux)
// ---------------------------------------------------------------

#[cfg(target_os = "linux")]
struct Backend {
    ino_fd: RawFd,
}

#[cfg(target_os = "linux")]
impl Backend {
    fn closed() -> Self {
        Self { ino_fd: -1 }
    }

    fn open() -> io::Result<Self> {
        // SAFETY: plain inotify_init1.
        let ino_fd = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if ino_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { ino_fd })
    }

    fn register(&mut self, dir: &Path) -> io::Result<()> {
        let c = CString::new(dir.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
        let mask = libc::IN_MODIFY | libc::IN_CREATE | libc::IN_DELETE | libc::IN_MOVE_SELF;
        // SAFETY: ino_fd is live; c is a valid NUL-terminated path.
        let wd = unsafe { libc::inotify_add_watch(self.ino_fd, c.as_ptr(), mask) };
        if wd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// True iff any events were pending.
    fn drain(&mut self) -> bool {
        if self.ino_fd < 0 {
            return false;
        }
        let mut saw = false;
        let mut buf = [0u8; 4096];
        loop {
            match fd::read(self.ino_fd, &mut buf) {
                Ok(0) => break,
                Ok(_) => saw = true,
                Err(_) => break, // EAGAIN or a dead watch either way
            }
        }
        saw
    }
}

#[cfg(target_os = "linux")]
impl Drop for Backend {
    fn drop(&mut self) {
        fd::close(self.ino_fd);
        self.ino_fd = -1;
    }
}

// ---------------------------------------------------------------
// kqueue EVFILT_VNODE backend (macOS / BSD)
// ---------------------------------------------------------------

#[cfg(not(target_os = "linux"))]
struct Backend {
    kq: RawFd,
    dir_fds: Vec<RawFd>,
}

#[cfg(not(target_os = "linux"))]
impl Backend {
    fn closed() -> Self {
        Self { kq: -1, dir_fds: Vec::new() }
    }

    fn open() -> io::Result<Self> {
        // SAFETY: plain kqueue(2).
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        fd::set_cloexec(kq)?;
        Ok(Self { kq, dir_fds: Vec::new() })
    }

    fn register(&mut self, dir: &Path) -> io::Result<()> {
        let c = CString::new(dir.to_string_lossy().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "nul in path"))?;
        // SAFETY: c is a valid NUL-terminated path.
        let dfd = unsafe { libc::open(c.as_ptr(), libc::O_RDONLY) };
        if dfd < 0 {
            return Err(io::Error::last_os_error());
        }
        let kev = libc::kevent {
            ident: dfd as usize,
            filter: libc::EVFILT_VNODE,
            flags: libc::EV_ADD | libc::EV_CLEAR,
            fflags: libc::NOTE_WRITE | libc::NOTE_DELETE | libc::NOTE_RENAME | libc::NOTE_ATTRIB,
            data: 0,
            udata: std::ptr::null_mut(),
        };
        // SAFETY: kq is live; kev is a valid single-entry changelist.
        let r = unsafe {
            libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if r < 0 {
            let e = io::Error::last_os_error();
            fd::close(dfd);
            return Err(e);
        }
        self.dir_fds.push(dfd);
        Ok(())
    }

    fn drain(&mut self) -> bool {
        if self.kq < 0 {
            return false;
        }
        let mut saw = false;
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        loop {
            let mut kev: [libc::kevent; 8] = unsafe { std::mem::zeroed() };
            // SAFETY: kev is a valid 8-slot eventlist; zero timeout.
            let n = unsafe {
                libc::kevent(self.kq, std::ptr::null(), 0, kev.as_mut_ptr(), 8, &zero)
            };
            if n <= 0 {
                break;
            }
            saw = true;
        }
        saw
    }
}

#[cfg(not(target_os = "linux"))]
impl Drop for Backend {
    fn drop(&mut self) {
        for dfd in self.dir_fds.drain(..) {
            fd::close(dfd);
        }
        fd::close(self.kq);
        self.kq = -1;
    }
}
