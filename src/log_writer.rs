//! Rotated per-process log files.
//!
//! Lines are appended to `<log_dir>/<name>-out.log` / `<name>-err.log`,
//! one trailing newline each. Rotation is size-based and numbered:
//! base -> base.1 -> base.2 ... up to the retain count, oldest deleted first.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::process::{DEFAULT_LOG_RETAIN, DEFAULT_MAX_LOG_SIZE};
use crate::ring_buffer::STREAM_STDOUT;

/// Per-(name, stream) rotation limits.
#[derive(Debug, Clone, Copy)]
pub struct RotationLimits {
    pub max_size: u64,
    pub retain: u32,
}

impl Default for RotationLimits {
    fn default() -> Self {
        Self { max_size: DEFAULT_MAX_LOG_SIZE, retain: DEFAULT_LOG_RETAIN }
    }
}

struct StreamFile {
    path: PathBuf,
    /// Running size of the live file; seeded from disk on first open.
    size: u64,
    limits: RotationLimits,
}

pub struct LogWriter {
    log_dir: PathBuf,
    streams: HashMap<(String, u8), StreamFile>,
    /// Limits registered per process name; applied when a stream is first
    /// touched.
    limits: HashMap<String, RotationLimits>,
}

impl LogWriter {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
            streams: HashMap::new(),
            limits: HashMap::new(),
        }
    }

    pub fn set_limits(&mut self, name: &str, limits: RotationLimits) {
        self.limits.insert(name.to_string(), limits);
    }

    pub fn stream_path(&self, name: &str, stream: u8) -> PathBuf {
        let suffix = if stream == STREAM_STDOUT { "out" } else { "err" };
        self.log_dir.join(format!("{name}-{suffix}.log"))
    }

    /// Append one line, creating the file if absent. The input's trailing
    /// newline (if any) is normalized to exactly one.
    pub fn append_line(&mut self, name: &str, stream: u8, line: &[u8]) -> io::Result<()> {
        let key = (name.to_string(), stream);
        if !self.streams.contains_key(&key) {
            let path = self.stream_path(name, stream);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let limits = self.limits.get(name).copied().unwrap_or_default();
            self.streams.insert(key.clone(), StreamFile { path, size, limits });
        }
        let sf = self.streams.get_mut(&key).expect("stream entry just inserted");

        let trimmed = trim_trailing_newline(line);
        let mut f = open_append(&sf.path)?;
        f.write_all(trimmed)?;
        f.write_all(b"\n")?;
        sf.size += trimmed.len() as u64 + 1;

        if sf.limits.max_size > 0 && sf.size >= sf.limits.max_size {
            rotate_numbered(&sf.path, sf.limits.retain)?;
            // Recreate the live file empty right away, as the rotation's
            // counterpart to reopen-after-rename.
            open_append(&sf.path)?;
            sf.size = 0;
        }
        Ok(())
    }

    /// Forget in-memory accounting for a process (files stay on disk).
    pub fn forget(&mut self, name: &str) {
        self.streams.retain(|(n, _), _| n != name);
        self.limits.remove(name);
    }
}

fn trim_trailing_newline(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Numbered shift: delete `.retain`, rename `.k` -> `.k+1` descending, then
/// live -> `.1`. With retain = 0 the live file is simply truncated away.
fn rotate_numbered(base: &Path, retain: u32) -> io::Result<()> {
    if retain == 0 {
        let _ = fs::remove_file(base);
        return Ok(());
    }
    let numbered = |k: u32| PathBuf::from(format!("{}.{k}", base.display()));

    let oldest = numbered(retain);
    if oldest.exists() {
        let _ = fs::remove_file(&oldest);
    }
    for k in (1..retain).rev() {
        let from = numbered(k);
        if from.exists() {
            let _ = fs::rename(&from, numbered(k + 1));
        }
    }
    if base.exists() {
        fs::rename(base, numbered(1))?;
    }
    Ok(())
}
