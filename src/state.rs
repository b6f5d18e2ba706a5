//! State persistence: directory layout, the daemon PID file, and the
//! `state.bin` snapshot of managed process configurations.
//!
//! The snapshot is little-endian binary, one record per process, in a fixed
//! field order. Fields appended to the format over time are optional on
//! load: absent trailing fields take zero-equivalents, and a snapshot
//! truncated mid-record loads as the valid prefix.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::process::ProcessConfig;
use crate::protocol::{WireReader, WireWriter};

pub const SOCKET_FILE: &str = "velos.sock";
pub const PID_FILE: &str = "velos.pid";
pub const STATE_FILE: &str = "state.bin";
pub const LOG_SUBDIR: &str = "logs";

pub struct Persistence {
    state_dir: PathBuf,
}

impl Persistence {
    /// Ensures `<state_dir>` and `<state_dir>/logs` exist.
    pub fn new(state_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(state_dir)?;
        fs::create_dir_all(state_dir.join(LOG_SUBDIR))?;
        Ok(Self { state_dir: state_dir.to_path_buf() })
    }

    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join(SOCKET_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join(LOG_SUBDIR)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(PID_FILE)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn write_pid_file(&self) -> io::Result<()> {
        let pid = std::process::id();
        fs::write(self.pid_file(), format!("{pid}\n"))
    }

    pub fn read_pid_file(&self) -> Option<i32> {
        let raw = fs::read_to_string(self.pid_file()).ok()?;
        raw.trim().parse().ok()
    }

    pub fn remove_pid_file(&self) {
        let _ = fs::remove_file(self.pid_file());
    }

    /// Snapshot the configs. Written to a temp file and renamed into place:
    /// atomic enough for normal shutdown, which is all the format promises.
    pub fn save(&self, configs: &[ProcessConfig]) -> io::Result<()> {
        let mut w = WireWriter::new();
        w.put_u32(configs.len() as u32);
        for cfg in configs {
            encode_record(&mut w, cfg);
        }

        let target = self.state_file();
        let tmp = self.state_dir.join(format!("{STATE_FILE}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&w.into_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &target)?;
        debug!(count = configs.len(), path = %target.display(), "state saved");
        Ok(())
    }

    /// Load the snapshot. A malformed tail yields the valid prefix, never an
    /// error; a missing file is an empty set.
    pub fn load(&self) -> Vec<ProcessConfig> {
        let raw = match fs::read(self.state_file()) {
            Ok(b) => b,
            Err(_) => return Vec::new(),
        };
        let mut r = WireReader::new(&raw);
        let count = match r.take_u32() {
            Ok(c) => c as usize,
            Err(_) => return Vec::new(),
        };

        let mut out = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            match decode_record(&mut r) {
                Ok(cfg) => out.push(cfg),
                Err(_) => {
                    warn!(
                        loaded = out.len(),
                        declared = count,
                        "state snapshot truncated; keeping valid prefix"
                    );
                    break;
                }
            }
        }
        out
    }
}

fn encode_record(w: &mut WireWriter, cfg: &ProcessConfig) {
    w.put_str(&cfg.name);
    w.put_str(&cfg.script);
    w.put_str(&cfg.cwd);
    w.put_str(&cfg.interpreter);
    w.put_u32(cfg.kill_timeout_ms);
    w.put_bool(cfg.autorestart);
    w.put_i32(cfg.max_restarts);
    w.put_u64(cfg.min_uptime_ms);
    w.put_u32(cfg.restart_delay_ms);
    w.put_bool(cfg.exp_backoff);
    w.put_u64(cfg.max_memory_restart);
    w.put_bool(cfg.watch);
    w.put_u32(cfg.watch_delay_ms);
    w.put_str(&cfg.watch_paths);
    w.put_str(&cfg.watch_ignore);
    w.put_str(&cfg.cron_restart);
    w.put_bool(cfg.wait_ready);
    w.put_u32(cfg.listen_timeout_ms);
    w.put_bool(cfg.shutdown_with_message);
    w.put_u32(cfg.instances);
    w.put_u32(cfg.instance_id);
}

fn decode_record(r: &mut WireReader<'_>) -> Result<ProcessConfig, crate::error::VelosError> {
    // Name and script are the record anchor; everything after degrades to
    // zero-equivalents for forward/backward format compatibility.
    let name = r.take_str()?;
    let script = r.take_str()?;
    let mut cfg = ProcessConfig {
        name,
        script,
        cwd: r.take_str_or_empty()?,
        interpreter: r.take_str_or_empty()?,
        kill_timeout_ms: r.take_u32_or(0)?,
        autorestart: r.take_bool_or(false)?,
        max_restarts: r.take_i32_or(0)?,
        min_uptime_ms: r.take_u64_or(0)?,
        restart_delay_ms: r.take_u32_or(0)?,
        exp_backoff: r.take_bool_or(false)?,
        max_memory_restart: r.take_u64_or(0)?,
        watch: r.take_bool_or(false)?,
        watch_delay_ms: r.take_u32_or(0)?,
        watch_paths: r.take_str_or_empty()?,
        watch_ignore: r.take_str_or_empty()?,
        cron_restart: r.take_str_or_empty()?,
        wait_ready: r.take_bool_or(false)?,
        listen_timeout_ms: r.take_u32_or(0)?,
        shutdown_with_message: r.take_bool_or(false)?,
        instances: r.take_u32_or(0)?,
        instance_id: r.take_u32_or(0)?,
        ..ProcessConfig::default()
    };
    if cfg.instances == 0 {
        cfg.instances = 1;
    }
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn persistence() -> (Persistence, TempDir) {
        let dir = TempDir::new().unwrap();
        let p = Persistence::new(dir.path()).unwrap();
        (p, dir)
    }

    fn sample(name: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.into(),
            script: format!("/srv/{name}/run.sh"),
            cwd: format!("/srv/{name}"),
            interpreter: "/bin/sh".into(),
            kill_timeout_ms: 4000,
            autorestart: true,
            max_restarts: 7,
            min_uptime_ms: 1500,
            restart_delay_ms: 200,
            exp_backoff: true,
            max_memory_restart: 256 * 1024 * 1024,
            watch: true,
            watch_delay_ms: 900,
            watch_paths: "/srv/a;/srv/b".into(),
            watch_ignore: ".git".into(),
            cron_restart: "0 3 * * *".into(),
            wait_ready: true,
            listen_timeout_ms: 9000,
            shutdown_with_message: true,
            instances: 2,
            instance_id: 1,
            ..ProcessConfig::default()
        }
    }

    #[test]
    fn creates_directories() {
        let (p, dir) = persistence();
        assert!(dir.path().is_dir());
        assert!(p.log_dir().is_dir());
        assert_eq!(p.socket_path(), dir.path().join("velos.sock"));
    }

    #[test]
    fn pid_file_roundtrip() {
        let (p, _dir) = persistence();
        assert_eq!(p.read_pid_file(), None);
        p.write_pid_file().unwrap();
        assert_eq!(p.read_pid_file(), Some(std::process::id() as i32));
        p.remove_pid_file();
        assert_eq!(p.read_pid_file(), None);
    }

    #[test]
    fn save_load_roundtrip() {
        let (p, _dir) = persistence();
        let configs = vec![sample("alpha"), sample("beta")];
        p.save(&configs).unwrap();
        let loaded = p.load();
        assert_eq!(loaded.len(), 2);
        for (orig, got) in configs.iter().zip(&loaded) {
            assert_eq!(got.name, orig.name);
            assert_eq!(got.script, orig.script);
            assert_eq!(got.cwd, orig.cwd);
            assert_eq!(got.interpreter, orig.interpreter);
            assert_eq!(got.kill_timeout_ms, orig.kill_timeout_ms);
            assert_eq!(got.autorestart, orig.autorestart);
            assert_eq!(got.max_restarts, orig.max_restarts);
            assert_eq!(got.min_uptime_ms, orig.min_uptime_ms);
            assert_eq!(got.restart_delay_ms, orig.restart_delay_ms);
            assert_eq!(got.exp_backoff, orig.exp_backoff);
            assert_eq!(got.max_memory_restart, orig.max_memory_restart);
            assert_eq!(got.watch, orig.watch);
            assert_eq!(got.watch_delay_ms, orig.watch_delay_ms);
            assert_eq!(got.watch_paths, orig.watch_paths);
            assert_eq!(got.watch_ignore, orig.watch_ignore);
            assert_eq!(got.cron_restart, orig.cron_restart);
            assert_eq!(got.wait_ready, orig.wait_ready);
            assert_eq!(got.listen_timeout_ms, orig.listen_timeout_ms);
            assert_eq!(got.shutdown_with_message, orig.shutdown_with_message);
            assert_eq!(got.instances, orig.instances);
            assert_eq!(got.instance_id, orig.instance_id);
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let (p, _dir) = persistence();
        assert!(p.load().is_empty());
    }

    #[test]
    fn truncated_snapshot_loads_valid_prefix() {
        let (p, _dir) = persistence();
        p.save(&[sample("alpha"), sample("beta")]).unwrap();
        let full = fs::read(p.state_file()).unwrap();
        // Chop into the middle of the second record.
        fs::write(p.state_file(), &full[..full.len() - 40]).unwrap();

        let loaded = p.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "alpha");
    }

    #[test]
    fn short_record_takes_zero_equivalents() {
        let (p, _dir) = persistence();
        // Hand-roll an old-format record: count=1, name + script only.
        let mut w = WireWriter::new();
        w.put_u32(1);
        w.put_str("legacy");
        w.put_str("run.sh");
        fs::write(p.state_file(), w.into_bytes()).unwrap();

        let loaded = p.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "legacy");
        assert_eq!(loaded[0].kill_timeout_ms, 0);
        assert!(!loaded[0].autorestart);
        assert_eq!(loaded[0].instances, 1); // clamped from zero
    }
}
