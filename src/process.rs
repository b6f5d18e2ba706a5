//! Managed-process data model: the immutable spec a client submits
//! (`ProcessConfig`) and the mutable runtime record the supervisor owns
//! (`ProcessInfo`).

use serde::{Deserialize, Serialize};

pub const DEFAULT_KILL_TIMEOUT_MS: u32 = 5000;
pub const DEFAULT_MIN_UPTIME_MS: u64 = 1000;
pub const DEFAULT_MAX_RESTARTS: i32 = 15;
pub const DEFAULT_LISTEN_TIMEOUT_MS: u32 = 8000;
pub const DEFAULT_WATCH_DELAY_MS: u32 = 1000;
pub const DEFAULT_MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_RETAIN: u32 = 30;

/// Immutable specification of a managed process. Cluster instances get an
/// owned copy each, with `name` rewritten to `base:index`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub script: String,
    pub cwd: String,
    /// Explicit interpreter; empty means auto-detect by shebang/extension.
    pub interpreter: String,
    /// SIGTERM → SIGKILL escalation window.
    pub kill_timeout_ms: u32,
    pub autorestart: bool,
    /// Consecutive-crash cutoff; negative means unbounded.
    pub max_restarts: i32,
    /// Exits before this much uptime count as crashes.
    pub min_uptime_ms: u64,
    pub restart_delay_ms: u32,
    pub exp_backoff: bool,
    /// RSS ceiling in bytes; 0 = unbounded.
    pub max_memory_restart: u64,
    pub watch: bool,
    pub watch_delay_ms: u32,
    /// Semicolon-separated directories; empty means watch `cwd`.
    pub watch_paths: String,
    /// Semicolon-separated substrings excluded at registration time.
    pub watch_ignore: String,
    /// Five-field cron expression, or empty for none.
    pub cron_restart: String,
    /// Hold the process in `starting` until it reports readiness.
    pub wait_ready: bool,
    pub listen_timeout_ms: u32,
    /// Send `{"type":"shutdown"}` on the IPC channel before signaling.
    pub shutdown_with_message: bool,
    pub instances: u32,
    pub instance_id: u32,
    pub max_log_size: u64,
    pub log_retain: u32,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            script: String::new(),
            cwd: String::new(),
            interpreter: String::new(),
            kill_timeout_ms: DEFAULT_KILL_TIMEOUT_MS,
            autorestart: false,
            max_restarts: DEFAULT_MAX_RESTARTS,
            min_uptime_ms: DEFAULT_MIN_UPTIME_MS,
            restart_delay_ms: 0,
            exp_backoff: false,
            max_memory_restart: 0,
            watch: false,
            watch_delay_ms: DEFAULT_WATCH_DELAY_MS,
            watch_paths: String::new(),
            watch_ignore: String::new(),
            cron_restart: String::new(),
            wait_ready: false,
            listen_timeout_ms: DEFAULT_LISTEN_TIMEOUT_MS,
            shutdown_with_message: false,
            instances: 1,
            instance_id: 0,
            max_log_size: DEFAULT_MAX_LOG_SIZE,
            log_retain: DEFAULT_LOG_RETAIN,
        }
    }
}

impl ProcessConfig {
    pub fn needs_channel(&self) -> bool {
        self.wait_ready || self.shutdown_with_message
    }
}

/// Process lifecycle status. Numeric values are wire-visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProcessStatus {
    Stopped = 0,
    Running = 1,
    Errored = 2,
    Starting = 3,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Errored => "errored",
            Self::Starting => "starting",
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Running | Self::Starting)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable runtime record. Only the supervisor, on the event-loop thread,
/// ever writes one.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Daemon-local id; monotonic from 1, never reused within a lifetime.
    pub id: u32,
    pub name: String,
    pub pid: i32,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub consecutive_crashes: u32,
    /// Most recent RSS sample in bytes.
    pub memory_bytes: u64,
    /// Wall-clock spawn time, ms since epoch.
    pub start_time_ms: u64,
    pub last_restart_ms: u64,
    pub config: ProcessConfig,
}

impl ProcessInfo {
    pub fn new(id: u32, pid: i32, status: ProcessStatus, now_ms: u64, config: ProcessConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            pid,
            status,
            restart_count: 0,
            consecutive_crashes: 0,
            memory_bytes: 0,
            start_time_ms: now_ms,
            last_restart_ms: 0,
            config,
        }
    }

    pub fn uptime_ms(&self, now_ms: u64) -> u64 {
        if self.status.is_alive() {
            now_ms.saturating_sub(self.start_time_ms)
        } else {
            0
        }
    }
}

/// Wall clock in milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
