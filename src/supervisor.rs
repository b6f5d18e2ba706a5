//! Process supervisor: spawn, reap, restart policy, resource checks,
//! watch/cron-driven restarts, readiness handshakes, cluster scaling.
//!
//! The supervisor owns the process table and every index keyed off it
//! (pid → id, watchers, cron expressions, IPC channels, pending kills and
//! restarts) plus the FIFO of freshly created pipe fds the daemon loop
//! registers with the event layer after each tick. All mutation happens on
//! the event-loop thread.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::path::Path;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use tracing::{debug, info, warn};

use crate::channel::{IpcChannel, IPC_FD_ENV};
use crate::cron::CronExpr;
use crate::error::VelosError;
use crate::event::EventLoop;
use crate::fd;
use crate::log_collector::LogCollector;
use crate::log_writer::RotationLimits;
use crate::process::{ProcessConfig, ProcessInfo, ProcessStatus};
use crate::watcher::FileWatcher;

pub const INSTANCE_ID_ENV: &str = "VELOS_INSTANCE_ID";
pub const NODE_INSTANCE_ENV: &str = "NODE_APP_INSTANCE";

const RESOURCE_CHECK_INTERVAL_MS: u64 = 2000;
const SCALE_DOWN_KILL_TIMEOUT_MS: u32 = 5000;
const BACKOFF_BASE_DEFAULT_MS: u64 = 100;
const BACKOFF_MAX_SHIFT: u32 = 20;
const BACKOFF_CAP_MS: u64 = 15_000;
const SHEBANG_PROBE_BYTES: usize = 256;

pub struct Supervisor {
    next_id: u32,
    processes: HashMap<u32, ProcessInfo>,
    pid_index: HashMap<i32, u32>,
    watchers: HashMap<u32, FileWatcher>,
    cron_jobs: HashMap<u32, CronExpr>,
    channels: HashMap<u32, IpcChannel>,
    /// id → absolute SIGKILL deadline (ms since epoch).
    pending_kills: HashMap<u32, u64>,
    /// id → absolute respawn time (ms since epoch).
    pending_restarts: HashMap<u32, u64>,
    /// Fresh pipe fds awaiting event-layer registration.
    pending_pipe_fds: VecDeque<RawFd>,
    last_resource_check_ms: u64,
    /// hour*60+minute of the last cron scan; guards one firing per minute.
    last_cron_minute: i64,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            processes: HashMap::new(),
            pid_index: HashMap::new(),
            watchers: HashMap::new(),
            cron_jobs: HashMap::new(),
            channels: HashMap::new(),
            pending_kills: HashMap::new(),
            pending_restarts: HashMap::new(),
            pending_pipe_fds: VecDeque::new(),
            last_resource_check_ms: 0,
            last_cron_minute: -1,
        }
    }

    // -----------------------------------------------------------
    // Spawn
    // -----------------------------------------------------------

    /// Spawn one process from a fully populated config. The new pipe fds are
    /// queued on the pending FIFO for the daemon loop to register.
    pub fn start_process(
        &mut self,
        config: ProcessConfig,
        collector: &mut LogCollector,
        now_ms: u64,
    ) -> Result<u32, VelosError> {
        // Validate the cron expression before forking anything.
        let cron = if config.cron_restart.is_empty() {
            None
        } else {
            Some(CronExpr::parse(&config.cron_restart)?)
        };

        let spawned = spawn_child(&config)?;
        let id = self.next_id;
        self.next_id += 1;

        let status = if config.wait_ready {
            ProcessStatus::Starting
        } else {
            ProcessStatus::Running
        };
        info!(
            id,
            name = %config.name,
            pid = spawned.pid,
            status = %status,
            "decision=spawn script={}",
            config.script
        );

        if config.watch {
            let mut watcher = FileWatcher::new(
                &config.watch_paths,
                &config.watch_ignore,
                config.watch_delay_ms as u64,
            );
            let cwd = if config.cwd.is_empty() { "." } else { &config.cwd };
            match watcher.setup(cwd) {
                Ok(n) => {
                    debug!(id, dirs = n, "watcher registered");
                    self.watchers.insert(id, watcher);
                }
                Err(e) => warn!(id, "watcher setup failed: {e}"),
            }
        }
        if let Some(expr) = cron {
            self.cron_jobs.insert(id, expr);
        }
        if let Some(ch) = spawned.channel {
            self.channels.insert(id, ch);
        }

        collector.add_process(
            id,
            &config.name,
            spawned.stdout_fd,
            spawned.stderr_fd,
            RotationLimits { max_size: config.max_log_size, retain: config.log_retain },
        );
        self.pid_index.insert(spawned.pid, id);
        self.pending_pipe_fds.push_back(spawned.stdout_fd);
        self.pending_pipe_fds.push_back(spawned.stderr_fd);

        let info = ProcessInfo::new(id, spawned.pid, status, now_ms, config);
        self.processes.insert(id, info);
        Ok(id)
    }

    /// Spawn `instances` copies of a config. With more than one instance,
    /// names take the `base:index` form and each child learns its instance id
    /// through the environment.
    pub fn start_cluster(
        &mut self,
        config: ProcessConfig,
        collector: &mut LogCollector,
        now_ms: u64,
    ) -> Result<u32, VelosError> {
        let instances = config.instances.max(1);
        if instances == 1 {
            return self.start_process(config, collector, now_ms);
        }
        let mut first_id = 0;
        for k in 0..instances {
            let mut cfg = config.clone();
            cfg.name = format!("{}:{k}", config.name);
            cfg.instance_id = k;
            cfg.instances = instances;
            let id = self.start_process(cfg, collector, now_ms)?;
            if k == 0 {
                first_id = id;
            }
        }
        Ok(first_id)
    }

    // -----------------------------------------------------------
    // Stop / kill escalation
    // -----------------------------------------------------------

    /// Graceful stop: optional shutdown message, then the requested signal
    /// (SIGTERM by default), then a pending SIGKILL at `now + timeout`.
    /// A stop of a process that is not running is a no-op.
    pub fn stop_process(
        &mut self,
        id: u32,
        signal: Option<i32>,
        timeout_ms: Option<u32>,
        now_ms: u64,
    ) -> Result<(), VelosError> {
        let info = self
            .processes
            .get_mut(&id)
            .ok_or(VelosError::ProcessNotFound(id))?;
        if !info.status.is_alive() {
            return Ok(());
        }

        if info.config.shutdown_with_message {
            if let Some(ch) = self.channels.get(&id) {
                let msg = serde_json::json!({"type": "shutdown"}).to_string();
                if let Err(e) = ch.send(msg.as_bytes()) {
                    warn!(id, "shutdown message send failed: {e}");
                }
            }
        }

        let signum = signal.unwrap_or(libc::SIGTERM);
        let sig = Signal::try_from(signum)
            .map_err(|_| VelosError::Protocol(format!("bad signal number {signum}")))?;
        info!(id, name = %info.name, pid = info.pid, sig = signum, "decision=stop");
        if let Err(e) = kill(Pid::from_raw(info.pid), sig) {
            debug!(id, "signal delivery failed (already gone?): {e}");
        }
        if sig != Signal::SIGKILL {
            let timeout = timeout_ms.unwrap_or(info.config.kill_timeout_ms) as u64;
            self.pending_kills.insert(id, now_ms + timeout);
        }
        // Optimistic transition; the reap finalizes stopped vs errored.
        info.status = ProcessStatus::Stopped;
        Ok(())
    }

    /// Escalate to SIGKILL for every deadline that has passed.
    pub fn check_pending_kills(&mut self, now_ms: u64) {
        let due: Vec<u32> = self
            .pending_kills
            .iter()
            .filter(|(_, &deadline)| now_ms >= deadline)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            self.pending_kills.remove(&id);
            if let Some(info) = self.processes.get(&id) {
                if matches!(info.status, ProcessStatus::Running | ProcessStatus::Stopped)
                    && info.pid > 0
                {
                    info!(id, pid = info.pid, "decision=escalate sig=SIGKILL");
                    let _ = kill(Pid::from_raw(info.pid), Signal::SIGKILL);
                }
            }
        }
    }

    // -----------------------------------------------------------
    // Reap & autorestart arbitration
    // -----------------------------------------------------------

    /// Reap every exited child non-blockingly and run restart arbitration.
    pub fn handle_sigchld(
        &mut self,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.reaped(pid.as_raw(), code != 0, collector, events, now_ms);
                }
                Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.reaped(pid.as_raw(), true, collector, events, now_ms);
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => continue,
                Err(_) => break, // ECHILD: nothing left to reap
            }
        }
    }

    fn reaped(
        &mut self,
        pid: i32,
        abnormal: bool,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        let Some(id) = self.pid_index.remove(&pid) else {
            return; // not ours, or superseded by a restart
        };
        self.pending_kills.remove(&id);

        let (decision, name) = {
            let Some(info) = self.processes.get_mut(&id) else {
                return;
            };
            let was_running = info.status == ProcessStatus::Running;
            info.status = if was_running && abnormal {
                ProcessStatus::Errored
            } else {
                ProcessStatus::Stopped
            };

            if !(was_running && info.config.autorestart) {
                (RestartDecision::None, info.name.clone())
            } else {
                let uptime = now_ms.saturating_sub(info.start_time_ms);
                if uptime < info.config.min_uptime_ms {
                    info.consecutive_crashes += 1;
                } else {
                    info.consecutive_crashes = 0;
                }

                let cutoff = info.config.max_restarts >= 0
                    && info.consecutive_crashes >= info.config.max_restarts as u32;
                if cutoff {
                    info.status = ProcessStatus::Errored;
                    (RestartDecision::CrashLoop, info.name.clone())
                } else {
                    let delay = compute_restart_delay(&info.config, info.consecutive_crashes);
                    if delay > 0 {
                        (RestartDecision::Delayed(delay), info.name.clone())
                    } else {
                        (RestartDecision::Immediate, info.name.clone())
                    }
                }
            }
        };

        match decision {
            RestartDecision::None => {
                debug!(id, name = %name, pid, abnormal, "reaped");
            }
            RestartDecision::CrashLoop => {
                warn!(id, name = %name, "decision=halt reason=crash_loop");
            }
            RestartDecision::Delayed(delay) => {
                info!(id, name = %name, delay_ms = delay, "decision=restart_after");
                self.pending_restarts.insert(id, now_ms + delay);
            }
            RestartDecision::Immediate => {
                info!(id, name = %name, "decision=restart");
                if let Err(e) = self.do_restart(id, collector, events, now_ms) {
                    warn!(id, "restart failed: {e}");
                }
            }
        }
    }

    // -----------------------------------------------------------
    // Restart
    // -----------------------------------------------------------

    /// Respawn under the same id: fresh pipes, fresh channel, pid/start-time
    /// updated, restart counter bumped. Sets `errored` on failure.
    pub fn do_restart(
        &mut self,
        id: u32,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) -> Result<(), VelosError> {
        let config = {
            let info = self
                .processes
                .get(&id)
                .ok_or(VelosError::ProcessNotFound(id))?;
            info.config.clone()
        };

        collector.remove_process(id, events);
        self.channels.remove(&id);

        let spawned = match spawn_child(&config) {
            Ok(s) => s,
            Err(e) => {
                if let Some(info) = self.processes.get_mut(&id) {
                    info.status = ProcessStatus::Errored;
                }
                return Err(e);
            }
        };

        let info = self.processes.get_mut(&id).expect("checked above");
        // Drop any stale mapping for the previous pid so a late reap of the
        // old child cannot clobber the new one.
        if info.pid > 0 {
            self.pid_index.remove(&info.pid);
        }
        info.pid = spawned.pid;
        info.status = if config.wait_ready {
            ProcessStatus::Starting
        } else {
            ProcessStatus::Running
        };
        info.start_time_ms = now_ms;
        info.last_restart_ms = now_ms;
        info.restart_count += 1;
        info.memory_bytes = 0;

        self.pid_index.insert(spawned.pid, id);
        if let Some(ch) = spawned.channel {
            self.channels.insert(id, ch);
        }
        collector.add_process(
            id,
            &info.name,
            spawned.stdout_fd,
            spawned.stderr_fd,
            RotationLimits { max_size: config.max_log_size, retain: config.log_retain },
        );
        self.pending_pipe_fds.push_back(spawned.stdout_fd);
        self.pending_pipe_fds.push_back(spawned.stderr_fd);
        info!(id, name = %info.name, pid = spawned.pid, "decision=respawned");
        Ok(())
    }

    /// Client-driven restart: SIGTERM a live child first, tidy the pid
    /// index, then respawn.
    pub fn restart_process(
        &mut self,
        id: u32,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) -> Result<(), VelosError> {
        let pid = {
            let info = self
                .processes
                .get(&id)
                .ok_or(VelosError::ProcessNotFound(id))?;
            if info.status.is_alive() && info.pid > 0 {
                info.pid
            } else {
                0
            }
        };
        if pid > 0 {
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            // Non-blocking reap keeps the pid index tidy if the child died
            // instantly; otherwise the SIGCHLD path ignores the stale pid.
            if let Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) =
                waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG))
            {
                self.pid_index.remove(&pid);
            }
        }
        self.pending_kills.remove(&id);
        self.do_restart(id, collector, events, now_ms)
    }

    /// Fire delayed restarts whose scheduled time has passed.
    pub fn check_pending_restarts(
        &mut self,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        let due: Vec<u32> = self
            .pending_restarts
            .iter()
            .filter(|(_, &at)| now_ms >= at)
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            self.pending_restarts.remove(&id);
            if let Err(e) = self.do_restart(id, collector, events, now_ms) {
                warn!(id, "delayed restart failed: {e}");
            }
        }
    }

    // -----------------------------------------------------------
    // Periodic duties: resources, watchers, cron, readiness
    // -----------------------------------------------------------

    /// Sample RSS at most every 2 s; restart over-limit processes.
    pub fn update_resource_usage(
        &mut self,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        if now_ms.saturating_sub(self.last_resource_check_ms) < RESOURCE_CHECK_INTERVAL_MS {
            return;
        }
        self.last_resource_check_ms = now_ms;

        let mut over_limit: Vec<u32> = Vec::new();
        for (&id, info) in self.processes.iter_mut() {
            if info.status != ProcessStatus::Running || info.pid <= 0 {
                continue;
            }
            let rss = read_rss_bytes(info.pid);
            info.memory_bytes = rss;
            if info.config.max_memory_restart > 0 && rss > info.config.max_memory_restart {
                warn!(
                    id,
                    name = %info.name,
                    rss,
                    limit = info.config.max_memory_restart,
                    "decision=restart reason=memory"
                );
                over_limit.push(id);
            }
        }
        for id in over_limit {
            if let Err(e) = self.do_restart(id, collector, events, now_ms) {
                warn!(id, "memory restart failed: {e}");
            }
        }
    }

    /// Restart running processes whose watcher reports a debounced change.
    pub fn check_watchers(
        &mut self,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        let mut fired: Vec<u32> = Vec::new();
        for (&id, watcher) in self.watchers.iter_mut() {
            if watcher.check_for_changes(now_ms) {
                fired.push(id);
            }
        }
        for id in fired {
            let running = self
                .processes
                .get(&id)
                .map(|i| i.status == ProcessStatus::Running)
                .unwrap_or(false);
            if running {
                info!(id, "decision=restart reason=watch");
                if let Err(e) = self.do_restart(id, collector, events, now_ms) {
                    warn!(id, "watch restart failed: {e}");
                }
            }
        }
    }

    /// Scan cron expressions at most once per wall-clock minute.
    pub fn check_cron_restarts(
        &mut self,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) {
        use chrono::{Datelike, Timelike};
        let local = chrono::Local::now();
        let minute_of_day = (local.hour() * 60 + local.minute()) as i64;
        if minute_of_day == self.last_cron_minute {
            return;
        }
        self.last_cron_minute = minute_of_day;

        let minute = local.minute();
        let hour = local.hour();
        let day = local.day();
        let month = local.month();
        let weekday = local.weekday().num_days_from_sunday();

        let due: Vec<u32> = self
            .cron_jobs
            .iter()
            .filter(|(_, expr)| expr.matches(minute, hour, day, month, weekday))
            .map(|(&id, _)| id)
            .collect();
        for id in due {
            let running = self
                .processes
                .get(&id)
                .map(|i| i.status == ProcessStatus::Running)
                .unwrap_or(false);
            if running {
                info!(id, "decision=restart reason=cron");
                if let Err(e) = self.do_restart(id, collector, events, now_ms) {
                    warn!(id, "cron restart failed: {e}");
                }
            }
        }
    }

    /// Promote `starting` processes that sent a readiness message, or whose
    /// listen timeout elapsed (timeout is implicit readiness).
    pub fn check_wait_ready(&mut self, now_ms: u64) {
        let starting: Vec<u32> = self
            .processes
            .iter()
            .filter(|(_, i)| i.status == ProcessStatus::Starting)
            .map(|(&id, _)| id)
            .collect();
        for id in starting {
            let mut ready = false;
            if let Some(ch) = self.channels.get(&id) {
                // Drain everything pending; one message is enough.
                while let Ok(Some(_)) = ch.try_read() {
                    ready = true;
                }
            }
            let info = self.processes.get_mut(&id).expect("id collected above");
            if ready {
                info!(id, name = %info.name, "decision=ready reason=message");
                info.status = ProcessStatus::Running;
            } else if now_ms.saturating_sub(info.start_time_ms)
                >= info.config.listen_timeout_ms as u64
            {
                info!(id, name = %info.name, "decision=ready reason=listen_timeout");
                info.status = ProcessStatus::Running;
            }
        }
    }

    // -----------------------------------------------------------
    // Delete / scale / shutdown
    // -----------------------------------------------------------

    /// Remove a process entirely: best-effort SIGKILL if live, then every
    /// index and the collector registration.
    pub fn delete_process(
        &mut self,
        id: u32,
        collector: &mut LogCollector,
        events: &mut EventLoop,
    ) -> Result<(), VelosError> {
        let info = self
            .processes
            .remove(&id)
            .ok_or(VelosError::ProcessNotFound(id))?;
        if info.status.is_alive() && info.pid > 0 {
            let _ = kill(Pid::from_raw(info.pid), Signal::SIGKILL);
        }
        if info.pid > 0 {
            self.pid_index.remove(&info.pid);
        }
        self.pending_kills.remove(&id);
        self.pending_restarts.remove(&id);
        self.watchers.remove(&id);
        self.cron_jobs.remove(&id);
        self.channels.remove(&id);
        collector.remove_process(id, events);
        info!(id, name = %info.name, "decision=delete");
        Ok(())
    }

    /// Scale a named cluster to `target` live instances. Returns
    /// (started, stopped).
    pub fn scale_cluster(
        &mut self,
        base: &str,
        target: u32,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        now_ms: u64,
    ) -> Result<(u32, u32), VelosError> {
        let mut matches: Vec<u32> = self
            .processes
            .values()
            .filter(|i| matches_cluster(&i.name, base))
            .map(|i| i.id)
            .collect();
        matches.sort_by_key(|id| {
            self.processes
                .get(id)
                .map(|i| (i.config.instance_id, i.id))
                .unwrap_or((u32::MAX, *id))
        });
        if matches.is_empty() {
            return Err(VelosError::ProcessNotFound(0));
        }

        let live: Vec<u32> = matches
            .iter()
            .copied()
            .filter(|id| {
                self.processes
                    .get(id)
                    .map(|i| i.status.is_alive())
                    .unwrap_or(false)
            })
            .collect();
        let current = live.len() as u32;
        let template = self
            .processes
            .get(&matches[0])
            .expect("matches are table keys")
            .config
            .clone();

        let mut started = 0u32;
        let mut stopped = 0u32;

        if target > current {
            // A fork-mode survivor adopts the `base:0` cluster form first.
            if live.len() == 1 {
                let id = live[0];
                let info = self.processes.get_mut(&id).expect("live id");
                if info.name == base {
                    let new_name = format!("{base}:0");
                    info!(id, from = %info.name, to = %new_name, "decision=adopt_cluster_name");
                    info.name = new_name.clone();
                    info.config.name = new_name.clone();
                    info.config.instance_id = 0;
                    collector.rename_process(id, &new_name);
                }
            }
            let next_instance = matches
                .iter()
                .filter_map(|id| self.processes.get(id))
                .map(|i| i.config.instance_id)
                .max()
                .map(|m| m + 1)
                .unwrap_or(0);

            for k in 0..(target - current) {
                let mut cfg = template.clone();
                cfg.instance_id = next_instance + k;
                cfg.name = format!("{base}:{}", cfg.instance_id);
                cfg.instances = target;
                self.start_process(cfg, collector, now_ms)?;
                started += 1;
            }
        } else if target < current {
            // Stop from the highest instance id down.
            let mut by_instance: Vec<u32> = live.clone();
            by_instance.sort_by_key(|id| {
                std::cmp::Reverse(
                    self.processes
                        .get(id)
                        .map(|i| i.config.instance_id)
                        .unwrap_or(0),
                )
            });
            for id in by_instance.into_iter().take((current - target) as usize) {
                self.stop_process(
                    id,
                    Some(libc::SIGTERM),
                    Some(SCALE_DOWN_KILL_TIMEOUT_MS),
                    now_ms,
                )?;
                stopped += 1;
            }
        }

        // Scaling up teaches every match the new size; scaling down only the
        // survivors, so a stopped husk keeps a self-consistent
        // (instance_id, instances) pair.
        for id in &matches {
            if let Some(info) = self.processes.get_mut(id) {
                if target >= current || info.status.is_alive() {
                    info.config.instances = target;
                }
            }
        }
        info!(name = base, target, started, stopped, "decision=scale");
        Ok((started, stopped))
    }

    /// SIGTERM every live process and mark it stopped. Does not wait; the
    /// daemon loop exits right after.
    pub fn stop_all(&mut self) {
        for info in self.processes.values_mut() {
            if info.status.is_alive() && info.pid > 0 {
                let _ = kill(Pid::from_raw(info.pid), Signal::SIGTERM);
                info.status = ProcessStatus::Stopped;
            }
        }
    }

    // -----------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------

    pub fn info(&self, id: u32) -> Option<&ProcessInfo> {
        self.processes.get(&id)
    }

    /// Process records ordered by id.
    pub fn list(&self) -> Vec<&ProcessInfo> {
        let mut out: Vec<&ProcessInfo> = self.processes.values().collect();
        out.sort_by_key(|i| i.id);
        out
    }

    /// Owned config snapshots ordered by id (persistence input).
    pub fn configs(&self) -> Vec<ProcessConfig> {
        self.list().into_iter().map(|i| i.config.clone()).collect()
    }

    pub fn drain_pending_pipe_fds(&mut self) -> Vec<RawFd> {
        self.pending_pipe_fds.drain(..).collect()
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

enum RestartDecision {
    None,
    CrashLoop,
    Delayed(u64),
    Immediate,
}

/// Delay before the next automatic respawn. Exponential backoff doubles a
/// 100 ms-default base per consecutive crash, shift-capped and clamped to
/// 15 s.
pub(crate) fn compute_restart_delay(config: &ProcessConfig, consecutive_crashes: u32) -> u64 {
    if config.exp_backoff {
        let base = if config.restart_delay_ms == 0 {
            BACKOFF_BASE_DEFAULT_MS
        } else {
            config.restart_delay_ms as u64
        };
        let exp = consecutive_crashes.saturating_sub(1).min(BACKOFF_MAX_SHIFT);
        (base << exp).min(BACKOFF_CAP_MS)
    } else {
        config.restart_delay_ms as u64
    }
}

/// `web` matches itself and `web:0`, `web:12`, ... but not `webapp`.
pub(crate) fn matches_cluster(name: &str, base: &str) -> bool {
    if name == base {
        return true;
    }
    match name.strip_prefix(base).and_then(|r| r.strip_prefix(':')) {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

// ---------------------------------------------------------------
// fork/exec plumbing
// ---------------------------------------------------------------

struct SpawnedChild {
    pid: i32,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    channel: Option<IpcChannel>,
}

/// Fork and exec one child. Everything the child touches after fork is
/// prepared up front so the child only makes async-signal-safe calls before
/// exec; any failure in the child exits 127 and surfaces through the reap
/// path as an abnormal exit.
fn spawn_child(config: &ProcessConfig) -> Result<SpawnedChild, VelosError> {
    let argv = interpreter_argv(config);
    let argv_c: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .map_err(|_| VelosError::Protocol("nul byte in argv".into()))?;
    let mut argv_ptrs: Vec<*const libc::c_char> = argv_c.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    let cwd_c = if config.cwd.is_empty() {
        None
    } else {
        Some(
            CString::new(config.cwd.as_str())
                .map_err(|_| VelosError::Protocol("nul byte in cwd".into()))?,
        )
    };

    let (out_r, out_w) = pipe_raw()?;
    let (err_r, err_w) = match pipe_raw() {
        Ok(p) => p,
        Err(e) => {
            fd::close(out_r);
            fd::close(out_w);
            return Err(e);
        }
    };
    // Read ends stay with the daemon and must not leak into later spawns.
    fd::set_cloexec(out_r).map_err(VelosError::Io)?;
    fd::set_cloexec(err_r).map_err(VelosError::Io)?;

    let mut channel = if config.needs_channel() {
        Some(IpcChannel::new().map_err(VelosError::Io)?)
    } else {
        None
    };

    let mut env_sets: Vec<(CString, CString)> = Vec::new();
    if let Some(ch) = &channel {
        env_sets.push((
            CString::new(IPC_FD_ENV).expect("static name"),
            CString::new(ch.child_fd().to_string()).expect("decimal fd"),
        ));
    }
    if config.instances > 1 {
        let val = CString::new(config.instance_id.to_string()).expect("decimal id");
        env_sets.push((CString::new(INSTANCE_ID_ENV).expect("static name"), val.clone()));
        env_sets.push((CString::new(NODE_INSTANCE_ENV).expect("static name"), val));
    }

    // SAFETY: single-threaded daemon; the child performs only
    // async-signal-safe libc calls on pre-allocated data before exec.
    match unsafe { fork() } {
        Ok(ForkResult::Child) => unsafe {
            libc::close(out_r);
            libc::close(err_r);
            if libc::dup2(out_w, libc::STDOUT_FILENO) < 0
                || libc::dup2(err_w, libc::STDERR_FILENO) < 0
            {
                libc::_exit(127);
            }
            libc::close(out_w);
            libc::close(err_w);
            for (k, v) in &env_sets {
                libc::setenv(k.as_ptr(), v.as_ptr(), 1);
            }
            if let Some(cwd) = &cwd_c {
                if libc::chdir(cwd.as_ptr()) < 0 {
                    libc::_exit(127);
                }
            }
            libc::setsid();
            libc::execvp(argv_ptrs[0], argv_ptrs.as_ptr());
            libc::_exit(127)
        },
        Ok(ForkResult::Parent { child }) => {
            fd::close(out_w);
            fd::close(err_w);
            fd::set_nonblocking(out_r).map_err(VelosError::Io)?;
            fd::set_nonblocking(err_r).map_err(VelosError::Io)?;
            if let Some(ch) = channel.as_mut() {
                ch.close_child_end();
            }
            Ok(SpawnedChild {
                pid: child.as_raw(),
                stdout_fd: out_r,
                stderr_fd: err_r,
                channel,
            })
        }
        Err(e) => {
            for f in [out_r, out_w, err_r, err_w] {
                fd::close(f);
            }
            Err(VelosError::Io(io::Error::from(e)))
        }
    }
}

fn pipe_raw() -> Result<(RawFd, RawFd), VelosError> {
    let (r, w) = nix::unistd::pipe().map_err(|e| VelosError::Io(io::Error::from(e)))?;
    Ok((r.into_raw_fd(), w.into_raw_fd()))
}

/// Build the exec argv: explicit interpreter wins, then shebang detection,
/// then a closed extension mapping, then the script itself.
pub(crate) fn interpreter_argv(config: &ProcessConfig) -> Vec<String> {
    if !config.interpreter.is_empty() {
        return vec![config.interpreter.clone(), config.script.clone()];
    }
    if let Some(interp) = shebang_interpreter(Path::new(&config.script)) {
        return vec![interp, config.script.clone()];
    }
    let script = config.script.as_str();
    let ext = Path::new(script)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    match ext {
        "py" => vec!["python3".into(), script.into()],
        "js" | "mjs" | "cjs" => vec!["node".into(), script.into()],
        "ts" | "tsx" => vec!["npx".into(), "tsx".into(), script.into()],
        "rb" => vec!["ruby".into(), script.into()],
        "sh" => vec!["/bin/sh".into(), script.into()],
        _ => vec![script.into()],
    }
}

/// First 256 bytes of the script decide: `#!/usr/bin/env NAME` yields NAME,
/// a direct `#!/path` yields the path.
fn shebang_interpreter(script: &Path) -> Option<String> {
    let raw = fs::read(script).ok()?;
    let head = &raw[..raw.len().min(SHEBANG_PROBE_BYTES)];
    if !head.starts_with(b"#!") {
        return None;
    }
    let line_end = head.iter().position(|&b| b == b'\n').unwrap_or(head.len());
    let line = std::str::from_utf8(&head[2..line_end]).ok()?;
    let mut tokens = line.split_whitespace();
    let first = tokens.next()?;
    if first.ends_with("/env") {
        tokens.next().map(str::to_string)
    } else {
        Some(first.to_string())
    }
}

/// Resident-set bytes for a live pid; 0 when unreadable.
#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: i32) -> u64 {
    let raw = match fs::read_to_string(format!("/proc/{pid}/statm")) {
        Ok(s) => s,
        Err(_) => return 0,
    };
    let pages: u64 = match raw.split_whitespace().nth(1).and_then(|f| f.parse().ok()) {
        Some(p) => p,
        None => return 0,
    };
    // SAFETY: sysconf is always safe to call.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    pages * page_size.max(0) as u64
}

#[cfg(target_os = "macos")]
fn read_rss_bytes(pid: i32) -> u64 {
    let mut usage: libc::rusage_info_v2 = unsafe { std::mem::zeroed() };
    // SAFETY: usage is a valid rusage_info_v2 out-buffer.
    let r = unsafe {
        libc::proc_pid_rusage(
            pid,
            libc::RUSAGE_INFO_V2,
            &mut usage as *mut libc::rusage_info_v2 as *mut libc::rusage_info_t,
        )
    };
    if r == 0 {
        usage.ri_resident_size
    } else {
        0
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_rss_bytes(_pid: i32) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::now_ms;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    // Reaping uses waitpid(-1) and signal routing is process-global:
    // serialize the tests that fork or build an event loop.
    fn fork_guard() -> std::sync::MutexGuard<'static, ()> {
        crate::test_support::env_lock()
    }

    fn write_script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        write!(f, "{body}").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn harness() -> (Supervisor, LogCollector, EventLoop, TempDir) {
        let dir = TempDir::new().unwrap();
        let collector = LogCollector::new(dir.path());
        (Supervisor::new(), collector, EventLoop::new().unwrap(), dir)
    }

    fn sh_config(name: &str, script: String) -> ProcessConfig {
        ProcessConfig {
            name: name.into(),
            script,
            interpreter: "/bin/sh".into(),
            ..ProcessConfig::default()
        }
    }

    /// Pump reaps until the process leaves `running`, or the deadline hits.
    fn wait_not_running(
        sup: &mut Supervisor,
        collector: &mut LogCollector,
        events: &mut EventLoop,
        id: u32,
        max_ms: u64,
    ) {
        let deadline = now_ms() + max_ms;
        while now_ms() < deadline {
            sup.handle_sigchld(collector, events, now_ms());
            if sup.info(id).map(|i| i.status != ProcessStatus::Running).unwrap_or(true) {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
    }

    #[test]
    fn explicit_interpreter_wins() {
        let cfg = ProcessConfig {
            script: "app.py".into(),
            interpreter: "pypy".into(),
            ..ProcessConfig::default()
        };
        assert_eq!(interpreter_argv(&cfg), vec!["pypy", "app.py"]);
    }

    #[test]
    fn extension_mapping() {
        let by_ext = |script: &str| {
            interpreter_argv(&ProcessConfig { script: script.into(), ..ProcessConfig::default() })
        };
        assert_eq!(by_ext("/x/app.py"), vec!["python3", "/x/app.py"]);
        assert_eq!(by_ext("/x/app.js"), vec!["node", "/x/app.js"]);
        assert_eq!(by_ext("/x/app.mjs"), vec!["node", "/x/app.mjs"]);
        assert_eq!(by_ext("/x/app.ts"), vec!["npx", "tsx", "/x/app.ts"]);
        assert_eq!(by_ext("/x/app.rb"), vec!["ruby", "/x/app.rb"]);
        assert_eq!(by_ext("/x/app.sh"), vec!["/bin/sh", "/x/app.sh"]);
        assert_eq!(by_ext("/x/app"), vec!["/x/app"]);
    }

    #[test]
    fn shebang_detection() {
        let dir = TempDir::new().unwrap();
        let env_script = write_script(&dir, "env-style", "#!/usr/bin/env python3\nprint(1)\n");
        let cfg = ProcessConfig { script: env_script.clone(), ..ProcessConfig::default() };
        assert_eq!(interpreter_argv(&cfg), vec!["python3".to_string(), env_script]);

        let direct = write_script(&dir, "direct-style", "#!/bin/bash\necho hi\n");
        let cfg = ProcessConfig { script: direct.clone(), ..ProcessConfig::default() };
        assert_eq!(interpreter_argv(&cfg), vec!["/bin/bash".to_string(), direct]);
    }

    #[test]
    fn backoff_delay_progression() {
        let plain = ProcessConfig { restart_delay_ms: 250, ..ProcessConfig::default() };
        assert_eq!(compute_restart_delay(&plain, 1), 250);
        assert_eq!(compute_restart_delay(&plain, 9), 250);

        let backoff = ProcessConfig {
            restart_delay_ms: 0,
            exp_backoff: true,
            ..ProcessConfig::default()
        };
        assert_eq!(compute_restart_delay(&backoff, 0), 100);
        assert_eq!(compute_restart_delay(&backoff, 1), 100);
        assert_eq!(compute_restart_delay(&backoff, 2), 200);
        assert_eq!(compute_restart_delay(&backoff, 5), 1600);
        // Clamped at 15 s well before the shift cap.
        assert_eq!(compute_restart_delay(&backoff, 12), 15_000);
        assert_eq!(compute_restart_delay(&backoff, 40), 15_000);
    }

    #[test]
    fn cluster_name_matching() {
        assert!(matches_cluster("web", "web"));
        assert!(matches_cluster("web:0", "web"));
        assert!(matches_cluster("web:17", "web"));
        assert!(!matches_cluster("webapp", "web"));
        assert!(!matches_cluster("web:", "web"));
        assert!(!matches_cluster("web:x", "web"));
        assert!(!matches_cluster("other", "web"));
    }

    #[test]
    fn spawn_and_reap_clean_exit() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "ok.sh", "exit 0\n");
        let id = sup
            .start_process(sh_config("ok", script), &mut collector, now_ms())
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Running);
        assert!(sup.info(id).unwrap().pid > 0);
        assert_eq!(sup.drain_pending_pipe_fds().len(), 2);

        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Stopped);
    }

    #[test]
    fn abnormal_exit_becomes_errored() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "fail.sh", "exit 3\n");
        let id = sup
            .start_process(sh_config("fail", script), &mut collector, now_ms())
            .unwrap();
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Errored);
    }

    #[test]
    fn crash_loop_halts_at_max_restarts() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "crash.sh", "exit 1\n");
        let mut cfg = sh_config("crash", script);
        cfg.autorestart = true;
        cfg.max_restarts = 2;
        cfg.min_uptime_ms = 60_000; // every exit counts as a crash
        cfg.restart_delay_ms = 0;
        let id = sup.start_process(cfg, &mut collector, now_ms()).unwrap();

        let deadline = now_ms() + 10_000;
        while now_ms() < deadline {
            sup.handle_sigchld(&mut collector, &mut events, now_ms());
            if sup.info(id).unwrap().status == ProcessStatus::Errored {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        let info = sup.info(id).unwrap();
        assert_eq!(info.status, ProcessStatus::Errored);
        assert_eq!(info.consecutive_crashes, 2);
        // One respawn happened before the cutoff (crash #2 halts).
        assert_eq!(info.restart_count, 1);
    }

    #[test]
    fn stop_records_pending_kill_and_escalates() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        // Trap TERM so only SIGKILL can end it.
        let script = write_script(&dir, "stubborn.sh", "trap '' TERM\nsleep 60\n");
        let id = sup
            .start_process(sh_config("stubborn", script), &mut collector, now_ms())
            .unwrap();
        let t0 = now_ms();
        sup.stop_process(id, Some(libc::SIGTERM), Some(200), t0).unwrap();
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Stopped);

        // Before the deadline nothing escalates.
        sup.check_pending_kills(t0 + 50);
        // At the deadline the SIGKILL goes out and the child dies.
        std::thread::sleep(std::time::Duration::from_millis(250));
        sup.check_pending_kills(now_ms());
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Stopped);
    }

    #[test]
    fn stop_of_non_running_is_noop() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "ok.sh", "exit 0\n");
        let id = sup
            .start_process(sh_config("ok", script), &mut collector, now_ms())
            .unwrap();
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
        assert!(sup.stop_process(id, None, None, now_ms()).is_ok());
        assert!(matches!(
            sup.stop_process(99, None, None, now_ms()),
            Err(VelosError::ProcessNotFound(99))
        ));
    }

    #[test]
    fn restart_keeps_id_and_bumps_counter() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "sleep.sh", "sleep 60\n");
        let id = sup
            .start_process(sh_config("sleeper", script), &mut collector, now_ms())
            .unwrap();
        let old_pid = sup.info(id).unwrap().pid;
        sup.drain_pending_pipe_fds();

        sup.restart_process(id, &mut collector, &mut events, now_ms()).unwrap();
        let info = sup.info(id).unwrap();
        assert_eq!(info.id, id);
        assert_ne!(info.pid, old_pid);
        assert_eq!(info.restart_count, 1);
        assert_eq!(info.status, ProcessStatus::Running);
        assert_eq!(sup.drain_pending_pipe_fds().len(), 2);

        // Clean up the replacement child.
        sup.stop_process(id, Some(libc::SIGKILL), None, now_ms()).unwrap();
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
    }

    #[test]
    fn delete_removes_every_trace() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "sleep.sh", "sleep 60\n");
        let mut cfg = sh_config("doomed", script);
        cfg.cron_restart = "* * * * *".into();
        let id = sup.start_process(cfg, &mut collector, now_ms()).unwrap();
        assert_eq!(sup.process_count(), 1);

        sup.delete_process(id, &mut collector, &mut events).unwrap();
        assert_eq!(sup.process_count(), 0);
        assert!(sup.info(id).is_none());
        assert!(matches!(
            sup.delete_process(id, &mut collector, &mut events),
            Err(VelosError::ProcessNotFound(_))
        ));
        // Reap the killed child so the test process leaves no zombie.
        sup.handle_sigchld(&mut collector, &mut events, now_ms());
    }

    #[test]
    fn ids_are_never_reused() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "ok.sh", "exit 0\n");
        let a = sup
            .start_process(sh_config("a", script.clone()), &mut collector, now_ms())
            .unwrap();
        sup.delete_process(a, &mut collector, &mut events).unwrap();
        let b = sup
            .start_process(sh_config("b", script), &mut collector, now_ms())
            .unwrap();
        assert!(b > a);
        wait_not_running(&mut sup, &mut collector, &mut events, b, 5000);
    }

    #[test]
    fn scale_up_renames_fork_mode_survivor() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "sleep.sh", "sleep 60\n");
        let id = sup
            .start_process(sh_config("web", script), &mut collector, now_ms())
            .unwrap();

        let (started, stopped) = sup
            .scale_cluster("web", 3, &mut collector, &mut events, now_ms())
            .unwrap();
        assert_eq!((started, stopped), (2, 0));
        let names: Vec<String> = sup.list().iter().map(|i| i.name.clone()).collect();
        assert_eq!(names, vec!["web:0", "web:1", "web:2"]);
        assert!(sup.list().iter().all(|i| i.config.instances == 3));
        assert_eq!(sup.info(id).unwrap().config.instance_id, 0);

        // Scaling to the same target is a no-op.
        let (s2, p2) = sup
            .scale_cluster("web", 3, &mut collector, &mut events, now_ms())
            .unwrap();
        assert_eq!((s2, p2), (0, 0));

        // Scale down stops the highest instance ids.
        let (s3, p3) = sup
            .scale_cluster("web", 1, &mut collector, &mut events, now_ms())
            .unwrap();
        assert_eq!((s3, p3), (0, 2));
        let live: Vec<&ProcessInfo> = sup
            .list()
            .into_iter()
            .filter(|i| i.status.is_alive())
            .collect();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].name, "web:0");

        let ids: Vec<u32> = sup.list().iter().map(|i| i.id).collect();
        for id in ids {
            let _ = sup.stop_process(id, Some(libc::SIGKILL), None, now_ms());
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        sup.handle_sigchld(&mut collector, &mut events, now_ms());
    }

    #[test]
    fn scale_unknown_name_errors() {
        let (mut sup, mut collector, mut events, _dir) = harness();
        assert!(sup
            .scale_cluster("ghost", 2, &mut collector, &mut events, now_ms())
            .is_err());
    }

    #[test]
    fn wait_ready_promotes_on_timeout() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "sleep.sh", "sleep 60\n");
        let mut cfg = sh_config("slowboot", script);
        cfg.wait_ready = true;
        cfg.listen_timeout_ms = 100;
        let t0 = now_ms();
        let id = sup.start_process(cfg, &mut collector, t0).unwrap();
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Starting);

        sup.check_wait_ready(t0 + 50);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Starting);
        sup.check_wait_ready(t0 + 150);
        assert_eq!(sup.info(id).unwrap().status, ProcessStatus::Running);

        sup.stop_process(id, Some(libc::SIGKILL), None, now_ms()).unwrap();
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
    }

    #[test]
    fn pending_restart_fires_on_schedule() {
        let _g = fork_guard();
        let (mut sup, mut collector, mut events, dir) = harness();
        let script = write_script(&dir, "crash.sh", "exit 1\n");
        let mut cfg = sh_config("delayed", script);
        cfg.autorestart = true;
        cfg.max_restarts = -1;
        cfg.min_uptime_ms = 60_000;
        cfg.restart_delay_ms = 150;
        let id = sup.start_process(cfg, &mut collector, now_ms()).unwrap();

        // Reap the crash; a delayed restart gets scheduled.
        let deadline = now_ms() + 5000;
        while now_ms() < deadline && sup.pending_restarts.is_empty() {
            sup.handle_sigchld(&mut collector, &mut events, now_ms());
            std::thread::sleep(std::time::Duration::from_millis(30));
        }
        assert!(sup.pending_restarts.contains_key(&id));

        // Not due yet.
        let scheduled = *sup.pending_restarts.get(&id).unwrap();
        sup.check_pending_restarts(&mut collector, &mut events, scheduled - 50);
        assert!(sup.pending_restarts.contains_key(&id));
        // Due: the process respawns under the same id.
        sup.check_pending_restarts(&mut collector, &mut events, scheduled);
        assert!(sup.pending_restarts.is_empty());
        assert_eq!(sup.info(id).unwrap().restart_count, 1);

        // Let the respawned crasher die and settle before teardown.
        wait_not_running(&mut sup, &mut collector, &mut events, id, 5000);
        sup.delete_process(id, &mut collector, &mut events).unwrap();
        sup.handle_sigchld(&mut collector, &mut events, now_ms());
    }
}
