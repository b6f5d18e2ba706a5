//! Daemon loop: wires the event layer, supervisor, log collector, IPC
//! server, and persistence together and ticks the periodic duties.
//!
//! Single-threaded and cooperative: the only suspension point is the timed
//! poll. Signal events drive reaping and shutdown; everything else is
//! non-blocking fd work plus per-tick scans.

use std::path::Path;

use anyhow::Context as _;
use tracing::{info, warn};

use crate::event::{Event, EventLoop, FdKind};
use crate::log_collector::LogCollector;
use crate::process::now_ms;
use crate::server::IpcServer;
use crate::state::Persistence;
use crate::supervisor::Supervisor;

const POLL_TIMEOUT_MS: i32 = 1000;

pub struct Daemon {
    persistence: Persistence,
    events: EventLoop,
    collector: LogCollector,
    supervisor: Supervisor,
    server: IpcServer,
    running: bool,
}

impl Daemon {
    /// Build the full daemon: directories, pid file, sockets, signals.
    pub fn new(state_dir: &Path, socket_override: Option<&Path>) -> anyhow::Result<Self> {
        let persistence = Persistence::new(state_dir)
            .with_context(|| format!("init state dir {}", state_dir.display()))?;
        persistence.write_pid_file().context("write pid file")?;

        let socket_path = socket_override
            .map(Path::to_path_buf)
            .unwrap_or_else(|| persistence.socket_path());

        let mut events = EventLoop::new().context("create event loop")?;
        let collector = LogCollector::new(&persistence.log_dir());
        let supervisor = Supervisor::new();
        let server = IpcServer::new(&socket_path, &mut events)
            .with_context(|| format!("bind control socket {}", socket_path.display()))?;

        // A client that vanished mid-response must not take the daemon down.
        // SAFETY: replacing the SIGPIPE disposition with ignore.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }
        events.add_signal(libc::SIGCHLD).context("register SIGCHLD")?;
        events.add_signal(libc::SIGTERM).context("register SIGTERM")?;
        events.add_signal(libc::SIGINT).context("register SIGINT")?;

        info!(state_dir = %state_dir.display(), "daemon initialized");
        Ok(Self {
            persistence,
            events,
            collector,
            supervisor,
            server,
            running: false,
        })
    }

    /// Run until SIGTERM/SIGINT or an IPC shutdown, then tear down.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.running = true;
        let mut ready: Vec<Event> = Vec::new();

        while self.running {
            match self.events.poll(&mut ready, Some(POLL_TIMEOUT_MS)) {
                Ok(_) => {}
                Err(e) => {
                    // Fatal for this iteration only; retry next tick.
                    warn!("poll failed: {e}");
                    continue;
                }
            }

            let batch = std::mem::take(&mut ready);
            // Pipe work first: reaps and commands later in the batch can
            // close pipes and respawn, and a recycled fd number must not be
            // clobbered by a stale event from the same poll.
            for ev in &batch {
                if matches!(ev.kind, FdKind::PipeRead | FdKind::PipeHup) {
                    self.handle_event(ev);
                }
            }
            for ev in &batch {
                if !matches!(ev.kind, FdKind::PipeRead | FdKind::PipeHup) {
                    self.handle_event(ev);
                }
            }
            ready = batch;

            self.tick_periodic();
        }

        self.teardown();
        Ok(())
    }

    fn handle_event(&mut self, ev: &Event) {
        match ev.kind {
            FdKind::IpcAccept => self.server.handle_accept(&mut self.events),
            FdKind::IpcRead => self.server.handle_readable(
                ev.fd,
                &mut self.supervisor,
                &mut self.collector,
                &self.persistence,
                &mut self.events,
            ),
            FdKind::IpcClientHup => {
                // Serve anything already buffered, then drop the client.
                if self.server.is_client(ev.fd) {
                    self.server.handle_readable(
                        ev.fd,
                        &mut self.supervisor,
                        &mut self.collector,
                        &self.persistence,
                        &mut self.events,
                    );
                }
                if self.server.is_client(ev.fd) {
                    self.server.handle_hup(ev.fd, &mut self.events);
                }
            }
            FdKind::IpcWrite => self.server.handle_writable(ev.fd, &mut self.events),
            FdKind::PipeRead => self.collector.handle_pipe_data(ev.fd),
            FdKind::PipeHup => {
                // Final drain before the fd is deregistered and closed.
                self.collector.handle_pipe_data(ev.fd);
                self.collector.close_pipe(ev.fd, &mut self.events);
            }
            FdKind::Signal => match ev.signal {
                libc::SIGCHLD => self.supervisor.handle_sigchld(
                    &mut self.collector,
                    &mut self.events,
                    now_ms(),
                ),
                libc::SIGTERM | libc::SIGINT => {
                    info!(signal = ev.signal, "shutdown signal");
                    self.running = false;
                }
                other => warn!(signal = other, "unexpected signal event"),
            },
            FdKind::Timer => {}
        }
    }

    fn tick_periodic(&mut self) {
        let now = now_ms();
        self.supervisor.check_pending_kills(now);
        self.supervisor
            .check_pending_restarts(&mut self.collector, &mut self.events, now);
        self.register_pending_pipes();
        self.supervisor
            .update_resource_usage(&mut self.collector, &mut self.events, now);
        self.supervisor
            .check_watchers(&mut self.collector, &mut self.events, now);
        self.supervisor
            .check_cron_restarts(&mut self.collector, &mut self.events, now);
        self.supervisor.check_wait_ready(now);
        // Scaling, watch, and cron work may have spawned fresh pipes.
        self.register_pending_pipes();

        if self.server.shutdown_requested {
            self.running = false;
        }
    }

    fn register_pending_pipes(&mut self) {
        for pipe in self.supervisor.drain_pending_pipe_fds() {
            if let Err(e) = self.events.add_fd(pipe, FdKind::PipeRead) {
                warn!(fd = pipe, "pipe registration failed: {e}");
            }
        }
    }

    fn teardown(&mut self) {
        info!("shutting down");
        self.supervisor.stop_all();
        self.server.close(&mut self.events);
        self.collector.shutdown(&mut self.events);
        self.events.close();
        self.persistence.remove_pid_file();
    }
}

/// Entry point used by the CLI: build and run until shutdown.
pub fn run(state_dir: &Path, socket_override: Option<&Path>) -> anyhow::Result<()> {
    let mut daemon = Daemon::new(state_dir, socket_override)?;
    daemon.run()
}
