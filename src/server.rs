//! IPC server: accepts local-socket clients, accumulates framed requests
//! per client, dispatches commands to the supervisor / log collector /
//! persistence, and writes framed responses.
//!
//! Requests on one connection are handled strictly in arrival order; the
//! response is produced and queued before the next frame is parsed. A
//! malformed header or body closes the offending client silently. All
//! client I/O is non-blocking: a response the socket will not accept is
//! parked on the client and flushed on write-readiness events, so a slow
//! client simply does not advance and never stalls the loop.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::VelosError;
use crate::event::{EventLoop, FdKind};
use crate::fd;
use crate::log_collector::LogCollector;
use crate::process::{now_ms, ProcessConfig};
use crate::protocol::{
    self, Command, Request, Response, StartPayload, StopPayload, WireWriter,
};
use crate::state::Persistence;
use crate::supervisor::Supervisor;

const READ_CHUNK: usize = 4096;
/// Ceiling on parked responses per client; a client that never drains past
/// this is dropped.
const MAX_OUTBUF: usize = 8 * 1024 * 1024;

struct ClientState {
    stream: UnixStream,
    /// Accumulated unparsed bytes.
    buf: Vec<u8>,
    /// Encoded responses the socket has not accepted yet.
    out: Vec<u8>,
    /// Write-readiness is armed with the event layer.
    want_write: bool,
}

pub struct IpcServer {
    listener: UnixListener,
    socket_path: PathBuf,
    clients: HashMap<RawFd, ClientState>,
    pub shutdown_requested: bool,
}

impl IpcServer {
    /// Bind the control socket (replacing any stale file), restrict it to
    /// the owning user, and register the listener with the event layer.
    pub fn new(socket_path: &Path, events: &mut EventLoop) -> std::io::Result<Self> {
        if socket_path.exists() {
            let _ = fs::remove_file(socket_path);
        }
        let listener = UnixListener::bind(socket_path)?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o600))?;
        listener.set_nonblocking(true)?;
        fd::set_cloexec(listener.as_raw_fd())?;
        events.add_fd(listener.as_raw_fd(), FdKind::IpcAccept)?;
        info!(path = %socket_path.display(), "listening");
        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            clients: HashMap::new(),
            shutdown_requested: false,
        })
    }

    pub fn listen_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn is_client(&self, ready: RawFd) -> bool {
        self.clients.contains_key(&ready)
    }

    /// Accept every pending connection.
    pub fn handle_accept(&mut self, events: &mut EventLoop) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let cfd = stream.as_raw_fd();
                    let _ = fd::set_cloexec(cfd);
                    if let Err(e) = events.add_fd(cfd, FdKind::IpcRead) {
                        warn!(fd = cfd, "client registration failed: {e}");
                        continue;
                    }
                    debug!(fd = cfd, "client connected");
                    self.clients.insert(
                        cfd,
                        ClientState {
                            stream,
                            buf: Vec::new(),
                            out: Vec::new(),
                            want_write: false,
                        },
                    );
                }
                Err(e) if fd::would_block(&e) => break,
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }

    /// Drain readable bytes from a client and dispatch every complete frame.
    pub fn handle_readable(
        &mut self,
        ready: RawFd,
        supervisor: &mut Supervisor,
        collector: &mut LogCollector,
        persistence: &Persistence,
        events: &mut EventLoop,
    ) {
        let Some(client) = self.clients.get_mut(&ready) else {
            return;
        };

        let mut disconnected = false;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            match (&client.stream).read(&mut chunk) {
                Ok(0) => {
                    disconnected = true;
                    break;
                }
                Ok(n) => client.buf.extend_from_slice(&chunk[..n]),
                Err(e) if fd::would_block(&e) => break,
                Err(e) if fd::interrupted(&e) => continue,
                Err(e) => {
                    debug!(fd = ready, "client read failed: {e}");
                    disconnected = true;
                    break;
                }
            }
        }

        // Parse complete frames; respond to each before the next.
        loop {
            let Some(client) = self.clients.get_mut(&ready) else {
                return;
            };
            if client.buf.len() < protocol::HEADER_SIZE {
                break;
            }
            let payload_len = match protocol::decode_header(&client.buf) {
                Ok(len) => len as usize,
                Err(e) => {
                    debug!(fd = ready, "bad frame header, closing client: {e}");
                    self.drop_client(ready, events);
                    return;
                }
            };
            let frame_len = protocol::HEADER_SIZE + payload_len;
            if client.buf.len() < frame_len {
                break;
            }
            let request = match Request::decode(&client.buf[protocol::HEADER_SIZE..frame_len]) {
                Ok(r) => r,
                Err(e) => {
                    debug!(fd = ready, "bad request body, closing client: {e}");
                    self.drop_client(ready, events);
                    return;
                }
            };
            client.buf.drain(..frame_len);

            let response = self.dispatch(request, supervisor, collector, persistence, events);
            if !self.queue_response(ready, &response.encode(), events) {
                return;
            }
        }

        if disconnected {
            self.drop_client(ready, events);
        }
    }

    /// The socket became writable again: push out the parked tail.
    pub fn handle_writable(&mut self, ready: RawFd, events: &mut EventLoop) {
        self.flush_client(ready, events);
    }

    pub fn handle_hup(&mut self, ready: RawFd, events: &mut EventLoop) {
        debug!(fd = ready, "client disconnected");
        self.drop_client(ready, events);
    }

    /// Append an encoded response to the client's outbound buffer and flush
    /// what the socket accepts. Returns false if the client was dropped.
    fn queue_response(&mut self, ready: RawFd, encoded: &[u8], events: &mut EventLoop) -> bool {
        let Some(client) = self.clients.get_mut(&ready) else {
            return false;
        };
        if client.out.len() + encoded.len() > MAX_OUTBUF {
            debug!(fd = ready, parked = client.out.len(), "client never drains, closing");
            self.drop_client(ready, events);
            return false;
        }
        client.out.extend_from_slice(encoded);
        self.flush_client(ready, events)
    }

    /// Write as much pending output as the socket takes without blocking.
    /// A full socket parks the remainder and arms write-readiness; the tail
    /// goes out on later `handle_writable` calls. Returns false if the
    /// client was dropped.
    fn flush_client(&mut self, ready: RawFd, events: &mut EventLoop) -> bool {
        let Some(client) = self.clients.get_mut(&ready) else {
            return false;
        };
        let mut written = 0;
        let result = loop {
            if written == client.out.len() {
                break Ok(());
            }
            match client.stream.write(&client.out[written..]) {
                Ok(0) => break Err(std::io::Error::from(std::io::ErrorKind::WriteZero)),
                Ok(n) => written += n,
                Err(e) if fd::would_block(&e) => break Ok(()),
                Err(e) if fd::interrupted(&e) => continue,
                Err(e) => break Err(e),
            }
        };
        client.out.drain(..written);

        match result {
            Ok(()) => {
                let parked = !client.out.is_empty();
                if parked && !client.want_write {
                    if events.set_write_interest(ready, true).is_ok() {
                        client.want_write = true;
                        true
                    } else {
                        debug!(fd = ready, "write-interest registration failed, closing");
                        self.drop_client(ready, events);
                        false
                    }
                } else if !parked && client.want_write {
                    let _ = events.set_write_interest(ready, false);
                    client.want_write = false;
                    true
                } else {
                    true
                }
            }
            Err(e) => {
                debug!(fd = ready, "client write failed, closing: {e}");
                self.drop_client(ready, events);
                false
            }
        }
    }

    fn drop_client(&mut self, ready: RawFd, events: &mut EventLoop) {
        events.remove_fd(ready);
        self.clients.remove(&ready);
    }

    /// Tear the server down and remove the socket file.
    pub fn close(&mut self, events: &mut EventLoop) {
        let fds: Vec<RawFd> = self.clients.keys().copied().collect();
        for cfd in fds {
            self.drop_client(cfd, events);
        }
        events.remove_fd(self.listener.as_raw_fd());
        let _ = fs::remove_file(&self.socket_path);
    }

    // -----------------------------------------------------------
    // Command dispatch
    // -----------------------------------------------------------

    fn dispatch(
        &mut self,
        request: Request,
        supervisor: &mut Supervisor,
        collector: &mut LogCollector,
        persistence: &Persistence,
        events: &mut EventLoop,
    ) -> Response {
        let id = request.id;
        let Some(command) = Command::from_u8(request.command) else {
            return Response::err(id, &VelosError::UnknownCommand(request.command).wire_message());
        };

        let result = match command {
            Command::ProcessStart => {
                cmd_start(&request.payload, supervisor, collector, persistence)
            }
            Command::ProcessStop => {
                cmd_stop(&request.payload, supervisor, persistence)
            }
            Command::ProcessRestart => {
                cmd_restart(&request.payload, supervisor, collector, events)
            }
            Command::ProcessDelete => {
                cmd_delete(&request.payload, supervisor, collector, events)
            }
            Command::ProcessList => Ok(encode_list(supervisor)),
            Command::ProcessInfo => cmd_info(&request.payload, supervisor),
            Command::ProcessScale => {
                cmd_scale(&request.payload, supervisor, collector, persistence, events)
            }
            Command::LogRead => cmd_log_read(&request.payload, collector),
            Command::StateSave => {
                persistence
                    .save(&supervisor.configs())
                    .map(|()| b"state saved".to_vec())
                    .map_err(VelosError::Io)
            }
            Command::StateLoad => cmd_state_load(supervisor, collector, persistence),
            Command::Ping => Ok(b"pong".to_vec()),
            Command::Shutdown => {
                info!("shutdown requested over ipc");
                self.shutdown_requested = true;
                Ok(b"shutting down".to_vec())
            }
        };

        match result {
            Ok(payload) => Response::ok(id, payload),
            Err(e) => Response::err(id, &e.wire_message()),
        }
    }
}

fn cmd_start(
    payload: &[u8],
    supervisor: &mut Supervisor,
    collector: &mut LogCollector,
    persistence: &Persistence,
) -> Result<Vec<u8>, VelosError> {
    let p = StartPayload::decode(payload)?;
    let config = config_from_start(&p);
    let first_id = supervisor.start_cluster(config, collector, now_ms())?;
    autosave(supervisor, persistence);
    let mut w = WireWriter::new();
    w.put_u32(first_id);
    Ok(w.into_bytes())
}

fn config_from_start(p: &StartPayload) -> ProcessConfig {
    ProcessConfig {
        name: p.name.clone(),
        script: p.script.clone(),
        cwd: p.cwd.clone(),
        interpreter: p.interpreter.clone(),
        kill_timeout_ms: p.kill_timeout_ms,
        autorestart: p.autorestart,
        max_restarts: p.max_restarts,
        min_uptime_ms: p.min_uptime_ms,
        restart_delay_ms: p.restart_delay_ms,
        exp_backoff: p.exp_backoff,
        max_memory_restart: p.max_memory_restart,
        watch: p.watch,
        watch_delay_ms: p.watch_delay_ms,
        watch_paths: p.watch_paths.clone(),
        watch_ignore: p.watch_ignore.clone(),
        cron_restart: p.cron_restart.clone(),
        wait_ready: p.wait_ready,
        listen_timeout_ms: p.listen_timeout_ms,
        shutdown_with_message: p.shutdown_with_message,
        instances: p.instances.max(1),
        ..ProcessConfig::default()
    }
}

fn cmd_stop(
    payload: &[u8],
    supervisor: &mut Supervisor,
    persistence: &Persistence,
) -> Result<Vec<u8>, VelosError> {
    let p = StopPayload::decode(payload)?;
    let signal = if p.signal == 0 { None } else { Some(p.signal as i32) };
    let timeout = if p.timeout_ms == 0 { None } else { Some(p.timeout_ms) };
    supervisor.stop_process(p.process_id, signal, timeout, now_ms())?;
    autosave(supervisor, persistence);
    Ok(Vec::new())
}

fn cmd_restart(
    payload: &[u8],
    supervisor: &mut Supervisor,
    collector: &mut LogCollector,
    events: &mut EventLoop,
) -> Result<Vec<u8>, VelosError> {
    let mut r = protocol::WireReader::new(payload);
    let target = r.take_u32()?;
    supervisor.restart_process(target, collector, events, now_ms())?;
    Ok(Vec::new())
}

fn cmd_delete(
    payload: &[u8],
    supervisor: &mut Supervisor,
    collector: &mut LogCollector,
    events: &mut EventLoop,
) -> Result<Vec<u8>, VelosError> {
    let mut r = protocol::WireReader::new(payload);
    let target = r.take_u32()?;
    supervisor.delete_process(target, collector, events)?;
    Ok(Vec::new())
}

fn encode_list(supervisor: &Supervisor) -> Vec<u8> {
    let now = now_ms();
    let infos = supervisor.list();
    let mut w = WireWriter::new();
    w.put_u32(infos.len() as u32);
    for info in infos {
        w.put_u32(info.id);
        w.put_str(&info.name);
        w.put_u32(info.pid.max(0) as u32);
        w.put_u8(info.status as u8);
        w.put_u64(info.memory_bytes);
        w.put_u64(info.uptime_ms(now));
        w.put_u32(info.restart_count);
    }
    w.into_bytes()
}

fn cmd_info(payload: &[u8], supervisor: &Supervisor) -> Result<Vec<u8>, VelosError> {
    let mut r = protocol::WireReader::new(payload);
    let target = r.take_u32()?;
    let info = supervisor
        .info(target)
        .ok_or(VelosError::ProcessNotFound(target))?;
    let cfg = &info.config;
    let mut w = WireWriter::new();
    w.put_u32(info.id);
    w.put_str(&info.name);
    w.put_u32(info.pid.max(0) as u32);
    w.put_u8(info.status as u8);
    w.put_u64(info.memory_bytes);
    w.put_u64(info.uptime_ms(now_ms()));
    w.put_u32(info.restart_count);
    w.put_u32(info.consecutive_crashes);
    w.put_u64(info.last_restart_ms);
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
    w.put_str(&cfg.cron_restart);
    w.put_bool(cfg.wait_ready);
    w.put_bool(cfg.shutdown_with_message);
    Ok(w.into_bytes())
}

fn cmd_scale(
    payload: &[u8],
    supervisor: &mut Supervisor,
    collector: &mut LogCollector,
    persistence: &Persistence,
    events: &mut EventLoop,
) -> Result<Vec<u8>, VelosError> {
    let p = protocol::ScalePayload::decode(payload)?;
    let (started, stopped) =
        supervisor.scale_cluster(&p.name, p.target, collector, events, now_ms())?;
    autosave(supervisor, persistence);
    let mut w = WireWriter::new();
    w.put_u32(started);
    w.put_u32(stopped);
    Ok(w.into_bytes())
}

fn cmd_log_read(payload: &[u8], collector: &LogCollector) -> Result<Vec<u8>, VelosError> {
    let p = protocol::LogReadPayload::decode(payload)?;
    let entries = collector.read_last(p.process_id, p.lines as usize)?;
    let mut w = WireWriter::new();
    w.put_u32(entries.len() as u32);
    for e in entries {
        w.put_u64(e.timestamp_ms);
        w.put_u8(e.level);
        w.put_u8(e.stream);
        w.put_bytes(&e.message);
    }
    Ok(w.into_bytes())
}

fn cmd_state_load(
    supervisor: &mut Supervisor,
    collector: &mut LogCollector,
    persistence: &Persistence,
) -> Result<Vec<u8>, VelosError> {
    let configs = persistence.load();
    let mut started = 0u32;
    for cfg in configs {
        // Records are per-instance already; no cluster re-expansion.
        match supervisor.start_process(cfg, collector, now_ms()) {
            Ok(_) => started += 1,
            Err(e) => warn!("resurrect skipped a process: {e}"),
        }
    }
    let mut w = WireWriter::new();
    w.put_u32(started);
    Ok(w.into_bytes())
}

fn autosave(supervisor: &Supervisor, persistence: &Persistence) {
    if let Err(e) = persistence.save(&supervisor.configs()) {
        warn!("autosave failed: {e}");
    }
}
