//! End-to-end scenarios over a live daemon: a real `Daemon` runs its event
//! loop on a background thread with a scratch state directory, and the tests
//! drive it through the control socket like any other client.

use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use velosd::client::Client;
use velosd::daemon::Daemon;
use velosd::protocol::StartPayload;

// Signal plumbing (self-pipe, SIGCHLD routing) is process-global, so only
// one live daemon per test process.
static DAEMON_LOCK: Mutex<()> = Mutex::new(());

struct DaemonHandle {
    state_dir: TempDir,
    socket: PathBuf,
    thread: Option<JoinHandle<()>>,
}

impl DaemonHandle {
    fn start() -> Self {
        let state_dir = TempDir::new().unwrap();
        let socket = state_dir.path().join("velos.sock");
        let mut daemon = Daemon::new(state_dir.path(), None).unwrap();
        let thread = std::thread::spawn(move || {
            let _ = daemon.run();
        });
        let handle = Self { state_dir, socket, thread: Some(thread) };
        // The socket exists before run() starts; wait until ping answers.
        let mut client = handle.client();
        assert_eq!(client.ping().unwrap(), "pong");
        handle
    }

    fn client(&self) -> Client {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match Client::connect(&self.socket) {
                Ok(c) => return c,
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20))
                }
                Err(e) => panic!("daemon socket never came up: {e}"),
            }
        }
    }

    fn write_script(&self, name: &str, body: &str) -> String {
        let path = self.state_dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    fn stop(mut self) {
        if let Ok(mut c) = Client::connect(&self.socket) {
            let _ = c.shutdown();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

fn wait_for<F: FnMut() -> bool>(max: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + max;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn sleeper_payload(name: &str, script: String) -> StartPayload {
    StartPayload {
        name: name.into(),
        script,
        cwd: "/tmp".into(),
        interpreter: "/bin/sh".into(),
        ..StartPayload::default()
    }
}

#[test]
fn ping_exact_wire_bytes() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();

    let mut stream = UnixStream::connect(&daemon.socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // header(magic 56 10, version 01, len 5) + id=1 + command=0x40 (ping)
    let frame: [u8; 12] = [
        0x56, 0x10, 0x01, 0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x40,
    ];
    stream.write_all(&frame).unwrap();

    let mut reply = [0u8; 16];
    stream.read_exact(&mut reply).unwrap();
    // header: magic + version + len=9
    assert_eq!(&reply[..7], &[0x56, 0x10, 0x01, 0x09, 0x00, 0x00, 0x00]);
    // body: id=1, status=0, "pong"
    assert_eq!(&reply[7..12], &[0x01, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(&reply[12..], b"pong");

    daemon.stop();
}

#[test]
fn start_list_stop_delete() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script("sleeper.sh", "sleep 60\n");

    let id = client.start(&sleeper_payload("test", script)).unwrap();
    assert_eq!(id, 1);

    let procs = client.list().unwrap();
    assert_eq!(procs.len(), 1);
    assert_eq!(procs[0].name, "test");
    assert_eq!(procs[0].status, 1); // running
    assert!(procs[0].pid > 0);

    client.stop(id, 15, 5000).unwrap();
    assert!(wait_for(Duration::from_millis(500), || {
        let procs = client.list().unwrap();
        procs[0].status == 0 || procs[0].status == 2
    }));

    client.delete(id).unwrap();
    assert!(client.list().unwrap().is_empty());

    // Commands against the deleted id surface the error name.
    let err = client.stop(id, 15, 1000).unwrap_err();
    assert_eq!(err.wire_message(), "ProcessNotFound");

    daemon.stop();
}

#[test]
fn autorestart_halts_after_crash_loop() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script("crash.sh", "exit 1\n");

    let spec = StartPayload {
        autorestart: true,
        max_restarts: 3,
        min_uptime_ms: 1000,
        restart_delay_ms: 100,
        exp_backoff: false,
        ..sleeper_payload("crashy", script)
    };
    let id = client.start(&spec).unwrap();

    // The loop reaches the cutoff within a couple of restart cycles.
    assert!(wait_for(Duration::from_secs(10), || {
        client.list().unwrap()[0].status == 2
    }));
    let detail = client.info(id).unwrap();
    assert!(detail.restart_count >= 1);
    assert_eq!(detail.consecutive_crashes, 3);

    // No further spawns after the halt.
    let count = client.info(id).unwrap().restart_count;
    std::thread::sleep(Duration::from_millis(700));
    assert_eq!(client.info(id).unwrap().restart_count, count);

    daemon.stop();
}

#[test]
fn cluster_scales_up_and_down() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script("sleeper.sh", "sleep 60\n");

    let spec = StartPayload { instances: 2, ..sleeper_payload("web", script) };
    client.start(&spec).unwrap();

    let names: Vec<String> = client.list().unwrap().iter().map(|p| p.name.clone()).collect();
    assert_eq!(names, vec!["web:0", "web:1"]);
    assert!(client.list().unwrap().iter().all(|p| p.status == 1));

    let (started, stopped) = client.scale("web", 4).unwrap();
    assert_eq!((started, stopped), (2, 0));
    let running: Vec<String> = client
        .list()
        .unwrap()
        .iter()
        .filter(|p| p.status == 1)
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(running, vec!["web:0", "web:1", "web:2", "web:3"]);

    let (started, stopped) = client.scale("web", 2).unwrap();
    assert_eq!((started, stopped), (0, 2));
    assert!(wait_for(Duration::from_secs(5), || {
        let running: Vec<String> = client
            .list()
            .unwrap()
            .iter()
            .filter(|p| p.status == 1 || p.status == 3)
            .map(|p| p.name.clone())
            .collect();
        running == vec!["web:0", "web:1"]
    }));

    // Scaling to the current size is idempotent.
    assert_eq!(client.scale("web", 2).unwrap(), (0, 0));

    daemon.stop();
}

#[test]
fn watch_change_restarts_process() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script("sleeper.sh", "sleep 60\n");
    let watched = daemon.state_dir.path().join("watched");
    std::fs::create_dir(&watched).unwrap();

    let spec = StartPayload {
        watch: true,
        watch_paths: watched.to_string_lossy().to_string(),
        watch_delay_ms: 500,
        ..sleeper_payload("watched-app", script)
    };
    let id = client.start(&spec).unwrap();
    let pid_before = client.list().unwrap()[0].pid;
    assert!(pid_before > 0);

    std::fs::write(watched.join("config.txt"), b"changed").unwrap();

    assert!(wait_for(Duration::from_secs(8), || {
        let p = &client.list().unwrap()[0];
        p.status == 1 && p.pid != pid_before
    }));
    assert!(client.info(id).unwrap().restart_count >= 1);

    daemon.stop();
}

#[test]
fn save_then_restore_reconstructs_configs() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script("sleeper.sh", "sleep 60\n");

    let specs = vec![
        StartPayload {
            kill_timeout_ms: 2500,
            autorestart: true,
            max_restarts: 9,
            exp_backoff: true,
            ..sleeper_payload("alpha", script.clone())
        },
        StartPayload {
            cron_restart: "0 4 * * *".into(),
            min_uptime_ms: 3000,
            ..sleeper_payload("beta", script.clone())
        },
        StartPayload {
            shutdown_with_message: true,
            restart_delay_ms: 450,
            ..sleeper_payload("gamma", script.clone())
        },
    ];
    for spec in &specs {
        client.start(spec).unwrap();
    }
    client.state_save().unwrap();

    for p in client.list().unwrap() {
        client.delete(p.id).unwrap();
    }
    assert!(client.list().unwrap().is_empty());

    assert_eq!(client.state_load().unwrap(), 3);
    let procs = client.list().unwrap();
    assert_eq!(procs.len(), 3);

    for spec in &specs {
        let entry = procs.iter().find(|p| p.name == spec.name).unwrap();
        // Ids are regenerated, never reused.
        assert!(entry.id > 3);
        let detail = client.info(entry.id).unwrap();
        assert_eq!(detail.script, spec.script);
        assert_eq!(detail.cwd, spec.cwd);
        assert_eq!(detail.interpreter, spec.interpreter);
        assert_eq!(detail.kill_timeout_ms, spec.kill_timeout_ms);
        assert_eq!(detail.autorestart, spec.autorestart);
        assert_eq!(detail.max_restarts, spec.max_restarts);
        assert_eq!(detail.min_uptime_ms, spec.min_uptime_ms);
        assert_eq!(detail.restart_delay_ms, spec.restart_delay_ms);
        assert_eq!(detail.exp_backoff, spec.exp_backoff);
        assert_eq!(detail.watch, spec.watch);
        assert_eq!(detail.cron_restart, spec.cron_restart);
        assert_eq!(detail.wait_ready, spec.wait_ready);
        assert_eq!(detail.shutdown_with_message, spec.shutdown_with_message);
    }

    daemon.stop();
}

#[test]
fn log_read_returns_captured_output() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();
    let script = daemon.write_script(
        "talker.sh",
        "echo line-one\necho line-two\necho err-line >&2\nsleep 60\n",
    );

    let id = client.start(&sleeper_payload("talker", script)).unwrap();
    assert!(wait_for(Duration::from_secs(5), || {
        client.log_read(id, 10).map(|e| e.len() >= 3).unwrap_or(false)
    }));

    let entries = client.log_read(id, 10).unwrap();
    let stdout_lines: Vec<&[u8]> = entries
        .iter()
        .filter(|e| e.stream == 0)
        .map(|e| e.message.as_slice())
        .collect();
    assert!(stdout_lines.contains(&b"line-one".as_slice()));
    assert!(stdout_lines.contains(&b"line-two".as_slice()));
    let err_entry = entries.iter().find(|e| e.stream == 1).unwrap();
    assert_eq!(err_entry.message, b"err-line");
    assert_eq!(err_entry.level, 3);

    // The rotated-writer files carry the same lines.
    let out_log = daemon.state_dir.path().join("logs/talker-out.log");
    assert!(wait_for(Duration::from_secs(2), || out_log.exists()));
    let on_disk = std::fs::read_to_string(&out_log).unwrap();
    assert!(on_disk.contains("line-one"));

    let err = client.log_read(9999, 5).unwrap_err();
    assert_eq!(err.wire_message(), "ProcessNotFound");

    daemon.stop();
}

#[test]
fn slow_client_does_not_stall_the_loop() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();

    // 1000 lines of ~650 bytes each: the log_read response is far larger
    // than a unix socket buffer, so a reader that stops reading forces the
    // daemon to park the tail.
    let script = daemon.write_script(
        "flood.sh",
        "pad=xxxxxxxxxx\n\
         pad=$pad$pad$pad$pad\n\
         pad=$pad$pad$pad$pad\n\
         pad=$pad$pad$pad$pad\n\
         i=0\n\
         while [ $i -lt 1000 ]; do\n\
           echo line-$i-$pad\n\
           i=$((i+1))\n\
         done\n\
         sleep 60\n",
    );
    let id = client.start(&sleeper_payload("flood", script)).unwrap();
    assert!(wait_for(Duration::from_secs(15), || {
        client.log_read(id, 1000).map(|e| e.len() == 1000).unwrap_or(false)
    }));

    // A stalled reader: ask for everything, then do not read the socket.
    let mut stalled = UnixStream::connect(&daemon.socket).unwrap();
    stalled
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let req = velosd::protocol::Request {
        id: 1,
        command: velosd::protocol::Command::LogRead as u8,
        payload: velosd::protocol::LogReadPayload { process_id: id, lines: 1000 }.encode(),
    };
    stalled.write_all(&req.encode()).unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // The loop keeps serving other clients while the tail is parked.
    for _ in 0..3 {
        let t0 = Instant::now();
        assert_eq!(client.ping().unwrap(), "pong");
        assert!(
            t0.elapsed() < Duration::from_millis(800),
            "ping stalled behind a slow client"
        );
    }
    assert_eq!(client.list().unwrap().len(), 1);

    // Once the slow client drains its socket, the parked tail arrives
    // intact instead of the connection having been dropped.
    let mut header = [0u8; 7];
    stalled.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    let mut body = vec![0u8; len];
    stalled.read_exact(&mut body).unwrap();
    let resp = velosd::protocol::Response::decode(&body).unwrap();
    assert_eq!(resp.status, velosd::protocol::Status::Ok);
    let entries = velosd::protocol::decode_log_entries(&resp.payload).unwrap();
    assert_eq!(entries.len(), 1000);

    daemon.stop();
}

#[test]
fn pipelined_requests_answer_in_order() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();

    let mut stream = UnixStream::connect(&daemon.socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    // Three ping frames with ids 10, 11, 12 in a single write.
    let mut burst = Vec::new();
    for id in 10u32..13 {
        burst.extend_from_slice(&[0x56, 0x10, 0x01, 0x05, 0x00, 0x00, 0x00]);
        burst.extend_from_slice(&id.to_le_bytes());
        burst.push(0x40);
    }
    stream.write_all(&burst).unwrap();

    for id in 10u32..13 {
        let mut reply = [0u8; 16];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply[7..11], &id.to_le_bytes());
        assert_eq!(reply[11], 0); // ok
        assert_eq!(&reply[12..], b"pong");
    }

    daemon.stop();
}

#[test]
fn unknown_command_and_shutdown() {
    let _g = DAEMON_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let daemon = DaemonHandle::start();
    let mut client = daemon.client();

    // An unrecognized command code answers status=err, "unknown command".
    let mut stream = UnixStream::connect(&daemon.socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let frame: [u8; 12] = [
        0x56, 0x10, 0x01, 0x05, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0xEE,
    ];
    stream.write_all(&frame).unwrap();
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_le_bytes([header[3], header[4], header[5], header[6]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    assert_eq!(&body[..4], &[0x07, 0x00, 0x00, 0x00]); // echoed request id
    assert_eq!(body[4], 1); // status=err
    assert_eq!(&body[5..], b"unknown command");

    // Requests on one connection answer strictly in order.
    for _ in 0..5 {
        assert_eq!(client.ping().unwrap(), "pong");
    }

    let msg = client.shutdown().unwrap();
    assert_eq!(msg, "shutting down");

    // The daemon loop exits and removes its socket and pid file.
    let socket = daemon.socket.clone();
    let pid_file = daemon.state_dir.path().join("velos.pid");
    daemon.stop();
    assert!(!socket.exists());
    assert!(!pid_file.exists());
}
