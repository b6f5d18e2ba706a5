//! Wire codec for the control socket.
//!
//! Every message is a 7-byte frame header (magic, version, little-endian
//! payload length) followed by the payload. Inside the payload a request is
//! `u32 id, u8 command, bytes...` and a response is `u32 id, u8 status,
//! bytes...`. Field primitives are little-endian fixed-width integers and
//! `u32`-length-prefixed byte strings.
//!
//! Decoders never read past the provided slice: underflow on a required field
//! is a `Protocol` error, never a silent zero. Trailing fields added to the
//! protocol over time are optional on read; absent ones take the documented
//! defaults so old clients keep working against new daemons and vice versa.

use crate::error::VelosError;

pub const MAGIC: [u8; 2] = [0x56, 0x10];
pub const VERSION: u8 = 0x01;
pub const HEADER_SIZE: usize = 7;
/// Hard cap on a single frame payload.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

// Wire defaults substituted for absent trailing fields of the extended
// `process_start` payload.
pub const DEFAULT_KILL_TIMEOUT_MS: u32 = 5000;
pub const DEFAULT_MAX_RESTARTS: i32 = 15;
pub const DEFAULT_MIN_UPTIME_MS: u64 = 1000;
pub const DEFAULT_WATCH_DELAY_MS: u32 = 1000;
pub const DEFAULT_LISTEN_TIMEOUT_MS: u32 = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    ProcessStart = 0x01,
    ProcessStop = 0x02,
    ProcessRestart = 0x03,
    ProcessDelete = 0x04,
    ProcessList = 0x05,
    ProcessInfo = 0x06,
    ProcessScale = 0x07,
    LogRead = 0x10,
    StateSave = 0x30,
    StateLoad = 0x31,
    Ping = 0x40,
    Shutdown = 0x41,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::ProcessStart),
            0x02 => Some(Self::ProcessStop),
            0x03 => Some(Self::ProcessRestart),
            0x04 => Some(Self::ProcessDelete),
            0x05 => Some(Self::ProcessList),
            0x06 => Some(Self::ProcessInfo),
            0x07 => Some(Self::ProcessScale),
            0x10 => Some(Self::LogRead),
            0x30 => Some(Self::StateSave),
            0x31 => Some(Self::StateLoad),
            0x40 => Some(Self::Ping),
            0x41 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Err = 1,
}

// ---------------------------------------------------------------
// Frame header
// ---------------------------------------------------------------

pub fn encode_header(payload_len: u32) -> [u8; HEADER_SIZE] {
    let len = payload_len.to_le_bytes();
    [MAGIC[0], MAGIC[1], VERSION, len[0], len[1], len[2], len[3]]
}

pub fn decode_header(buf: &[u8]) -> Result<u32, VelosError> {
    if buf.len() < HEADER_SIZE {
        return Err(VelosError::Protocol("truncated header".into()));
    }
    if buf[0] != MAGIC[0] || buf[1] != MAGIC[1] {
        return Err(VelosError::Protocol(format!(
            "invalid magic: [{:#04x}, {:#04x}]",
            buf[0], buf[1]
        )));
    }
    if buf[2] != VERSION {
        return Err(VelosError::Protocol(format!(
            "unsupported protocol version: {}",
            buf[2]
        )));
    }
    let len = u32::from_le_bytes([buf[3], buf[4], buf[5], buf[6]]);
    if len as usize > MAX_PAYLOAD {
        return Err(VelosError::PayloadTooLarge(len as usize));
    }
    Ok(len)
}

// ---------------------------------------------------------------
// Payload primitives
// ---------------------------------------------------------------

/// Append-only payload builder. Every write returns the number of bytes it
/// appended so callers can chain and account.
#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn put_u8(&mut self, v: u8) -> usize {
        self.buf.push(v);
        1
    }

    pub fn put_u32(&mut self, v: u32) -> usize {
        self.buf.extend_from_slice(&v.to_le_bytes());
        4
    }

    pub fn put_i32(&mut self, v: i32) -> usize {
        self.buf.extend_from_slice(&v.to_le_bytes());
        4
    }

    pub fn put_u64(&mut self, v: u64) -> usize {
        self.buf.extend_from_slice(&v.to_le_bytes());
        8
    }

    pub fn put_bool(&mut self, v: bool) -> usize {
        self.put_u8(if v { 1 } else { 0 })
    }

    pub fn put_str(&mut self, s: &str) -> usize {
        self.put_bytes(s.as_bytes())
    }

    /// Length-prefixed byte string. UTF-8 is not enforced at this layer.
    pub fn put_bytes(&mut self, b: &[u8]) -> usize {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
        4 + b.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a payload slice. `take_*` methods fail on underflow; the
/// `_or` variants substitute a default when the buffer ends before the field
/// (the extension mechanism for trailing fields).
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn take_u8(&mut self) -> Result<u8, VelosError> {
        if self.remaining() < 1 {
            return Err(VelosError::Protocol("truncated u8".into()));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn take_u32(&mut self) -> Result<u32, VelosError> {
        if self.remaining() < 4 {
            return Err(VelosError::Protocol("truncated u32".into()));
        }
        let v = u32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn take_i32(&mut self) -> Result<i32, VelosError> {
        if self.remaining() < 4 {
            return Err(VelosError::Protocol("truncated i32".into()));
        }
        let v = i32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    pub fn take_u64(&mut self) -> Result<u64, VelosError> {
        if self.remaining() < 8 {
            return Err(VelosError::Protocol("truncated u64".into()));
        }
        let v = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    pub fn take_bytes(&mut self) -> Result<Vec<u8>, VelosError> {
        let len = self.take_u32()? as usize;
        if self.remaining() < len {
            return Err(VelosError::Protocol("truncated string".into()));
        }
        let b = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(b)
    }

    pub fn take_str(&mut self) -> Result<String, VelosError> {
        let b = self.take_bytes()?;
        String::from_utf8(b).map_err(|e| VelosError::Protocol(format!("invalid utf8: {e}")))
    }

    // Optional trailing fields: a field that starts past end-of-buffer is
    // absent and takes the default. A field that starts in-bounds but is cut
    // short is a truncation error as usual.

    pub fn take_u8_or(&mut self, default: u8) -> Result<u8, VelosError> {
        if self.remaining() == 0 {
            return Ok(default);
        }
        self.take_u8()
    }

    pub fn take_u32_or(&mut self, default: u32) -> Result<u32, VelosError> {
        if self.remaining() == 0 {
            return Ok(default);
        }
        self.take_u32()
    }

    pub fn take_i32_or(&mut self, default: i32) -> Result<i32, VelosError> {
        if self.remaining() == 0 {
            return Ok(default);
        }
        self.take_i32()
    }

    pub fn take_u64_or(&mut self, default: u64) -> Result<u64, VelosError> {
        if self.remaining() == 0 {
            return Ok(default);
        }
        self.take_u64()
    }

    pub fn take_bool_or(&mut self, default: bool) -> Result<bool, VelosError> {
        Ok(self.take_u8_or(if default { 1 } else { 0 })? != 0)
    }

    pub fn take_str_or_empty(&mut self) -> Result<String, VelosError> {
        if self.remaining() == 0 {
            return Ok(String::new());
        }
        self.take_str()
    }
}

// ---------------------------------------------------------------
// Request / response envelopes
// ---------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Request {
    pub id: u32,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Request {
    /// Frame a request: header + id + command + payload.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = 4 + 1 + self.payload.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.extend_from_slice(&encode_header(body_len as u32));
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Decode a request body (the payload of a frame, header already
    /// stripped). The id and command are required leading fields.
    pub fn decode(body: &[u8]) -> Result<Self, VelosError> {
        if body.len() < 5 {
            return Err(VelosError::Protocol("request body too short".into()));
        }
        let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        Ok(Self {
            id,
            command: body[4],
            payload: body[5..].to_vec(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub id: u32,
    pub status: Status,
    pub payload: Vec<u8>,
}

impl Response {
    pub fn ok(id: u32, payload: Vec<u8>) -> Self {
        Self { id, status: Status::Ok, payload }
    }

    pub fn err(id: u32, message: &str) -> Self {
        Self { id, status: Status::Err, payload: message.as_bytes().to_vec() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let body_len = 4 + 1 + self.payload.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.extend_from_slice(&encode_header(body_len as u32));
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.push(self.status as u8);
        buf.extend_from_slice(&self.payload);
        buf
    }

    pub fn decode(body: &[u8]) -> Result<Self, VelosError> {
        if body.len() < 5 {
            return Err(VelosError::Protocol("response body too short".into()));
        }
        let id = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let status = match body[4] {
            0 => Status::Ok,
            1 => Status::Err,
            other => {
                return Err(VelosError::Protocol(format!(
                    "unknown response status: {other}"
                )))
            }
        };
        Ok(Self { id, status, payload: body[5..].to_vec() })
    }

    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}

// ---------------------------------------------------------------
// Command payloads
// ---------------------------------------------------------------

/// `process_start` request payload. Everything after `interpreter` is a
/// trailing extension field with a wire default.
#[derive(Debug, Clone)]
pub struct StartPayload {
    pub name: String,
    pub script: String,
    pub cwd: String,
    pub interpreter: String,
    pub kill_timeout_ms: u32,
    pub autorestart: bool,
    pub max_restarts: i32,
    pub min_uptime_ms: u64,
    pub restart_delay_ms: u32,
    pub exp_backoff: bool,
    pub max_memory_restart: u64,
    pub watch: bool,
    pub watch_delay_ms: u32,
    pub watch_paths: String,
    pub watch_ignore: String,
    pub cron_restart: String,
    pub wait_ready: bool,
    pub listen_timeout_ms: u32,
    pub shutdown_with_message: bool,
    pub instances: u32,
}

impl StartPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.name);
        w.put_str(&self.script);
        w.put_str(&self.cwd);
        w.put_str(&self.interpreter);
        w.put_u32(self.kill_timeout_ms);
        w.put_bool(self.autorestart);
        w.put_i32(self.max_restarts);
        w.put_u64(self.min_uptime_ms);
        w.put_u32(self.restart_delay_ms);
        w.put_bool(self.exp_backoff);
        w.put_u64(self.max_memory_restart);
        w.put_bool(self.watch);
        w.put_u32(self.watch_delay_ms);
        w.put_str(&self.watch_paths);
        w.put_str(&self.watch_ignore);
        w.put_str(&self.cron_restart);
        w.put_bool(self.wait_ready);
        w.put_u32(self.listen_timeout_ms);
        w.put_bool(self.shutdown_with_message);
        w.put_u32(self.instances);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, VelosError> {
        let mut r = WireReader::new(data);
        // name and script are required; the rest degrade to defaults.
        Ok(Self {
            name: r.take_str()?,
            script: r.take_str()?,
            cwd: r.take_str_or_empty()?,
            interpreter: r.take_str_or_empty()?,
            kill_timeout_ms: r.take_u32_or(DEFAULT_KILL_TIMEOUT_MS)?,
            autorestart: r.take_bool_or(false)?,
            max_restarts: r.take_i32_or(DEFAULT_MAX_RESTARTS)?,
            min_uptime_ms: r.take_u64_or(DEFAULT_MIN_UPTIME_MS)?,
            restart_delay_ms: r.take_u32_or(0)?,
            exp_backoff: r.take_bool_or(false)?,
            max_memory_restart: r.take_u64_or(0)?,
            watch: r.take_bool_or(false)?,
            watch_delay_ms: r.take_u32_or(DEFAULT_WATCH_DELAY_MS)?,
            watch_paths: r.take_str_or_empty()?,
            watch_ignore: r.take_str_or_empty()?,
            cron_restart: r.take_str_or_empty()?,
            wait_ready: r.take_bool_or(false)?,
            listen_timeout_ms: r.take_u32_or(DEFAULT_LISTEN_TIMEOUT_MS)?,
            shutdown_with_message: r.take_bool_or(false)?,
            instances: r.take_u32_or(1)?,
        })
    }
}

impl Default for StartPayload {
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
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopPayload {
    pub process_id: u32,
    pub signal: u8,
    pub timeout_ms: u32,
}

impl StopPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.process_id);
        w.put_u8(self.signal);
        w.put_u32(self.timeout_ms);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, VelosError> {
        let mut r = WireReader::new(data);
        Ok(Self {
            process_id: r.take_u32()?,
            signal: r.take_u8_or(0)?,
            timeout_ms: r.take_u32_or(0)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScalePayload {
    pub name: String,
    pub target: u32,
}

impl ScalePayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_str(&self.name);
        w.put_u32(self.target);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, VelosError> {
        let mut r = WireReader::new(data);
        Ok(Self { name: r.take_str()?, target: r.take_u32()? })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LogReadPayload {
    pub process_id: u32,
    pub lines: u32,
}

impl LogReadPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        w.put_u32(self.process_id);
        w.put_u32(self.lines);
        w.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, VelosError> {
        let mut r = WireReader::new(data);
        Ok(Self { process_id: r.take_u32()?, lines: r.take_u32()? })
    }
}

// Result payloads decoded by clients (list / detail / logs / scale).

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub id: u32,
    pub name: String,
    pub pid: u32,
    pub status: u8,
    pub memory_bytes: u64,
    pub uptime_ms: u64,
    pub restart_count: u32,
}

pub fn decode_process_list(data: &[u8]) -> Result<Vec<ListEntry>, VelosError> {
    let mut r = WireReader::new(data);
    let count = r.take_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        out.push(ListEntry {
            id: r.take_u32()?,
            name: r.take_str()?,
            pid: r.take_u32()?,
            status: r.take_u8()?,
            memory_bytes: r.take_u64()?,
            uptime_ms: r.take_u64()?,
            restart_count: r.take_u32()?,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone)]
pub struct DetailEntry {
    pub id: u32,
    pub name: String,
    pub pid: u32,
    pub status: u8,
    pub memory_bytes: u64,
    pub uptime_ms: u64,
    pub restart_count: u32,
    pub consecutive_crashes: u32,
    pub last_restart_ms: u64,
    pub script: String,
    pub cwd: String,
    pub interpreter: String,
    pub kill_timeout_ms: u32,
    pub autorestart: bool,
    pub max_restarts: i32,
    pub min_uptime_ms: u64,
    pub restart_delay_ms: u32,
    pub exp_backoff: bool,
    pub max_memory_restart: u64,
    pub watch: bool,
    pub cron_restart: String,
    pub wait_ready: bool,
    pub shutdown_with_message: bool,
}

pub fn decode_process_detail(data: &[u8]) -> Result<DetailEntry, VelosError> {
    let mut r = WireReader::new(data);
    Ok(DetailEntry {
        id: r.take_u32()?,
        name: r.take_str()?,
        pid: r.take_u32()?,
        status: r.take_u8()?,
        memory_bytes: r.take_u64()?,
        uptime_ms: r.take_u64()?,
        restart_count: r.take_u32()?,
        consecutive_crashes: r.take_u32()?,
        last_restart_ms: r.take_u64()?,
        script: r.take_str()?,
        cwd: r.take_str()?,
        interpreter: r.take_str()?,
        kill_timeout_ms: r.take_u32()?,
        autorestart: r.take_u8()? != 0,
        max_restarts: r.take_i32()?,
        min_uptime_ms: r.take_u64()?,
        restart_delay_ms: r.take_u32()?,
        exp_backoff: r.take_u8()? != 0,
        max_memory_restart: r.take_u64()?,
        watch: r.take_u8()? != 0,
        cron_restart: r.take_str()?,
        wait_ready: r.take_u8()? != 0,
        shutdown_with_message: r.take_u8()? != 0,
    })
}

#[derive(Debug, Clone)]
pub struct WireLogEntry {
    pub timestamp_ms: u64,
    pub level: u8,
    pub stream: u8,
    pub message: Vec<u8>,
}

pub fn decode_log_entries(data: &[u8]) -> Result<Vec<WireLogEntry>, VelosError> {
    let mut r = WireReader::new(data);
    let count = r.take_u32()? as usize;
    let mut out = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        out.push(WireLogEntry {
            timestamp_ms: r.take_u64()?,
            level: r.take_u8()?,
            stream: r.take_u8()?,
            message: r.take_bytes()?,
        });
    }
    Ok(out)
}
