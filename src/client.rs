//! Blocking client for the daemon's control socket. The operator CLI, the
//! API surfaces, and this crate's own end-to-end tests all talk through it.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::error::VelosError;
use crate::protocol::{
    self, Command, DetailEntry, ListEntry, LogReadPayload, Request, Response, ScalePayload,
    StartPayload, Status, StopPayload, WireReader, WireWriter,
};

pub struct Client {
    stream: UnixStream,
    next_id: u32,
}

impl Client {
    pub fn connect(socket_path: &Path) -> Result<Self, VelosError> {
        let stream = UnixStream::connect(socket_path).map_err(VelosError::Io)?;
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .map_err(VelosError::Io)?;
        Ok(Self { stream, next_id: 1 })
    }

    /// One framed request/response exchange. Response ids echo request ids.
    pub fn request(&mut self, command: Command, payload: Vec<u8>) -> Result<Response, VelosError> {
        let id = self.next_id;
        self.next_id += 1;
        let req = Request { id, command: command as u8, payload };
        self.stream.write_all(&req.encode()).map_err(VelosError::Io)?;

        let mut header = [0u8; protocol::HEADER_SIZE];
        self.stream.read_exact(&mut header).map_err(VelosError::Io)?;
        let len = protocol::decode_header(&header)? as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).map_err(VelosError::Io)?;
        let resp = Response::decode(&body)?;
        if resp.id != id {
            return Err(VelosError::Protocol(format!(
                "response id {} for request {id}",
                resp.id
            )));
        }
        Ok(resp)
    }

    fn expect_ok(&mut self, command: Command, payload: Vec<u8>) -> Result<Vec<u8>, VelosError> {
        let resp = self.request(command, payload)?;
        match resp.status {
            Status::Ok => Ok(resp.payload),
            Status::Err => Err(VelosError::Server(resp.error_message())),
        }
    }

    pub fn ping(&mut self) -> Result<String, VelosError> {
        let payload = self.expect_ok(Command::Ping, Vec::new())?;
        Ok(String::from_utf8_lossy(&payload).to_string())
    }

    /// Returns the first started process id.
    pub fn start(&mut self, spec: &StartPayload) -> Result<u32, VelosError> {
        let payload = self.expect_ok(Command::ProcessStart, spec.encode())?;
        WireReader::new(&payload).take_u32()
    }

    pub fn stop(&mut self, id: u32, signal: u8, timeout_ms: u32) -> Result<(), VelosError> {
        let p = StopPayload { process_id: id, signal, timeout_ms };
        self.expect_ok(Command::ProcessStop, p.encode())?;
        Ok(())
    }

    pub fn restart(&mut self, id: u32) -> Result<(), VelosError> {
        let mut w = WireWriter::new();
        w.put_u32(id);
        self.expect_ok(Command::ProcessRestart, w.into_bytes())?;
        Ok(())
    }

    pub fn delete(&mut self, id: u32) -> Result<(), VelosError> {
        let mut w = WireWriter::new();
        w.put_u32(id);
        self.expect_ok(Command::ProcessDelete, w.into_bytes())?;
        Ok(())
    }

    pub fn list(&mut self) -> Result<Vec<ListEntry>, VelosError> {
        let payload = self.expect_ok(Command::ProcessList, Vec::new())?;
        protocol::decode_process_list(&payload)
    }

    pub fn info(&mut self, id: u32) -> Result<DetailEntry, VelosError> {
        let mut w = WireWriter::new();
        w.put_u32(id);
        let payload = self.expect_ok(Command::ProcessInfo, w.into_bytes())?;
        protocol::decode_process_detail(&payload)
    }

    /// Returns (started, stopped).
    pub fn scale(&mut self, name: &str, target: u32) -> Result<(u32, u32), VelosError> {
        let p = ScalePayload { name: name.to_string(), target };
        let payload = self.expect_ok(Command::ProcessScale, p.encode())?;
        let mut r = WireReader::new(&payload);
        Ok((r.take_u32()?, r.take_u32()?))
    }

    pub fn log_read(
        &mut self,
        id: u32,
        lines: u32,
    ) -> Result<Vec<protocol::WireLogEntry>, VelosError> {
        let p = LogReadPayload { process_id: id, lines };
        let payload = self.expect_ok(Command::LogRead, p.encode())?;
        protocol::decode_log_entries(&payload)
    }

    pub fn state_save(&mut self) -> Result<(), VelosError> {
        self.expect_ok(Command::StateSave, Vec::new())?;
        Ok(())
    }

    /// Returns how many processes were resurrected.
    pub fn state_load(&mut self) -> Result<u32, VelosError> {
        let payload = self.expect_ok(Command::StateLoad, Vec::new())?;
        WireReader::new(&payload).take_u32()
    }

    pub fn shutdown(&mut self) -> Result<String, VelosError> {
        let payload = self.expect_ok(Command::Shutdown, Vec::new())?;
        Ok(String::from_utf8_lossy(&payload).to_string())
    }
}
