//! velosd: a single-host process manager daemon.
//!
//! The daemon starts, monitors, restarts, and terminates child processes
//! according to declarative per-process configuration, captures their output
//! to ring buffers and rotated files, and serves a length-framed binary
//! protocol over a local socket. One thread, one event loop; see
//! [`daemon::Daemon`] for the wiring.

pub mod build_info;
pub mod channel;
pub mod cli;
pub mod client;
pub mod cron;
pub mod daemon;
pub mod error;
pub mod event;
pub mod fd;
pub mod log_collector;
pub mod log_writer;
pub mod process;
pub mod protocol;
pub mod ring_buffer;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod watcher;

pub use error::VelosError;
pub use process::{ProcessConfig, ProcessStatus};
