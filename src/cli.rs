use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{build_info, daemon};

#[derive(Debug, Parser)]
#[command(name = "velosd", version, about = "velos process manager daemon")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Debug, Subcommand)]
pub enum Cmd {
    /// Run the daemon event loop until shutdown
    Daemon {
        /// Control socket path (default: <state-dir>/velos.sock)
        #[arg(long = "socket")]
        socket: Option<PathBuf>,
        /// Directory for the socket, pid file, state snapshot, and logs
        #[arg(long = "state-dir")]
        state_dir: Option<PathBuf>,
    },
    /// Print local build info
    Version,
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.cmd {
        Cmd::Version => {
            println!("{}", build_info::banner());
            Ok(())
        }
        Cmd::Daemon { socket, state_dir } => {
            let state_dir = state_dir.unwrap_or_else(default_state_dir);
            daemon::run(&state_dir, socket.as_deref())
        }
    }
}

fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(".velos"),
        _ => PathBuf::from("/tmp/velos"),
    }
}
