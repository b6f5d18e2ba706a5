use std::io;

/// Daemon error taxonomy. Kinds cross the wire by name (the textual payload
/// of a status=err response), so variants map 1:1 onto stable names.
#[derive(Debug, thiserror::Error)]
pub enum VelosError {
    #[error("process not found: {0}")]
    ProcessNotFound(u32),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    /// Client-side: a status=err response, payload carried verbatim.
    #[error("daemon error: {0}")]
    Server(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl VelosError {
    /// Stable name sent back to clients in error responses.
    pub fn wire_message(&self) -> String {
        match self {
            Self::ProcessNotFound(_) => "ProcessNotFound".to_string(),
            Self::Protocol(_) => "Protocol".to_string(),
            Self::PayloadTooLarge(_) => "PayloadTooLarge".to_string(),
            Self::InvalidCron(_) => "InvalidCron".to_string(),
            Self::UnknownCommand(_) => "unknown command".to_string(),
            Self::Server(msg) => msg.clone(),
            // OS failures surface as the io::ErrorKind name (e.g. "NotFound",
            // "PermissionDenied"); clients may retry or report verbatim.
            Self::Io(e) => format!("{:?}", e.kind()),
        }
    }
}

pub type Result<T> = std::result::Result<T, VelosError>;
