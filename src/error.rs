//! Error taxonomy shared by the client and server engines.

use crate::protocol::status;

/// Errors produced by transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Local filesystem failure (stat, open, read, write, remove).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ChangeDir target or DownloadFile source does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection or stream failure in the RPC substrate.
    #[error("transport error: {0}")]
    Transport(String),

    /// Required metadata absent or malformed.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, TransferError>;

impl TransferError {
    /// Maps an I/O error raised while resolving a path, turning a missing
    /// entry into `NotFound`.
    pub fn from_lookup(err: std::io::Error, what: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            TransferError::NotFound(what.to_string())
        } else {
            TransferError::Io(err)
        }
    }

    /// Status code carried in a STATUS frame for this error.
    pub fn status_code(&self) -> u8 {
        match self {
            TransferError::Io(_) | TransferError::Transport(_) => status::IO,
            TransferError::NotFound(_) => status::NOT_FOUND,
            TransferError::Protocol(_) => status::PROTOCOL,
        }
    }

    /// Message carried in a STATUS frame, without the variant prefix.
    pub fn status_message(&self) -> String {
        match self {
            TransferError::Io(e) => e.to_string(),
            TransferError::NotFound(m) | TransferError::Transport(m) | TransferError::Protocol(m) => {
                m.clone()
            }
        }
    }

    /// Rebuilds a remote failure from a non-OK STATUS frame.
    pub fn from_status(code: u8, message: String) -> Self {
        match code {
            status::NOT_FOUND => TransferError::NotFound(message),
            status::PROTOCOL => TransferError::Protocol(message),
            status::IO => TransferError::Io(std::io::Error::other(message)),
            other => TransferError::Protocol(format!("unknown status {}: {}", other, message)),
        }
    }
}
