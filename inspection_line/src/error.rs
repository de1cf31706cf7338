/*!
Error types for the inspection line orchestration layer.

The variants follow the operational taxonomy: a device link is down
(`Connection`), a device spoke garbage (`Protocol`), a wait ran out
(`Timeout`), or an explicit stop request aborted the work (`Cancelled`).
Only `Cancelled` unwinds without retry.
*/

use shared::SharedError;
use thiserror::Error;

/// Result type used throughout the inspection line crate
pub type Result<T> = std::result::Result<T, LineError>;

/// Errors surfaced by device clients and the sequencer
#[derive(Error, Debug)]
pub enum LineError {
    /// A PLC, robot, laser or camera link is down
    #[error("{device} connection error: {reason}")]
    Connection { device: String, reason: String },

    /// Malformed data from a device
    #[error("protocol error: {0}")]
    Protocol(#[from] SharedError),

    /// A bounded wait expired
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Aborted by an explicit stop request
    #[error("operation cancelled")]
    Cancelled,

    /// A single-flight operation is already in progress
    #[error("{0} already in progress")]
    Busy(&'static str),

    /// The robot session went away while waiting on it
    #[error("robot {0} session closed")]
    SessionClosed(u8),

    /// Error returned by the PLC in an MC response
    #[error("PLC error: end code 0x{0:04X}")]
    PlcEndCode(u16),

    /// Response from the PLC did not match the request
    #[error("invalid PLC response: {0}")]
    InvalidResponse(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LineError {
    /// Create a new connection error
    pub fn connection(device: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            device: device.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(what: impl Into<String>) -> Self {
        Self::Timeout(what.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error came from an explicit stop request
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
