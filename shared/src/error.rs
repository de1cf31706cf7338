/*!
Common error types for the thermal inspection line components.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Errors raised while decoding device wire formats
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SharedError {
    /// Packet shorter than header plus CRC
    #[error("packet too short: {0} bytes")]
    PacketTooShort(usize),

    /// Packet does not start with the sync marker
    #[error("bad sync marker")]
    BadSync,

    /// Declared packet size outside the accepted bounds
    #[error("declared packet size {declared} invalid for {available} available bytes")]
    InvalidPacketSize { declared: usize, available: usize },

    /// Payload too short for the declared number of spots
    #[error("payload too short: need {needed} bytes, have {available}")]
    PayloadTooShort { needed: usize, available: usize },

    /// Bit position outside a 16-bit word
    #[error("bit index {0} out of range (0-15)")]
    InvalidBit(u8),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SharedError {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the error concerns packet framing rather than configuration
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Config(_) | Self::InvalidBit(_))
    }
}
