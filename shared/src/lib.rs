/*!
# Shared Types and Utilities

This crate contains the wire formats and pure signal logic shared by the
thermal inspection line components. Nothing in here performs I/O.

## Core Types

- [`BitIndex`] - Position of a signal bit inside a 16-bit PLC word
- [`EdgeDetector`] - Rising/falling edge tracking over one monitored word
- [`MdiFrame`] - One decoded laser scan packet
- [`ProximityDetector`] - Hysteretic "too close" warning over recent frames

## Modules

- [`plc_word`] - PLC word bit manipulation and edge detection
- [`mdi`] - Laser MDI packet parsing, encoding and CRC
- [`window`] - Sliding-window distance statistics
- [`error`] - Common error types
*/

pub mod error;
pub mod mdi;
pub mod plc_word;
pub mod window;

// Re-export commonly used types
pub use error::{Result, SharedError};
pub use mdi::{MdiFrame, MdiHeader, PacketType};
pub use plc_word::{BitIndex, EdgeDetector};
pub use window::{ProximityDetector, WarningParams, WarningTransition, WindowHit};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Synchronization marker that starts every MDI packet ("LEUZ")
    pub const MDI_SYNC: [u8; 4] = [0x4C, 0x45, 0x55, 0x5A];

    /// Size of the fixed MDI header in bytes (sync included)
    pub const MDI_HEADER_SIZE: usize = 31;

    /// Size of the trailing CRC16 in bytes
    pub const MDI_CRC_SIZE: usize = 2;

    /// Smallest packet that can carry a header and a CRC
    pub const MDI_MIN_PACKET: usize = MDI_HEADER_SIZE + MDI_CRC_SIZE;

    /// Largest packet the sensor emits
    pub const MDI_MAX_PACKET: usize = 1433;

    /// Offset of the big-endian declared packet size
    pub const MDI_SIZE_OFFSET: usize = 5;

    /// CRC16 generator polynomial used by the sensor
    pub const MDI_CRC_POLY: u16 = 0x90D9;

    /// Start-streaming command: STX + "cWN SendMDI" + ETX
    pub const MDI_START_COMMAND: [u8; 13] = [
        0x02, 0x63, 0x57, 0x4E, 0x20, 0x53, 0x65, 0x6E, 0x64, 0x4D, 0x44, 0x49, 0x03,
    ];

    /// Substitute distance for a zero (invalid) reading
    pub const INVALID_DISTANCE: u32 = 1_000_000;

    /// Number of bits in one PLC data word
    pub const PLC_WORD_BITS: u8 = 16;
}
