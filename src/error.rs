//! Error types for cortexflash.

use std::io;

use thiserror::Error;

use crate::protocol::Command;

/// Result type for cortexflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for cortexflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the serial port or an image file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port could not be opened or configured.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No reply arrived before the timeout.
    #[error("No response from device")]
    NoResponse,

    /// Device answered NACK to a command.
    #[error("Device rejected {0:?} command")]
    Nack(Command),

    /// A reply byte that is neither ACK nor NACK.
    #[error("Unexpected reply byte 0x{0:02x}")]
    Framing(u8),

    /// The product id is not in the device table.
    #[error("Unknown device id 0x{0:04x}")]
    UnknownDevice(u16),

    /// The address phase of a read was refused.
    #[error("Failed to read memory at address 0x{address:08x}, target write-protected?")]
    WriteProtected { address: u32 },

    /// A parameter phase of an addressed command was refused.
    #[error("Device rejected {command:?} at address 0x{address:08x}")]
    Rejected { command: Command, address: u32 },

    #[error("Frame encoding error: {0}")]
    Encoding(#[from] scroll::Error),

    /// The VEX master did not answer the system status query.
    #[error("No VEX system detected")]
    DeviceNotDetected,

    /// Read-back did not match after the retry budget was spent.
    #[error(
        "Failed to verify at address 0x{address:08x}, expected 0x{expected:02x} and found 0x{actual:02x}"
    )]
    VerifyMismatch { address: u32, expected: u8, actual: u8 },

    /// The firmware image is unusable.
    #[error("Image error: {0}")]
    Image(String),

    /// The file is not in the format a parser expects.
    #[error("Unrecognized image format: {0}")]
    UnrecognizedFormat(String),

    /// A request was rejected before any device I/O.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transfer cancelled")]
    Cancelled,
}
