//! Abstract serial transport interface.
use std::time::Duration;

use serialport::{Parity, StopBits};

use crate::error::Result;

pub use self::serial::{Baudrate, SerialTransport};

mod serial;

#[cfg(test)]
pub(crate) mod mock;

/// Line parameters of the link. Data bits are always 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// RTS level.
    pub rts: bool,
}

impl ConnectionState {
    /// Settings of the bootloader protocol phases.
    pub fn bootloader(baud_rate: u32) -> Self {
        ConnectionState {
            baud_rate,
            parity: Parity::Even,
            stop_bits: StopBits::One,
            rts: false,
        }
    }

    /// Settings of the VEX master command phases.
    pub fn vendor(baud_rate: u32) -> Self {
        ConnectionState {
            parity: Parity::None,
            ..Self::bootloader(baud_rate)
        }
    }
}

/// Abstraction of the byte link to the target.
///
/// All reads block until the buffer is full or the timeout expires, in which case
/// the implementation returns [`Error::NoResponse`](crate::Error::NoResponse).
pub trait Transport {
    /// Apply baud rate, parity and stop bits. The RTS level is left alone.
    fn configure(&mut self, line: &ConnectionState) -> Result<()>;
    fn send_raw(&mut self, raw: &[u8]) -> Result<()>;
    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()>;
    fn set_rts(&mut self, level: bool) -> Result<()>;
    /// Drop anything already received.
    fn discard_input(&mut self) -> Result<()>;

    /// Settling wait between line changes.
    fn delay(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn configure(&mut self, line: &ConnectionState) -> Result<()> {
        (**self).configure(line)
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        (**self).send_raw(raw)
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        (**self).recv_raw(buf, timeout)
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        (**self).set_rts(level)
    }

    fn discard_input(&mut self) -> Result<()> {
        (**self).discard_input()
    }

    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration)
    }
}
