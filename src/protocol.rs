//! Frame encoding of the STM32 USART bootloader protocol (AN3155).
//!
//! Every command starts with the opcode followed by its complement. Commands with a
//! parameter phase append either a big-endian address or a length-prefixed list,
//! each closed by the XOR of the bytes before it.

use scroll::Pwrite;

use crate::constants::{self, commands, GLOBAL_ERASE, MAX_CHUNK_SIZE};
use crate::error::{Error, Result};

/// Bootloader command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Bootloader version and the list of supported commands.
    Get,
    /// Bootloader version and the two option bytes.
    GetVersion,
    /// Product identifier.
    GetId,
    /// Read up to 256 bytes from any readable address.
    ReadMemory,
    /// Jump to code in flash or RAM.
    Go,
    /// Write up to 256 bytes to RAM or flash.
    WriteMemory,
    /// Erase one to all flash pages.
    Erase,
    /// Disable the write protection of all sectors. The device resets after the ACK.
    WriteUnprotect,
}

impl Command {
    pub const fn opcode(self) -> u8 {
        match self {
            Command::Get => commands::GET,
            Command::GetVersion => commands::GET_VERSION,
            Command::GetId => commands::GET_ID,
            Command::ReadMemory => commands::READ_MEMORY,
            Command::Go => commands::GO,
            Command::WriteMemory => commands::WRITE_MEMORY,
            Command::Erase => commands::ERASE,
            Command::WriteUnprotect => commands::WRITE_UNPROTECT,
        }
    }

    /// Opcode and complement.
    pub const fn frame(self) -> [u8; 2] {
        let op = self.opcode();
        [op, !op]
    }
}

/// Single byte answer to a command or parameter phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    Nack,
}

impl Reply {
    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            constants::ACK => Ok(Reply::Ack),
            constants::NACK => Ok(Reply::Nack),
            other => Err(Error::Framing(other)),
        }
    }
}

/// Pages cleared before a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErasePages {
    /// Leave flash untouched.
    None,
    /// Pages `0..n`.
    First(u8),
    /// Global erase.
    #[default]
    All,
}

impl ErasePages {
    /// Map an operator page count in `[0, 255]`, where 255 selects a global erase.
    pub fn from_count(count: u32) -> Result<Self> {
        match count {
            0 => Ok(ErasePages::None),
            c if c == GLOBAL_ERASE as u32 => Ok(ErasePages::All),
            c if c < GLOBAL_ERASE as u32 => Ok(ErasePages::First(c as u8)),
            c => Err(Error::InvalidRequest(format!(
                "erase page count {} is outside 0..=255",
                c
            ))),
        }
    }
}

/// XOR of all bytes.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Big-endian address closed by its checksum.
pub fn address_frame(address: u32) -> Result<[u8; 5]> {
    let mut buf = [0u8; 5];
    buf.pwrite_with(address, 0, scroll::BE)?;
    buf[4] = checksum(&buf[..4]);
    Ok(buf)
}

/// Byte count of a read, as `len - 1` and its complement.
pub fn length_frame(len: usize) -> Result<[u8; 2]> {
    check_chunk_len(len)?;
    let n = (len - 1) as u8;
    Ok([n, !n])
}

/// Length-prefixed write payload, padded with 0xff to a multiple of four bytes.
pub fn payload_frame(data: &[u8]) -> Result<Vec<u8>> {
    check_chunk_len(data.len())?;
    let padded = data.len().next_multiple_of(4);

    let mut buf = Vec::with_capacity(padded + 2);
    buf.push((padded - 1) as u8);
    buf.extend_from_slice(data);
    buf.resize(1 + padded, 0xff);
    buf.push(checksum(&buf));
    Ok(buf)
}

/// Parameter phase of the erase command.
pub fn erase_frame(pages: ErasePages) -> Result<Vec<u8>> {
    match pages {
        ErasePages::All => Ok(vec![GLOBAL_ERASE, 0x00]),
        ErasePages::First(n) if n > 0 && n < GLOBAL_ERASE => {
            let mut buf = Vec::with_capacity(n as usize + 2);
            buf.push(n - 1);
            buf.extend(0..n);
            buf.push(checksum(&buf));
            Ok(buf)
        }
        other => Err(Error::InvalidRequest(format!(
            "{:?} has no erase frame",
            other
        ))),
    }
}

pub(crate) fn check_chunk_len(len: usize) -> Result<()> {
    if len == 0 || len > MAX_CHUNK_SIZE {
        return Err(Error::InvalidRequest(format!(
            "chunk of {} bytes, expected 1..={}",
            len, MAX_CHUNK_SIZE
        )));
    }
    Ok(())
}
