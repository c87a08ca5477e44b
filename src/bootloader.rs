//! Command engine of the STM32 USART bootloader.
//!
//! One command is in flight at a time: opcode and complement, an ACK within the
//! reply timeout, then any parameter phase with its own ACK. A command is attempted
//! exactly once; callers own the retry policy.

use std::time::Duration;

use scroll::Pread;

use crate::constants::{SYNC, timing};
use crate::device::{DeviceDb, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::protocol::{self, Command, ErasePages, Reply};
use crate::transport::Transport;

/// Outcome of the auto-baud byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    /// The bootloader measured the baud rate from this byte.
    Fresh,
    /// The bootloader was already synchronized and refused the byte.
    AlreadySynced,
}

/// Answer to the GET command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub version: u8,
    pub commands: Vec<u8>,
}

/// What the bootloader tells about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// BCD version, 0x22 is 2.2.
    pub version: u8,
    pub option_bytes: [u8; 2],
    pub commands: Vec<u8>,
    pub device_id: u16,
}

impl BootloaderInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }
}

pub struct Bootloader<T: Transport> {
    transport: T,
}

impl<T: Transport> Bootloader<T> {
    pub fn new(transport: T) -> Self {
        Bootloader { transport }
    }

    /// Raw access for the out-of-band VEX traffic.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, raw: &[u8]) -> Result<()> {
        log::trace!("=> {}", hex::encode(raw));
        self.transport.send_raw(raw)
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.transport.recv_raw(buf, timeout)?;
        log::trace!("<= {}", hex::encode(&*buf));
        Ok(())
    }

    fn read_reply(&mut self, timeout: Duration) -> Result<Reply> {
        let mut byte = [0u8; 1];
        self.recv(&mut byte, timeout)?;
        Reply::from_byte(byte[0])
    }

    fn await_ack(&mut self, command: Command, timeout: Duration) -> Result<()> {
        match self.read_reply(timeout)? {
            Reply::Ack => Ok(()),
            Reply::Nack => Err(Error::Nack(command)),
        }
    }

    /// ACK of an address-carrying parameter phase, mapping NACK to `on_nack`.
    fn await_param_ack(&mut self, timeout: Duration, on_nack: Error) -> Result<()> {
        match self.read_reply(timeout)? {
            Reply::Ack => Ok(()),
            Reply::Nack => Err(on_nack),
        }
    }

    fn send_command(&mut self, command: Command) -> Result<()> {
        log::trace!("command {:?}", command);
        self.send(&command.frame())?;
        self.await_ack(command, timing::REPLY_TIMEOUT)
    }

    /// Send the auto-baud byte once.
    pub fn negotiate(&mut self) -> Result<Negotiation> {
        self.send(&[SYNC])?;
        match self.read_reply(timing::REPLY_TIMEOUT)? {
            Reply::Ack => Ok(Negotiation::Fresh),
            Reply::Nack => Ok(Negotiation::AlreadySynced),
        }
    }

    pub fn get(&mut self) -> Result<Capabilities> {
        self.send_command(Command::Get)?;
        let mut n = [0u8; 1];
        self.recv(&mut n, timing::REPLY_TIMEOUT)?;
        let mut data = vec![0u8; n[0] as usize + 1];
        self.recv(&mut data, timing::REPLY_TIMEOUT)?;
        self.await_ack(Command::Get, timing::REPLY_TIMEOUT)?;

        Ok(Capabilities {
            version: data[0],
            commands: data[1..].to_vec(),
        })
    }

    /// Version and the two option bytes.
    pub fn get_version(&mut self) -> Result<(u8, [u8; 2])> {
        self.send_command(Command::GetVersion)?;
        let mut data = [0u8; 3];
        self.recv(&mut data, timing::REPLY_TIMEOUT)?;
        self.await_ack(Command::GetVersion, timing::REPLY_TIMEOUT)?;
        Ok((data[0], [data[1], data[2]]))
    }

    pub fn get_id(&mut self) -> Result<u16> {
        self.send_command(Command::GetId)?;
        let mut n = [0u8; 1];
        self.recv(&mut n, timing::REPLY_TIMEOUT)?;
        let mut data = vec![0u8; n[0] as usize + 1];
        self.recv(&mut data, timing::REPLY_TIMEOUT)?;
        self.await_ack(Command::GetId, timing::REPLY_TIMEOUT)?;

        if data.len() < 2 {
            return Err(Error::Framing(n[0]));
        }
        Ok(data.pread_with::<u16>(0, scroll::BE)?)
    }

    /// Identify the bootloader and resolve the part in `db`.
    pub fn get_info(&mut self, db: &DeviceDb) -> Result<(BootloaderInfo, DeviceDescriptor)> {
        let caps = self.get()?;
        let (version, option_bytes) = self.get_version()?;
        let device_id = self.get_id()?;
        log::debug!(
            "bootloader v{:x} (GET reported v{:x}), commands {}",
            version,
            caps.version,
            hex::encode(&caps.commands)
        );

        let device = db.find(device_id)?.clone();
        let info = BootloaderInfo {
            version,
            option_bytes,
            commands: caps.commands,
            device_id,
        };
        Ok((info, device))
    }

    /// Read `buf.len()` bytes (at most 256) starting at `address`.
    pub fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        protocol::check_chunk_len(buf.len())?;
        let address_frame = protocol::address_frame(address)?;
        let length_frame = protocol::length_frame(buf.len())?;

        self.send_command(Command::ReadMemory)?;
        self.send(&address_frame)?;
        self.await_param_ack(timing::REPLY_TIMEOUT, Error::WriteProtected { address })?;
        self.send(&length_frame)?;
        self.await_param_ack(
            timing::REPLY_TIMEOUT,
            Error::Rejected {
                command: Command::ReadMemory,
                address,
            },
        )?;
        self.recv(buf, timing::REPLY_TIMEOUT)
    }

    /// Write `data` (at most 256 bytes) starting at `address`.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let address_frame = protocol::address_frame(address)?;
        let payload = protocol::payload_frame(data)?;
        let rejected = || Error::Rejected {
            command: Command::WriteMemory,
            address,
        };

        self.send_command(Command::WriteMemory)?;
        self.send(&address_frame)?;
        self.await_param_ack(timing::REPLY_TIMEOUT, rejected())?;
        self.send(&payload)?;
        self.await_param_ack(timing::WRITE_TIMEOUT, rejected())
    }

    pub fn erase_memory(&mut self, pages: ErasePages) -> Result<()> {
        let frame = protocol::erase_frame(pages)?;

        self.send_command(Command::Erase)?;
        self.send(&frame)?;
        self.await_ack(Command::Erase, timing::ERASE_TIMEOUT)
    }

    /// Lift the flash write protection. The device resets after acknowledging, so
    /// the engine is consumed and only the transport comes back.
    pub fn write_unprotect(mut self) -> Result<T> {
        self.send_command(Command::WriteUnprotect)?;
        self.await_ack(Command::WriteUnprotect, timing::ERASE_TIMEOUT)?;
        Ok(self.transport)
    }

    /// Start executing at `address`. Nothing is read after the address is sent:
    /// whatever the target prints next belongs to the started program.
    pub fn go(mut self, address: u32) -> Result<T> {
        let address_frame = protocol::address_frame(address)?;
        self.send_command(Command::Go)?;
        self.send(&address_frame)?;
        Ok(self.transport)
    }
}
