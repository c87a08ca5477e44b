//! Bringing a VEX Cortex into its STM32 bootloader.
//!
//! The Cortex may already sit in the bootloader (operator pressed the program
//! button, or a previous run left it there), possibly already past auto-baud. Only
//! when it stays silent is it asked through the VEX master processor to restart into
//! the bootloader.

use std::time::Duration;

use crate::bootloader::{Bootloader, Negotiation};
use crate::constants::{timing, vendor};
use crate::error::{Error, Result};
use crate::transport::{ConnectionState, Transport};

/// How the Cortex is told to restart into its bootloader.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum EntryStrategy {
    /// Only check the VEX master is there, the operator enters the bootloader.
    Skip,
    /// Vendor "enter bootloader" command through the VEX master.
    #[default]
    Command,
    /// RTS pulse train at 9600 baud, for old programming cables.
    ControlLine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Unknown,
    Probing,
    AlreadyInBootloader,
    NeedsEntry,
    HandshakeSent,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    UsbTether,
    UsbDirect,
    VexNet1,
    VexNet2,
    Unknown,
}

/// Decoded answer of the VEX master to the system status query.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStatus {
    pub joystick_firmware: (u8, u8),
    pub master_firmware: (u8, u8),
    pub joystick_battery: f32,
    pub cortex_battery: f32,
    pub backup_battery: f32,
    pub link: Link,
}

const VOLTS_PER_LSB: f32 = 0.059;

impl SystemStatus {
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        if reply.len() != vendor::STATUS_REPLY_LEN || !reply.starts_with(&vendor::STATUS_HEADER) {
            return None;
        }
        let p = &reply[vendor::STATUS_HEADER.len()..];
        let flags = p[7];
        let link = if flags & 0x30 == 0x10 {
            Link::UsbTether
        } else if flags & 0x30 == 0x20 {
            Link::UsbDirect
        } else if flags & 0x34 == 0x00 {
            Link::VexNet1
        } else if flags & 0x04 == 0x04 {
            Link::VexNet2
        } else {
            Link::Unknown
        };

        Some(SystemStatus {
            joystick_firmware: (p[0], p[1]),
            master_firmware: (p[2], p[3]),
            joystick_battery: p[4] as f32 * VOLTS_PER_LSB,
            cortex_battery: p[5] as f32 * VOLTS_PER_LSB,
            backup_battery: p[6] as f32 * VOLTS_PER_LSB,
            link,
        })
    }

    pub fn log(&self) {
        log::info!("Connection       : {:?}", self.link);
        if self.link != Link::UsbDirect {
            log::info!(
                "Joystick firmware: {}.{:02}",
                self.joystick_firmware.0,
                self.joystick_firmware.1
            );
        }
        log::info!(
            "Master firmware  : {}.{:02}",
            self.master_firmware.0,
            self.master_firmware.1
        );
        log::info!("Joystick battery : {:.2}V", self.joystick_battery);
        log::info!("Cortex battery   : {:.2}V", self.cortex_battery);
        log::info!("Backup battery   : {:.2}V", self.backup_battery);
    }
}

/// Query the VEX master once. `None` when it did not answer with a status frame.
pub fn system_status<T: Transport>(transport: &mut T) -> Result<Option<SystemStatus>> {
    log::info!("Send system status request");
    // the Cortex may still be streaming user output
    transport.discard_input()?;
    transport.send_raw(&vendor_command(vendor::SYSTEM_STATUS))?;

    let mut reply = [0u8; vendor::STATUS_REPLY_LEN];
    match transport.recv_raw(&mut reply, timing::STATUS_TIMEOUT) {
        Ok(()) => {}
        Err(Error::NoResponse) => return Ok(None),
        Err(e) => return Err(e),
    }
    log::debug!("Status {}", hex::encode(reply));
    Ok(SystemStatus::from_reply(&reply))
}

/// Ask the VEX master to reset the Cortex back into user code.
pub fn reset_target<T: Transport>(transport: &mut T, baud_rate: u32) -> Result<()> {
    transport.configure(&ConnectionState::vendor(baud_rate))?;
    transport.delay(timing::LINE_SETTLE);
    log::info!("Send reset slave command");
    repeat_vendor_command(transport, vendor::RESET_TARGET)
}

fn vendor_command(op: u8) -> [u8; 5] {
    let p = vendor::PREFIX;
    [p[0], p[1], p[2], p[3], op]
}

fn repeat_vendor_command<T: Transport>(transport: &mut T, op: u8) -> Result<()> {
    let frame = vendor_command(op);
    for _ in 0..vendor::COMMAND_REPEAT {
        transport.send_raw(&frame)?;
    }
    transport.delay(timing::ENTRY_SETTLE);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    InBootloader,
    Silent,
}

/// Drives one connection from an unknown device mode to a synchronized bootloader.
pub struct Handshake<'a, T: Transport> {
    bootloader: &'a mut Bootloader<T>,
    strategy: EntryStrategy,
    baud_rate: u32,
    line: ConnectionState,
    state: HandshakeState,
    probes: usize,
}

impl<'a, T: Transport> Handshake<'a, T> {
    pub fn new(bootloader: &'a mut Bootloader<T>, baud_rate: u32, strategy: EntryStrategy) -> Self {
        Handshake {
            bootloader,
            strategy,
            baud_rate,
            line: ConnectionState::bootloader(baud_rate),
            state: HandshakeState::Unknown,
            probes: 0,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Auto-baud bytes sent while probing.
    pub fn probe_attempts(&self) -> usize {
        self.probes
    }

    pub fn connection(&self) -> &ConnectionState {
        &self.line
    }

    pub fn run(&mut self) -> Result<()> {
        let result = self.drive();
        if result.is_err() {
            self.transition(HandshakeState::Failed);
        }
        result
    }

    fn drive(&mut self) -> Result<()> {
        self.transition(HandshakeState::Probing);
        self.bootloader_line()?;
        self.settle(timing::LINE_SETTLE);

        match self.probe()? {
            Probe::InBootloader => self.transition(HandshakeState::AlreadyInBootloader),
            Probe::Silent => {
                self.transition(HandshakeState::NeedsEntry);
                self.enter_bootloader()?;
                self.transition(HandshakeState::HandshakeSent);
            }
        }

        self.bootloader_line()?;
        self.settle(timing::LINE_SETTLE);
        // RTS must be low for the Cortex to leave reset
        self.set_rts(false)?;
        self.settle(timing::LINE_SETTLE);

        if self.state == HandshakeState::HandshakeSent {
            self.synchronize()?;
        }
        self.transition(HandshakeState::Ready);
        Ok(())
    }

    fn transition(&mut self, next: HandshakeState) {
        log::debug!("handshake: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn settle(&mut self, duration: Duration) {
        self.bootloader.transport_mut().delay(duration);
    }

    fn apply_line(&mut self, line: ConnectionState) -> Result<()> {
        self.bootloader.transport_mut().configure(&line)?;
        self.line = ConnectionState {
            rts: self.line.rts,
            ..line
        };
        Ok(())
    }

    fn bootloader_line(&mut self) -> Result<()> {
        self.apply_line(ConnectionState::bootloader(self.baud_rate))
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.bootloader.transport_mut().set_rts(level)?;
        self.line.rts = level;
        Ok(())
    }

    fn probe(&mut self) -> Result<Probe> {
        for attempt in 1..=timing::PROBE_ATTEMPTS {
            self.probes = attempt;
            match self.bootloader.negotiate() {
                Ok(Negotiation::Fresh) => {
                    log::info!("Bootloader already waiting for commands");
                    return Ok(Probe::InBootloader);
                }
                Ok(Negotiation::AlreadySynced) => {
                    log::debug!("device is past auto-baud, checking status");
                    return match self.bootloader.get() {
                        Ok(caps) => {
                            log::info!("Bootloader v{:x} already active", caps.version);
                            Ok(Probe::InBootloader)
                        }
                        Err(e @ (Error::Io(_) | Error::Serial(_))) => Err(e),
                        Err(e) => {
                            log::debug!("status probe failed: {}", e);
                            Ok(Probe::Silent)
                        }
                    };
                }
                Err(Error::NoResponse) | Err(Error::Framing(_)) => {
                    log::debug!("probe {}: no reply", attempt);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Probe::Silent)
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        self.settle(timing::LINE_SETTLE);
        self.apply_line(ConnectionState::vendor(self.baud_rate))?;
        self.settle(timing::LINE_SETTLE);
        // some USB serial drivers drop the first bytes after a parity change
        self.bootloader.transport_mut().send_raw(&[0u8; 4])?;
        self.settle(timing::LINE_SETTLE);

        let mut status = None;
        for attempt in 1..=timing::STATUS_ATTEMPTS {
            if attempt > 1 {
                self.settle(timing::STATUS_RETRY_DELAY);
            }
            status = system_status(self.bootloader.transport_mut())?;
            if status.is_some() {
                break;
            }
        }
        let status = status.ok_or(Error::DeviceNotDetected)?;
        status.log();

        match self.strategy {
            EntryStrategy::Skip => {
                log::info!("Not sending bootloader start command");
                Ok(())
            }
            EntryStrategy::Command => {
                log::info!("Send bootloader start command");
                repeat_vendor_command(
                    self.bootloader.transport_mut(),
                    vendor::ENTER_BOOTLOADER,
                )
            }
            EntryStrategy::ControlLine => self.pulse_control_line(),
        }
    }

    fn pulse_control_line(&mut self) -> Result<()> {
        self.apply_line(ConnectionState::vendor(vendor::CONTROL_LINE_BAUD_RATE))?;
        log::info!("Send bootloader start command (RTS)");

        // the driver loses the first byte after a reconfiguration
        self.bootloader.transport_mut().send_raw(&[0x00])?;

        self.set_rts(true)?;
        self.settle(timing::RTS_PRE_PULSE);
        self.set_rts(false)?;
        self.settle(timing::RTS_LOW);
        self.set_rts(true)?;
        self.settle(timing::RTS_HIGH);
        self.bootloader
            .transport_mut()
            .send_raw(&[vendor::CONTROL_LINE_MARKER])?;
        self.settle(timing::MARKER_HOLD);
        self.set_rts(false)?;
        self.settle(timing::ENTRY_SETTLE);
        Ok(())
    }

    fn synchronize(&mut self) -> Result<()> {
        for attempt in 1..=timing::SYNC_ATTEMPTS {
            match self.bootloader.negotiate() {
                Ok(sync) => {
                    log::debug!("auto-baud: {:?}", sync);
                    return Ok(());
                }
                Err(e @ (Error::NoResponse | Error::Framing(_))) => {
                    log::warn!("Auto-baud attempt {} failed: {}", attempt, e);
                    self.settle(timing::SYNC_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoResponse)
    }
}
