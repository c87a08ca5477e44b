//! In-memory VEX Cortex: the master processor answering vendor commands on the
//! no-parity line and an STM32 system bootloader behind it.
#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use cortexflash::constants::{ACK, GLOBAL_ERASE, NACK, SYNC, commands, vendor};
use cortexflash::{ConnectionState, Error, Result, Transport};
use serialport::Parity;

pub const FLASH_START: u32 = 0x0800_0000;
pub const FLASH_SIZE: usize = 512 * 1024;
pub const PAGE_SIZE: usize = 2048;
pub const DEVICE_ID: u16 = 0x0414;
pub const BL_VERSION: u8 = 0x22;

const SUPPORTED: [u8; 11] = [
    0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Running user code, only the master answers.
    UserProgram,
    /// Bootloader waiting for the auto-baud byte.
    AwaitingSync,
    /// Bootloader synchronized.
    Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opcode,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WritePayload(u32),
    EraseList,
    GoAddress,
}

pub struct SimState {
    pub mode: Mode,
    phase: Phase,
    line: Option<ConnectionState>,
    rts: bool,
    rts_history: Vec<bool>,
    marker_armed: bool,
    outgoing: VecDeque<u8>,

    pub flash: Vec<u8>,
    pub master_present: bool,
    pub read_protected: bool,
    pub write_protected: bool,
    corrupt: Option<(u32, usize)>,

    pub sync_bytes: usize,
    pub status_queries: usize,
    pub entry_commands: usize,
    pub target_resets: usize,
    pub unprotects: usize,
    pub erases: usize,
    pub writes: usize,
    pub rejected_frames: usize,
    pub executed_at: Option<u32>,
    pub total_delay: Duration,
}

impl SimState {
    fn new(mode: Mode) -> Self {
        SimState {
            mode,
            phase: Phase::Opcode,
            line: None,
            rts: false,
            rts_history: Vec::new(),
            marker_armed: false,
            outgoing: VecDeque::new(),
            flash: vec![0xff; FLASH_SIZE],
            master_present: true,
            read_protected: false,
            write_protected: false,
            corrupt: None,
            sync_bytes: 0,
            status_queries: 0,
            entry_commands: 0,
            target_resets: 0,
            unprotects: 0,
            erases: 0,
            writes: 0,
            rejected_frames: 0,
            executed_at: None,
            total_delay: Duration::ZERO,
        }
    }

    /// Flip the byte at `address` in the next `count` writes covering it.
    pub fn corrupt_writes(&mut self, address: u32, count: usize) {
        self.corrupt = Some((address, count));
    }

    pub fn flash_at(&self, address: u32, len: usize) -> &[u8] {
        let off = (address - FLASH_START) as usize;
        &self.flash[off..off + len]
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.outgoing.extend(bytes);
    }

    fn nack(&mut self) {
        self.rejected_frames += 1;
        self.phase = Phase::Opcode;
        self.reply(&[NACK]);
    }

    fn on_write(&mut self, raw: &[u8]) {
        let Some(line) = self.line else {
            return;
        };
        match line.parity {
            Parity::None => self.on_master_frame(line, raw),
            Parity::Even => self.on_bootloader_frame(raw),
            Parity::Odd => {}
        }
    }

    fn on_master_frame(&mut self, line: ConnectionState, raw: &[u8]) {
        if line.baud_rate == vendor::CONTROL_LINE_BAUD_RATE
            && raw == [vendor::CONTROL_LINE_MARKER]
            && self.rts
            && self.rts_history.ends_with(&[true, false, true])
        {
            self.marker_armed = true;
            return;
        }
        if !self.master_present || raw.len() != 5 || raw[..4] != vendor::PREFIX {
            return;
        }
        match raw[4] {
            vendor::SYSTEM_STATUS => {
                self.status_queries += 1;
                let mut status = vendor::STATUS_HEADER.to_vec();
                status.extend_from_slice(&[3, 21, 3, 20, 140, 135, 150, 0x20, 0, 0]);
                self.reply(&status);
            }
            vendor::ENTER_BOOTLOADER => {
                self.entry_commands += 1;
                self.restart(Mode::AwaitingSync);
            }
            vendor::RESET_TARGET => {
                self.target_resets += 1;
                self.restart(Mode::UserProgram);
            }
            _ => {}
        }
    }

    fn restart(&mut self, mode: Mode) {
        self.mode = mode;
        self.phase = Phase::Opcode;
    }

    fn set_rts(&mut self, level: bool) {
        if self.marker_armed && self.rts && !level {
            self.marker_armed = false;
            self.restart(Mode::AwaitingSync);
        }
        self.rts = level;
        self.rts_history.push(level);
    }

    fn on_bootloader_frame(&mut self, raw: &[u8]) {
        if raw == [SYNC] {
            self.sync_bytes += 1;
        }
        match self.mode {
            Mode::UserProgram => {}
            Mode::AwaitingSync => {
                if raw == [SYNC] {
                    self.mode = Mode::Commands;
                    self.reply(&[ACK]);
                }
            }
            Mode::Commands => self.on_command_frame(raw),
        }
    }

    fn on_command_frame(&mut self, raw: &[u8]) {
        match self.phase {
            Phase::Opcode => self.on_opcode(raw),
            Phase::ReadAddress => match self.checked_address(raw) {
                Some(address) if !self.read_protected && self.in_flash(address, 1) => {
                    self.phase = Phase::ReadLength(address);
                    self.reply(&[ACK]);
                }
                _ => self.nack(),
            },
            Phase::ReadLength(address) => {
                if raw.len() != 2 || raw[1] != !raw[0] {
                    return self.nack();
                }
                let len = raw[0] as usize + 1;
                if !self.in_flash(address, len) {
                    return self.nack();
                }
                let data = self.flash_at(address, len).to_vec();
                self.phase = Phase::Opcode;
                self.reply(&[ACK]);
                self.reply(&data);
            }
            Phase::WriteAddress => match self.checked_address(raw) {
                Some(address) if !self.write_protected && self.in_flash(address, 1) => {
                    self.phase = Phase::WritePayload(address);
                    self.reply(&[ACK]);
                }
                _ => self.nack(),
            },
            Phase::WritePayload(address) => self.on_payload(address, raw),
            Phase::EraseList => self.on_erase(raw),
            Phase::GoAddress => match self.checked_address(raw) {
                Some(address) => {
                    self.executed_at = Some(address);
                    self.reply(&[ACK]);
                    self.restart(Mode::UserProgram);
                }
                None => self.nack(),
            },
        }
    }

    fn on_opcode(&mut self, raw: &[u8]) {
        if raw == [SYNC] {
            // a second auto-baud byte is not a command
            return self.nack();
        }
        if raw.len() != 2 || raw[1] != !raw[0] {
            return self.nack();
        }
        match raw[0] {
            commands::GET => {
                self.reply(&[ACK, SUPPORTED.len() as u8, BL_VERSION]);
                self.reply(&SUPPORTED);
                self.reply(&[ACK]);
            }
            commands::GET_VERSION => self.reply(&[ACK, BL_VERSION, 0x00, 0x00, ACK]),
            commands::GET_ID => {
                let id = DEVICE_ID.to_be_bytes();
                self.reply(&[ACK, 1, id[0], id[1], ACK]);
            }
            commands::READ_MEMORY => {
                self.phase = Phase::ReadAddress;
                self.reply(&[ACK]);
            }
            commands::WRITE_MEMORY => {
                self.phase = Phase::WriteAddress;
                self.reply(&[ACK]);
            }
            commands::ERASE => {
                self.phase = Phase::EraseList;
                self.reply(&[ACK]);
            }
            commands::GO => {
                self.phase = Phase::GoAddress;
                self.reply(&[ACK]);
            }
            commands::WRITE_UNPROTECT => {
                self.unprotects += 1;
                self.write_protected = false;
                self.reply(&[ACK, ACK]);
                self.restart(Mode::AwaitingSync);
            }
            _ => self.nack(),
        }
    }

    fn checked_address(&self, raw: &[u8]) -> Option<u32> {
        if raw.len() != 5 || xor(&raw[..4]) != raw[4] {
            return None;
        }
        Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn in_flash(&self, address: u32, len: usize) -> bool {
        address >= FLASH_START && (address - FLASH_START) as usize + len <= FLASH_SIZE
    }

    fn on_payload(&mut self, address: u32, raw: &[u8]) {
        let Some((&sum, frame)) = raw.split_last() else {
            return self.nack();
        };
        let len = frame.first().map(|&n| n as usize + 1).unwrap_or(0);
        if frame.len() != len + 1 || len % 4 != 0 || xor(frame) != sum {
            return self.nack();
        }
        let data = &frame[1..];
        let len = data.len().min(FLASH_SIZE - (address - FLASH_START) as usize);
        let off = (address - FLASH_START) as usize;
        self.flash[off..off + len].copy_from_slice(&data[..len]);
        self.writes += 1;

        if let Some((target, remaining)) = self.corrupt
            && remaining > 0
            && target >= address
            && ((target - address) as usize) < len
        {
            let i = (target - FLASH_START) as usize;
            self.flash[i] ^= 0x5a;
            self.corrupt = Some((target, remaining - 1));
        }
        self.phase = Phase::Opcode;
        self.reply(&[ACK]);
    }

    fn on_erase(&mut self, raw: &[u8]) {
        self.phase = Phase::Opcode;
        if raw == [GLOBAL_ERASE, 0x00] {
            self.flash.fill(0xff);
            self.erases += 1;
            return self.reply(&[ACK]);
        }
        let Some((&sum, frame)) = raw.split_last() else {
            return self.nack();
        };
        let count = frame.first().map(|&n| n as usize + 1).unwrap_or(0);
        if frame.len() != count + 1 || xor(frame) != sum {
            return self.nack();
        }
        for &page in &frame[1..] {
            let off = page as usize * PAGE_SIZE;
            self.flash[off..off + PAGE_SIZE].fill(0xff);
        }
        self.erases += 1;
        self.reply(&[ACK]);
    }
}

fn xor(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Transport end of the simulated device.
pub struct SimulatedDevice {
    state: Rc<RefCell<SimState>>,
}

impl SimulatedDevice {
    pub fn new(mode: Mode) -> Self {
        SimulatedDevice {
            state: Rc::new(RefCell::new(SimState::new(mode))),
        }
    }

    /// Shared view on the device, still valid after the transport is consumed.
    pub fn handle(&self) -> Rc<RefCell<SimState>> {
        self.state.clone()
    }

    /// A second connection to the same device, as a new program run would open.
    pub fn reconnect(handle: &Rc<RefCell<SimState>>) -> Self {
        SimulatedDevice {
            state: handle.clone(),
        }
    }
}

impl Transport for SimulatedDevice {
    fn configure(&mut self, line: &ConnectionState) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.line = Some(*line);
        state.outgoing.clear();
        Ok(())
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.state.borrow_mut().on_write(raw);
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<()> {
        let mut state = self.state.borrow_mut();
        if state.outgoing.len() < buf.len() {
            state.outgoing.clear();
            return Err(Error::NoResponse);
        }
        let n = buf.len();
        for (dst, src) in buf.iter_mut().zip(state.outgoing.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.state.borrow_mut().set_rts(level);
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.state.borrow_mut().outgoing.clear();
        Ok(())
    }

    fn delay(&mut self, duration: Duration) {
        self.state.borrow_mut().total_delay += duration;
    }
}
