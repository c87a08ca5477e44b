//! Serial Transportation.
use std::{
    fmt::Display,
    io::{self, Read, Write},
    time::Duration,
};

use clap::{ValueEnum, builder::PossibleValue};
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort};

use super::{ConnectionState, Transport};
use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Baudrate {
    Baud9600,
    Baud19200,
    Baud38400,
    Baud57600,
    #[default]
    Baud115200,
    Baud230400,
}

impl From<Baudrate> for u32 {
    fn from(value: Baudrate) -> Self {
        match value {
            Baudrate::Baud9600 => 9600,
            Baudrate::Baud19200 => 19200,
            Baudrate::Baud38400 => 38400,
            Baudrate::Baud57600 => 57600,
            Baudrate::Baud115200 => 115200,
            Baudrate::Baud230400 => 230400,
        }
    }
}

impl Display for Baudrate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

impl ValueEnum for Baudrate {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            Baudrate::Baud9600,
            Baudrate::Baud19200,
            Baudrate::Baud38400,
            Baudrate::Baud57600,
            Baudrate::Baud115200,
            Baudrate::Baud230400,
        ]
    }

    fn to_possible_value(&self) -> Option<PossibleValue> {
        match self {
            Baudrate::Baud9600 => Some(PossibleValue::new("9600").alias("Baud9600")),
            Baudrate::Baud19200 => Some(PossibleValue::new("19200").alias("Baud19200")),
            Baudrate::Baud38400 => Some(PossibleValue::new("38400").alias("Baud38400")),
            Baudrate::Baud57600 => Some(PossibleValue::new("57600").alias("Baud57600")),
            Baudrate::Baud115200 => Some(PossibleValue::new("115200").alias("Baud115200")),
            Baudrate::Baud230400 => Some(PossibleValue::new("230400").alias("Baud230400")),
        }
    }
}

pub struct SerialTransport {
    serial_port: Box<dyn SerialPort>,
    name: String,
}

impl SerialTransport {
    pub fn scan_ports() -> Result<Vec<String>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }

    /// Open `port` with the bootloader line settings.
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        log::info!("Opening serial port: \"{}\" @ {} baud", port, baud_rate);
        let line = ConnectionState::bootloader(baud_rate);
        let serial_port = serialport::new(port, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(line.parity)
            .stop_bits(line.stop_bits)
            .flow_control(FlowControl::None)
            .timeout(crate::constants::timing::REPLY_TIMEOUT)
            .open()?;
        Ok(SerialTransport {
            serial_port,
            name: port.to_string(),
        })
    }

    pub fn open_nth(nth: usize, baud_rate: u32) -> Result<Self> {
        let ports = serialport::available_ports()?;

        match ports.get(nth) {
            Some(port) => Self::open(&port.port_name, baud_rate),
            None => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "No serial ports found!",
            ))),
        }
    }

    pub fn open_any(baud_rate: u32) -> Result<Self> {
        Self::open_nth(0, baud_rate)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for SerialTransport {
    fn configure(&mut self, line: &ConnectionState) -> Result<()> {
        log::debug!(
            "{}: {} baud, parity {:?}, stop bits {:?}",
            self.name,
            line.baud_rate,
            line.parity,
            line.stop_bits
        );
        self.serial_port.set_baud_rate(line.baud_rate)?;
        self.serial_port.set_data_bits(DataBits::Eight)?;
        self.serial_port.set_parity(line.parity)?;
        self.serial_port.set_stop_bits(line.stop_bits)?;
        Ok(())
    }

    fn send_raw(&mut self, raw: &[u8]) -> Result<()> {
        self.serial_port.write_all(raw)?;
        self.serial_port.flush()?;
        Ok(())
    }

    fn recv_raw(&mut self, buf: &mut [u8], timeout: Duration) -> Result<()> {
        self.serial_port.set_timeout(timeout)?;
        match self.serial_port.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Err(Error::NoResponse),
            Err(e) => Err(e.into()),
        }
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        self.serial_port.write_request_to_send(level)?;
        Ok(())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.serial_port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}
