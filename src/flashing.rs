//! Bootloader session and chunked flash transfers.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bootloader::{Bootloader, BootloaderInfo};
use crate::constants::{DEFAULT_BAUD_RATE, DEFAULT_VERIFY_RETRIES, MAX_CHUNK_SIZE};
use crate::device::{DeviceDb, DeviceDescriptor};
use crate::error::{Error, Result};
use crate::format::Parser;
use crate::handshake::{self, EntryStrategy, Handshake};
use crate::protocol::{self, ErasePages};
use crate::transport::{ConnectionState, SerialTransport, Transport};

/// How a session is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub baud_rate: u32,
    pub strategy: EntryStrategy,
    /// Skip the mode handshake, the bootloader is already synchronized at this baud rate.
    pub resume: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            baud_rate: DEFAULT_BAUD_RATE,
            strategy: EntryStrategy::default(),
            resume: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    pub erase: ErasePages,
    pub verify: bool,
    /// Rewrites of a chunk that failed verification before giving up.
    pub retries: u32,
    pub chunk_size: usize,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            erase: ErasePages::All,
            verify: false,
            retries: DEFAULT_VERIFY_RETRIES,
            chunk_size: MAX_CHUNK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Transferring,
    Done,
    Failed,
}

/// Bytes moved so far, reported once per chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub done: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.done >= self.total
    }
}

/// A synchronized and identified bootloader.
pub struct Flashing<T: Transport> {
    bootloader: Bootloader<T>,
    device: DeviceDescriptor,
    info: BootloaderInfo,
    baud_rate: u32,
    state: TransferState,
    cancel: Option<Arc<AtomicBool>>,
}

impl Flashing<SerialTransport> {
    /// Open `port`, or the first serial port found, and connect.
    pub fn new_from_serial(port: Option<&str>, db: &DeviceDb, options: &ConnectOptions) -> Result<Self> {
        let transport = match port {
            Some(port) => SerialTransport::open(port, options.baud_rate)?,
            None => SerialTransport::open_any(options.baud_rate)?,
        };
        Self::connect(transport, db, options)
    }
}

impl<T: Transport> Flashing<T> {
    /// Bring the device into its bootloader and identify it.
    pub fn connect(transport: T, db: &DeviceDb, options: &ConnectOptions) -> Result<Self> {
        let mut bootloader = Bootloader::new(transport);

        if options.resume {
            log::info!("Resuming bootloader connection");
            bootloader
                .transport_mut()
                .configure(&ConnectionState::bootloader(options.baud_rate))?;
        } else {
            Handshake::new(&mut bootloader, options.baud_rate, options.strategy).run()?;
        }

        let (info, device) = bootloader.get_info(db)?;
        log::debug!("found device: {}", device);

        Ok(Flashing {
            bootloader,
            device,
            info,
            baud_rate: options.baud_rate,
            state: TransferState::Idle,
            cancel: None,
        })
    }

    pub fn device(&self) -> &DeviceDescriptor {
        &self.device
    }

    pub fn info(&self) -> &BootloaderInfo {
        &self.info
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Checked before every chunk; once set the transfer stops with `Cancelled`.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub fn dump_info(&self) {
        let dev = &self.device;
        log::info!("Version      : 0x{:02x}", self.info.version);
        log::info!("Option 1     : 0x{:02x}", self.info.option_bytes[0]);
        log::info!("Option 2     : 0x{:02x}", self.info.option_bytes[1]);
        log::info!("Device ID    : {}", dev);
        log::info!(
            "RAM          : {}KiB  ({}b reserved by bootloader)",
            (dev.ram.end & 0x000f_ffff) / 1024,
            dev.ram.start & 0x000f_ffff
        );
        log::info!(
            "Flash        : {}KiB (sector size: {}x{})",
            dev.flash.size() / 1024,
            dev.flash.pages_per_sector,
            dev.flash.page_size
        );
        log::info!("Option RAM   : {}b", dev.option_bytes.len());
        log::info!("System RAM   : {}KiB", dev.system_memory.len() / 1024);
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    fn transfer<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.state = TransferState::Transferring;
        let result = f(self);
        self.state = match result {
            Ok(()) => TransferState::Done,
            Err(_) => TransferState::Failed,
        };
        result
    }

    /// Read the whole flash into `sink`.
    pub fn read<F>(&mut self, sink: &mut dyn Parser, chunk_size: usize, progress: F) -> Result<()>
    where
        F: FnMut(Progress),
    {
        let range = self.device.flash.start..self.device.flash.end;
        self.read_range(range, sink, chunk_size, progress)
    }

    pub fn read_range<F>(
        &mut self,
        range: Range<u32>,
        sink: &mut dyn Parser,
        chunk_size: usize,
        mut progress: F,
    ) -> Result<()>
    where
        F: FnMut(Progress),
    {
        protocol::check_chunk_len(chunk_size)?;
        let flash = self.device.flash.range();
        if range.is_empty() || range.start < flash.start || range.end > flash.end {
            return Err(Error::InvalidRequest(format!(
                "range 0x{:08x}..0x{:08x} is outside flash 0x{:08x}..0x{:08x}",
                range.start, range.end, flash.start, flash.end
            )));
        }

        self.transfer(|this| {
            let total = (range.end - range.start) as usize;
            let mut buf = vec![0u8; chunk_size];
            let mut addr = range.start;
            log::info!("{} bytes to transfer", total);

            while addr < range.end {
                this.check_cancelled()?;
                let len = chunk_size.min((range.end - addr) as usize);
                this.bootloader.read_memory(addr, &mut buf[..len])?;
                sink.write(&buf[..len])?;
                addr += len as u32;
                progress(Progress {
                    done: (addr - range.start) as usize,
                    total,
                });
            }
            Ok(())
        })
    }

    /// Erase, then write `image` from the start of flash.
    pub fn write<F>(&mut self, image: &mut dyn Parser, options: &WriteOptions, mut progress: F) -> Result<()>
    where
        F: FnMut(Progress),
    {
        protocol::check_chunk_len(options.chunk_size)?;
        let size = image.size();
        let capacity = self.device.flash.size() as usize;
        if size == 0 {
            return Err(Error::Image("image is empty".into()));
        }
        if size > capacity {
            return Err(Error::Image(format!(
                "File provided larger than available flash space ({} > {} bytes)",
                size, capacity
            )));
        }
        if let ErasePages::First(n) = options.erase
            && u32::from(n) > self.device.flash.page_count()
        {
            return Err(Error::InvalidRequest(format!(
                "cannot erase {} pages, {} has {}",
                n,
                self.device,
                self.device.flash.page_count()
            )));
        }
        if let Some(base) = image.base_address()
            && base != self.device.flash.start
        {
            log::warn!(
                "Image is based at 0x{:08x}, writing it at flash start 0x{:08x}",
                base,
                self.device.flash.start
            );
        }

        self.transfer(|this| {
            match options.erase {
                ErasePages::None => log::warn!("Skipping flash erase"),
                pages => {
                    log::info!("Erasing flash ({:?})", pages);
                    this.bootloader.erase_memory(pages)?;
                }
            }

            let mut buf = vec![0u8; options.chunk_size];
            let mut readback = vec![0u8; options.chunk_size];
            let mut addr = this.device.flash.start;
            let mut offset = 0;
            log::info!("{} bytes to transfer", size);

            while offset < size {
                this.check_cancelled()?;
                let len = options.chunk_size.min(size - offset);
                let n = image.read(&mut buf[..len])?;
                if n != len {
                    return Err(Error::Image(format!(
                        "image ended after {} of {} bytes",
                        offset + n,
                        size
                    )));
                }
                this.write_chunk(addr, &buf[..len], &mut readback[..len], options)?;
                addr += len as u32;
                offset += len;
                progress(Progress { done: offset, total: size });
            }

            if options.verify {
                log::info!("Verify OK");
            }
            Ok(())
        })
    }

    /// Write one chunk, rewriting it while verification keeps failing.
    fn write_chunk(
        &mut self,
        address: u32,
        data: &[u8],
        readback: &mut [u8],
        options: &WriteOptions,
    ) -> Result<()> {
        let mut failures = 0;
        loop {
            self.bootloader.write_memory(address, data)?;
            if !options.verify {
                return Ok(());
            }

            self.bootloader.read_memory(address, readback)?;
            let mismatch = data.iter().zip(readback.iter()).position(|(a, b)| a != b);
            let Some(i) = mismatch else {
                return Ok(());
            };

            if failures == options.retries {
                return Err(Error::VerifyMismatch {
                    address: address + i as u32,
                    expected: data[i],
                    actual: readback[i],
                });
            }
            failures += 1;
            log::warn!(
                "Verify failed at 0x{:08x}, rewriting chunk ({}/{})",
                address + i as u32,
                failures,
                options.retries
            );
        }
    }

    /// Remove the flash write protection. The device resets, ending the session.
    pub fn unprotect(self) -> Result<T> {
        log::info!("Write-unprotecting flash");
        let transport = self.bootloader.write_unprotect()?;
        log::info!("Done.");
        Ok(transport)
    }

    /// Start the code at `address`, or at the start of flash. The session ends
    /// once the device accepted the command.
    pub fn execute(self, address: Option<u32>) -> Result<T> {
        let address = address.unwrap_or(self.device.flash.start);
        log::info!("Starting execution at address 0x{:08x}", address);
        let transport = self.bootloader.go(address)?;
        log::info!("done.");
        Ok(transport)
    }

    /// Have the VEX master reset the Cortex into its user program.
    pub fn reset_target(self) -> Result<T> {
        let mut transport = self.bootloader.into_transport();
        handshake::reset_target(&mut transport, self.baud_rate)?;
        Ok(transport)
    }
}
