//! Firmware image parsers.
//!
//! A parser turns a file into a linear byte buffer that is pulled chunk by chunk
//! while writing, or collects chunks while reading flash back.
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str;

use crate::error::{Error, Result};

/// Capability shared by all image formats.
pub trait Parser {
    fn name(&self) -> &'static str;

    /// Total image size in bytes.
    fn size(&self) -> usize;

    /// Copy the next bytes into `buf`, returning how many were copied.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Append data read from the device.
    fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flush anything pending to the backing file.
    fn close(&mut self) -> Result<()>;

    /// Load address recorded in the file, if the format has one.
    fn base_address(&self) -> Option<u32> {
        None
    }
}

/// Raw binary image, held in memory.
#[derive(Debug, Default)]
pub struct BinaryParser {
    data: Vec<u8>,
    pos: usize,
    output: Option<PathBuf>,
}

impl BinaryParser {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        Ok(Self::from_bytes(data))
    }

    /// Parser that writes what it receives to `path` on close. An existing file is
    /// left untouched until then.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        // fail early on an unwritable destination
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(BinaryParser {
            output: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        })
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        BinaryParser {
            data,
            pos: 0,
            output: None,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl Parser for BinaryParser {
    fn name(&self) -> &'static str {
        "Raw BINARY"
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(path) = self.output.take() {
            std::fs::write(&path, &self.data)?;
            log::debug!("Wrote {} bytes to {}", self.data.len(), path.display());
        }
        Ok(())
    }
}

/// Intel HEX image, flattened from its lowest address. Gaps read as erased flash.
#[derive(Debug)]
pub struct HexParser {
    base_address: u32,
    image: BinaryParser,
}

impl HexParser {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        Self::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let text = str::from_utf8(raw)
            .map_err(|e| Error::UnrecognizedFormat(format!("not a text file: {}", e)))?;
        let (base_address, data) = read_ihex(text)?;
        Ok(HexParser {
            base_address,
            image: BinaryParser::from_bytes(data),
        })
    }
}

impl Parser for HexParser {
    fn name(&self) -> &'static str {
        "Intel HEX"
    }

    fn size(&self) -> usize {
        self.image.size()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.image.read(buf)
    }

    fn write(&mut self, _data: &[u8]) -> Result<()> {
        Err(Error::Image("Intel HEX output is not supported".into()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn base_address(&self) -> Option<u32> {
        Some(self.base_address)
    }
}

/// Open an image for writing to flash: Intel HEX first, raw binary when the file is
/// not HEX or `force_binary` is set. Any other failure is returned as is.
pub fn open_image<P: AsRef<Path>>(path: P, force_binary: bool) -> Result<Box<dyn Parser>> {
    let p = path.as_ref();
    let parser: Box<dyn Parser> = if force_binary {
        Box::new(BinaryParser::open(p)?)
    } else {
        match HexParser::open(p) {
            Ok(hex) => {
                log::info!("HEX image based at 0x{:08x}", hex.base_address);
                Box::new(hex)
            }
            Err(Error::UnrecognizedFormat(reason)) => {
                log::debug!("{} is not Intel HEX: {}", p.display(), reason);
                Box::new(BinaryParser::open(p)?)
            }
            Err(e) => return Err(e),
        }
    };
    log::info!("Using Parser : {}", parser.name());
    Ok(parser)
}

/// Parse Intel HEX text into its base address and a flat image.
pub fn read_ihex(data: &str) -> Result<(u32, Vec<u8>)> {
    use ihex::Record;

    let mut base_address = 0;

    let mut records = vec![];
    for record in ihex::Reader::new(data) {
        let record = record.map_err(|e| Error::UnrecognizedFormat(e.to_string()))?;
        use Record::*;
        match record {
            Data { offset, value } => {
                let offset = base_address + offset as u32;

                records.push((offset, value.into()));
            }
            EndOfFile => (),
            ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            StartSegmentAddress { .. } => (),
            ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            StartLinearAddress(_) => (),
        };
    }
    if records.is_empty() {
        return Err(Error::UnrecognizedFormat("no data records".into()));
    }
    merge_sections(records)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<(u32, Vec<u8>)> {
    sections.sort(); // order by start address

    let start_address = sections[0].0;
    let end_address = sections
        .iter()
        .map(|(addr, data)| *addr as u64 + data.len() as u64)
        .max()
        .unwrap_or(start_address as u64);

    let total_size = (end_address - start_address as u64) as usize;

    let mut binary = vec![0xffu8; total_size];
    for (addr, sect) in sections {
        let sect_start = (addr - start_address) as usize;
        let sect_end = sect_start + sect.len();
        if binary[sect_start..sect_end].iter().any(|&b| b != 0xff) {
            log::warn!("Overlapping HEX records at 0x{:08x}", addr);
        }
        binary[sect_start..sect_end].copy_from_slice(&sect);
    }
    Ok((start_address, binary))
}
