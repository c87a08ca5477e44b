//! MCU memory geometry, keyed by the product id reported by the bootloader
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Half-open address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRange {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub end: u32,
}

impl MemoryRange {
    pub const fn len(&self) -> u32 {
        self.end - self.start
    }

    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.start && address < self.end
    }
}

/// Flash range and erase geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashGeometry {
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub start: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub end: u32,
    #[serde(deserialize_with = "parse_address_and_offset")]
    pub page_size: u32,
    pub pages_per_sector: u32,
}

impl FlashGeometry {
    pub const fn range(&self) -> MemoryRange {
        MemoryRange {
            start: self.start,
            end: self.end,
        }
    }

    pub const fn size(&self) -> u32 {
        self.end - self.start
    }

    pub const fn page_count(&self) -> u32 {
        self.size() / self.page_size
    }
}

/// Represents an STM32 part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    #[serde(deserialize_with = "parse_id")]
    pub id: u16,
    pub ram: MemoryRange,
    pub flash: FlashGeometry,
    pub option_bytes: MemoryRange,
    pub system_memory: MemoryRange,
}

impl ::std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(f, "0x{:04x} ({})", self.id, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Family {
    name: String,
    variants: Vec<DeviceDescriptor>,
}

/// Immutable device table.
#[derive(Debug, Clone)]
pub struct DeviceDb {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceDb {
    pub fn load() -> Result<Self> {
        Self::from_yaml(include_str!("../devices/stm32.yaml"))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let family: Family = serde_yaml::from_str(raw)
            .map_err(|e| Error::InvalidRequest(format!("device table: {}", e)))?;
        log::trace!(
            "Loaded {} {} device descriptors",
            family.variants.len(),
            family.name
        );
        Ok(DeviceDb {
            devices: family.variants,
        })
    }

    pub fn find(&self, id: u16) -> Result<&DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.id == id)
            .ok_or(Error::UnknownDevice(id))
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.devices
    }
}

fn parse_number(s: &str) -> std::result::Result<u32, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or(s.strip_prefix("0X")) {
        return u32::from_str_radix(hex, 16).map_err(|e| format!("{:?}: {}", s, e));
    }
    let (digits, scale) = if let Some(k) = s.strip_suffix("KiB").or(s.strip_suffix("KB")) {
        (k, 1024)
    } else if let Some(k) = s.strip_suffix('K') {
        (k, 1024)
    } else {
        (s, 1)
    };
    digits
        .parse::<u32>()
        .map(|v| v * scale)
        .map_err(|e| format!("{:?}: {}", s, e))
}

fn parse_address_and_offset<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = serde::Deserialize::deserialize(deserializer)?;
    parse_number(&s).map_err(serde::de::Error::custom)
}

fn parse_id<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let id = parse_address_and_offset(deserializer)?;
    u16::try_from(id).map_err(serde::de::Error::custom)
}
