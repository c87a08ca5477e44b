//! VEX Cortex flash loader, speaking the STM32 USART bootloader protocol.

pub mod bootloader;
pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod handshake;
pub mod protocol;
pub mod transport;

pub use self::bootloader::{Bootloader, BootloaderInfo};
pub use self::device::{DeviceDb, DeviceDescriptor};
pub use self::error::{Error, Result};
pub use self::flashing::{ConnectOptions, Flashing, Progress, TransferState, WriteOptions};
pub use self::handshake::{EntryStrategy, Handshake, HandshakeState};
pub use self::protocol::{Command, ErasePages};
pub use self::transport::{ConnectionState, SerialTransport, Transport};
